// ============================================================================
// tests/integration_test.rs - メモリ管理サブシステム統合テスト
// ============================================================================

use std::sync::Arc;

use galcore_mm::{
    AllocFlags, AllocatorDescriptor, AllocatorOps, DeviceConfig, GalDevice, GpuAddress,
    HalError, HalResult, LinearAllocation, OsConfig, OsContext, PhysAddr, PoolKind,
    PoolSelector, ProcessId, SurfaceKind, SystemRamConfig, DEFAULT_ALLOCATOR_TABLE,
    PAGE_SIZE_4K,
};

// ============================================================================
// ヘルパー
// ============================================================================

fn build_os(total_frames: usize, lowmem_frames: usize) -> Arc<OsContext> {
    Arc::new(
        OsContext::new(OsConfig {
            ram: SystemRamConfig {
                total_frames,
                lowmem_frames,
            },
            non_paged_cacheable: false,
        })
        .unwrap(),
    )
}

fn broken_allocator(_os: Arc<OsContext>) -> HalResult<Arc<dyn AllocatorOps>> {
    Err(HalError::GenericIo)
}

// ============================================================================
// 割り当てと巻き戻し
// ============================================================================

#[test]
fn test_scattered_partial_failure_unwinds_fully() {
    let os = build_os(32, 24);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();
    // RAM 32フレームでは連続プールは構築できない
    assert!(device.pool(PoolKind::Contiguous).is_none());

    let first = device.allocate_paged(20, AllocFlags::empty()).unwrap();
    let free_before = os.sysram().lock().free_frames();
    assert_eq!(free_before, 12);

    // 12ページ確保した後の13ページ目で失敗し、全てが巻き戻る
    let err = device.allocate_paged(20, AllocFlags::empty()).unwrap_err();
    assert_eq!(err, HalError::OutOfMemory);
    assert_eq!(os.sysram().lock().free_frames(), free_before);

    let stats = os.stats();
    assert_eq!(stats.index_fast_allocs, 2);
    assert_eq!(stats.index_fast_frees, 1);

    device.free(first);
    assert_eq!(os.sysram().lock().free_frames(), 32);
}

#[test]
fn test_reserved_marks_follow_mdl_lifetime() {
    let os = build_os(64, 48);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();

    let mdl = device.allocate_paged(4, AllocFlags::empty()).unwrap();
    let frames: Vec<_> = (0..4)
        .map(|i| mdl.storage().phys_of_page(i).unwrap().frame())
        .collect();
    {
        let ram = os.sysram().lock();
        for &frame in &frames {
            assert!(ram.is_reserved(frame));
        }
    }

    device.free(mdl);
    let ram = os.sysram().lock();
    for &frame in &frames {
        assert!(!ram.is_reserved(frame));
    }
}

#[test]
fn test_all_frames_return_after_free() {
    let os = build_os(256, 192);
    let device = GalDevice::construct(
        os.clone(),
        DeviceConfig {
            contiguous_size: 0,
            ..DeviceConfig::default()
        },
    )
    .unwrap();
    let baseline = os.sysram().lock().free_frames();

    let scattered = device.allocate_paged(24, AllocFlags::empty()).unwrap();
    let contiguous = device.allocate_paged(20, AllocFlags::CONTIGUOUS).unwrap();
    assert!(contiguous.is_contiguous());
    // オーダー丸めされた連続MDLは論理20ページで32フレーム占有
    assert_eq!(os.sysram().lock().free_frames(), baseline - 24 - 32);

    device.free(contiguous);
    device.free(scattered);
    assert_eq!(os.sysram().lock().free_frames(), baseline);
}

// ============================================================================
// ユーザマッピングと変換
// ============================================================================

#[test]
fn test_mapping_records_per_call() {
    let os = build_os(64, 48);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();
    let pid = ProcessId::new(100);
    os.register_process(pid);

    let mdl = device.allocate_paged(4, AllocFlags::empty()).unwrap();
    let ops = mdl.allocator();

    // 同一プロセスの2回のマップは独立した記録になる
    let first = ops.map_user(&mdl, pid, true).unwrap();
    let second = ops.map_user(&mdl, pid, true).unwrap();
    assert_ne!(first, second);
    assert_eq!(mdl.mapping_count_for(pid), 2);

    // それぞれの論理アドレスが同じ物理ページへ解決される
    let off = PAGE_SIZE_4K + 0x80;
    let p1 = ops.logical_to_physical(&mdl, first.add(off), pid).unwrap();
    let p2 = ops.logical_to_physical(&mdl, second.add(off), pid).unwrap();
    assert_eq!(p1, p2);

    // 片方を解除してももう片方は生きている
    ops.unmap_user(&mdl, pid, first, mdl.size_bytes()).unwrap();
    assert_eq!(mdl.mapping_count_for(pid), 1);
    assert!(ops.logical_to_physical(&mdl, second.add(off), pid).is_ok());
    assert_eq!(
        ops.logical_to_physical(&mdl, first.add(off), pid),
        Err(HalError::InvalidArgument)
    );

    ops.unmap_user(&mdl, pid, second, mdl.size_bytes()).unwrap();
    // 記録の無い解除は InvalidArgument
    assert_eq!(
        ops.unmap_user(&mdl, pid, second, mdl.size_bytes()),
        Err(HalError::InvalidArgument)
    );
    device.free(mdl);
}

#[test]
fn test_unmap_after_process_death_is_silent() {
    let os = build_os(64, 48);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();
    let pid = ProcessId::new(7);
    os.register_process(pid);

    let mdl = device.allocate_paged(2, AllocFlags::empty()).unwrap();
    let ops = mdl.allocator();
    let base = ops.map_user(&mdl, pid, false).unwrap();

    // プロセス消滅後の後始末でも記録は取り外され、エラーにならない
    assert!(os.remove_process(pid));
    ops.unmap_user(&mdl, pid, base, mdl.size_bytes()).unwrap();
    assert_eq!(mdl.mapping_count_for(pid), 0);
    device.free(mdl);
}

#[test]
fn test_physical_query_contract() {
    let os = build_os(64, 48);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();

    let contiguous = device.allocate_paged(4, AllocFlags::CONTIGUOUS).unwrap();
    let ops = contiguous.allocator();
    // 連続MDLはラン先頭から計算するのが正であり、ページ問い合わせは拒否
    assert_eq!(
        ops.physical(&contiguous, 0),
        Err(HalError::InvalidArgument)
    );
    device.free(contiguous);

    let scattered = device.allocate_paged(4, AllocFlags::empty()).unwrap();
    let ops = scattered.allocator();
    let phys = ops.physical(&scattered, 2 * PAGE_SIZE_4K + 0x10).unwrap();
    assert_eq!(
        phys,
        scattered.storage().phys_at(2 * PAGE_SIZE_4K + 0x10).unwrap()
    );
    assert_eq!(
        ops.physical(&scattered, scattered.size_bytes()),
        Err(HalError::InvalidArgument)
    );
    device.free(scattered);
}

// ============================================================================
// カーネルマッピングと実メモリ往復
// ============================================================================

#[test]
fn test_contiguous_kernel_map_write_read() {
    let os = build_os(128, 96);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();

    // 16ページの非キャッシュ連続バッファ
    let mdl = device.allocate_paged(16, AllocFlags::CONTIGUOUS).unwrap();
    assert!(!mdl.is_cacheable());
    let ops = mdl.allocator();
    let addr = ops.map_kernel(&mdl).unwrap();

    let pattern: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
    os.kernel_write(addr.add(3 * PAGE_SIZE_4K - 100), &pattern)
        .unwrap();
    let mut back = vec![0u8; pattern.len()];
    os.kernel_read(addr.add(3 * PAGE_SIZE_4K - 100), &mut back)
        .unwrap();
    assert_eq!(back, pattern);

    // 物理アドレス経由でも同じ内容が見える
    let phys = mdl.storage().phys_at(3 * PAGE_SIZE_4K - 100).unwrap();
    let mut direct = vec![0u8; 16];
    os.sysram().lock().read_bytes(phys, &mut direct).unwrap();
    assert_eq!(&direct[..], &pattern[..16]);

    ops.unmap_kernel(&mdl, addr).unwrap();
    device.free(mdl);
}

#[test]
fn test_scattered_kernel_map_crosses_pages() {
    let os = build_os(64, 48);
    let device = GalDevice::construct(os.clone(), DeviceConfig::default()).unwrap();

    let mdl = device.allocate_paged(3, AllocFlags::empty()).unwrap();
    let ops = mdl.allocator();
    let touches_before = os.stats().kernel_touches;
    let addr = ops.map_kernel(&mdl).unwrap();
    assert_eq!(os.stats().kernel_touches, touches_before + 3);

    // ページ境界を跨ぐ書き込みが散在ページへ正しく分配される
    let data = [0xA5u8; 96];
    os.kernel_write(addr.add(PAGE_SIZE_4K - 48), &data).unwrap();
    let first_tail = mdl.storage().phys_at(PAGE_SIZE_4K - 48).unwrap();
    let second_head = mdl.storage().phys_at(PAGE_SIZE_4K).unwrap();
    let mut buf = [0u8; 48];
    os.sysram().lock().read_bytes(first_tail, &mut buf).unwrap();
    assert_eq!(buf, [0xA5u8; 48]);
    os.sysram().lock().read_bytes(second_head, &mut buf).unwrap();
    assert_eq!(buf, [0xA5u8; 48]);

    ops.unmap_kernel(&mdl, addr).unwrap();
    // 解除後の変換は失敗する
    assert!(os.kernel_translate(addr).is_none());
    device.free(mdl);
}

// ============================================================================
// アロケータレジストリの縮退
// ============================================================================

#[test]
fn test_broken_allocator_is_skipped() {
    let os = build_os(64, 48);
    let table = [
        AllocatorDescriptor {
            name: "broken",
            construct: broken_allocator,
        },
        DEFAULT_ALLOCATOR_TABLE[0],
    ];
    let device = GalDevice::construct_with_allocators(
        os.clone(),
        DeviceConfig {
            contiguous_size: 0,
            ..DeviceConfig::default()
        },
        &table,
    )
    .unwrap();

    assert_eq!(device.allocators().len(), 1);
    let mdl = device.allocate_paged(4, AllocFlags::empty()).unwrap();
    device.free(mdl);
}

#[test]
fn test_empty_registry_still_constructs() {
    let os = build_os(64, 48);
    let table = [AllocatorDescriptor {
        name: "broken",
        construct: broken_allocator,
    }];
    let device = GalDevice::construct_with_allocators(
        os,
        DeviceConfig {
            contiguous_size: 0,
            ..DeviceConfig::default()
        },
        &table,
    )
    .unwrap();

    assert!(device.allocators().is_empty());
    // MDL割り当ては全て失敗するがデバイス自体は生きている
    assert!(device.allocate_paged(1, AllocFlags::empty()).is_err());
}

// ============================================================================
// プールの構築と縮小
// ============================================================================

#[test]
fn test_contiguous_pool_shrink_loop() {
    // 8MiB RAM に 8MiB を要求すると 4MiB に縮んで確保される
    let os = build_os(2048, 1536);
    let device = GalDevice::construct(
        os,
        DeviceConfig {
            contiguous_size: 8 << 20,
            ..DeviceConfig::default()
        },
    )
    .unwrap();

    let stats = device.stats();
    assert_eq!(stats.contiguous_shrink_attempts, 2);
    let pool = device.pool(PoolKind::Contiguous).unwrap();
    assert_eq!(pool.managed_bytes(), 4 << 20);
}

#[test]
fn test_fixed_base_conflict_is_fatal_and_released_on_drop() {
    let os = build_os(1024, 768);
    let base = PhysAddr::new(0x20_0000);
    let config = DeviceConfig {
        contiguous_base: Some(base),
        contiguous_size: 1 << 20,
        ..DeviceConfig::default()
    };

    let first = GalDevice::construct(os.clone(), config).unwrap();
    assert_eq!(os.region_count(), 1);

    // 同じ領域に重なる2台目は構築ごと失敗する
    let err = GalDevice::construct(os.clone(), config).unwrap_err();
    assert_eq!(err, HalError::OutOfResources);

    // 1台目を解体すれば領域は返却され、再構築できる
    drop(first);
    assert_eq!(os.region_count(), 0);
    let third = GalDevice::construct(os.clone(), config).unwrap();
    drop(third);
    assert_eq!(os.sysram().lock().free_frames(), 1024);
}

// ============================================================================
// 線形割り当ての連鎖
// ============================================================================

#[test]
fn test_linear_chain_degrades_in_order() {
    let os = build_os(1024, 768);
    let device = GalDevice::construct(
        os,
        DeviceConfig {
            contiguous_size: 256 << 10,
            ..DeviceConfig::default()
        },
    )
    .unwrap();

    // 1段目: プールヒープのノード
    let node = device
        .allocate_linear(64 << 10, 64, SurfaceKind::RenderTarget, PoolSelector::Default, false)
        .unwrap();
    assert!(matches!(node, LinearAllocation::Node { .. }));

    // ヒープを使い切る
    let filler = device
        .allocate_linear(192 << 10, 0, SurfaceKind::Unknown, PoolSelector::Default, false)
        .unwrap();

    // 2段目: 連続MDL
    let direct = device
        .allocate_linear(8 << 10, 0, SurfaceKind::Unknown, PoolSelector::Default, false)
        .unwrap();
    match &direct {
        LinearAllocation::Virtual { mdl } => assert!(mdl.is_contiguous()),
        LinearAllocation::Node { .. } => panic!("heap should be exhausted"),
    }

    // 3段目: 連続が取れないサイズは散在MDLへ降りる
    let big = device
        .allocate_linear(600 * PAGE_SIZE_4K, 0, SurfaceKind::Unknown, PoolSelector::Default, false)
        .unwrap();
    match &big {
        LinearAllocation::Virtual { mdl } => assert!(!mdl.is_contiguous()),
        LinearAllocation::Node { .. } => panic!("expected mdl fallback"),
    }

    for allocation in [big, direct, filler, node] {
        device.free_linear(allocation).unwrap();
    }
    let stats = device.stats();
    assert_eq!(stats.linear_allocs, 2);
    assert_eq!(stats.linear_frees, 4);
}

#[test]
fn test_pool_heap_recovers_after_free_cycle() {
    let os = build_os(1024, 768);
    let device = GalDevice::construct(
        os,
        DeviceConfig {
            contiguous_size: 256 << 10,
            ..DeviceConfig::default()
        },
    )
    .unwrap();
    let pool = device.pool(PoolKind::Contiguous).unwrap();

    let mut offsets = Vec::new();
    for _ in 0..3 {
        offsets.push(pool.allocate(32 << 10, 0, SurfaceKind::Unknown).unwrap());
    }
    for offset in offsets {
        pool.free(offset).unwrap();
    }

    // 結合済みなら全域が再び1ノードで取れる
    let full = pool.allocate(256 << 10, 0, SurfaceKind::Unknown).unwrap();
    assert_eq!(full, 0);
    let addr = pool.gpu_address(full);
    assert_eq!(device.split_address(addr).unwrap(), (PoolKind::Contiguous, 0));
    pool.free(full).unwrap();
}

#[test]
fn test_gpu_address_bridging_is_range_based() {
    let os = build_os(1024, 768);
    let device = GalDevice::construct(
        os,
        DeviceConfig {
            internal_base: GpuAddress::new(0x1000_0000),
            internal_size: 128 << 10,
            external_base: GpuAddress::new(0x2000_0000),
            external_size: 128 << 10,
            contiguous_size: 0,
            ..DeviceConfig::default()
        },
    )
    .unwrap();

    let internal = device.gpu_address(PoolKind::Internal, 0x400).unwrap();
    let external = device.gpu_address(PoolKind::External, 0x400).unwrap();
    assert_eq!(internal.as_u64(), 0x1000_0400);
    assert_eq!(external.as_u64(), 0x2000_0400);
    assert_eq!(
        device.split_address(internal).unwrap(),
        (PoolKind::Internal, 0x400)
    );
    assert_eq!(
        device.split_address(external).unwrap(),
        (PoolKind::External, 0x400)
    );
    // 範囲外のオフセットは変換できない
    assert!(device.gpu_address(PoolKind::Internal, 128 << 10).is_err());
}

// ============================================================================
// 割り込み通知
// ============================================================================

#[test]
fn test_irq_notification_flow() {
    let os = build_os(64, 48);
    let device = GalDevice::construct(os, DeviceConfig::default()).unwrap();

    device.notifier().post_from_isr();
    device.notifier().post_from_isr();
    assert!(device.poll_events());
    assert!(!device.poll_events());
    assert_eq!(device.notifier().stats().posts, 2);
}
