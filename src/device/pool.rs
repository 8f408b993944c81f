// ============================================================================
// src/device/pool.rs - Video Memory Pools
// 設計書 5.2: 内部・外部・連続プールとバッキング戦略
//
// 注意: 固定ベースの連続プールは物理領域の予約に失敗したら即座に
// エラーを返す (デバイス構築ごと失敗させる)。ベース未指定の場合は
// 縮小ループで確保できたぶんだけのプールになり、確保できなければ
// プール無効として続行する。
// ============================================================================

use spin::Mutex;

use crate::allocator::{AllocFlags, AllocatorRegistry};
use crate::error::HalResult;
use crate::mdl::{Mdl, PageStorage};
use crate::os::process::{MappedAddress, RegionBacking};
use crate::os::sysram::{PhysAddr, PAGE_SIZE_4K};
use crate::os::OsContext;

use super::vidmem::{HeapStats, SurfaceKind, VidMemHeap};

/// 縮小ループの1段あたりの減少量 (4MiB)
pub const SHRINK_STEP: usize = 4 * 1024 * 1024;

/// GPUから見えるアドレス (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GpuAddress(u64);

impl GpuAddress {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

/// プール種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// デバイス内蔵メモリ
    Internal,
    /// デバイス接続の外部メモリ
    External,
    /// システムRAM上の連続領域
    Contiguous,
}

impl PoolKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::Contiguous => "contiguous",
        }
    }
}

/// プールの物理バッキング
enum PoolBacking {
    /// デバイス側アパーチャ。CPUからの後始末は不要。
    DeviceLocal,
    /// 予約済み物理領域と常設カーネルマッピング
    ReservedRange {
        base: PhysAddr,
        kernel_map: MappedAddress,
    },
    /// ドライバが確保した連続MDL
    AllocatedMdl(Mdl),
}

/// ビデオメモリプール
///
/// GPUアドレス範囲 [base, base+managed) を1つのヒープで管理する。
pub struct VideoMemoryPool {
    kind: PoolKind,
    base: GpuAddress,
    heap: Mutex<VidMemHeap>,
    backing: PoolBacking,
}

impl core::fmt::Debug for VideoMemoryPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VideoMemoryPool")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl VideoMemoryPool {
    /// デバイスローカルプールを構築する (internal / external)
    ///
    /// サイズ 0 はプール無効を意味し `None` を返す。
    pub fn construct_device_local(
        kind: PoolKind,
        base: GpuAddress,
        bytes: usize,
        bank_size: usize,
        threshold: usize,
    ) -> HalResult<Option<Self>> {
        if bytes == 0 {
            log::debug!("pool {}: not present", kind.as_str());
            return Ok(None);
        }
        let heap = VidMemHeap::construct(bytes, bank_size, threshold)?;
        log::info!(
            "pool {}: {} bytes at {:#x}",
            kind.as_str(),
            heap.managed_bytes(),
            base.as_u64()
        );
        Ok(Some(Self {
            kind,
            base,
            heap: Mutex::new(heap),
            backing: PoolBacking::DeviceLocal,
        }))
    }

    /// 固定ベースの連続プールを構築する
    ///
    /// 物理領域の予約に失敗した場合はそのままエラーを返す。呼び出し側
    /// はこれを致命的として扱う。
    pub fn construct_contiguous_fixed(
        os: &OsContext,
        base: PhysAddr,
        bytes: usize,
        bank_size: usize,
        threshold: usize,
    ) -> HalResult<Self> {
        os.reserve_region(base, bytes, "galcore-contiguous")?;

        let backing = RegionBacking::Run {
            base: base.frame(),
            frames: bytes / PAGE_SIZE_4K,
        };
        let kernel_map = match os.kernel_map(backing, bytes) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = os.release_region(base);
                return Err(err);
            }
        };

        let heap = match VidMemHeap::construct(bytes, bank_size, threshold) {
            Ok(heap) => heap,
            Err(err) => {
                let _ = os.kernel_unmap(kernel_map);
                let _ = os.release_region(base);
                return Err(err);
            }
        };

        log::info!(
            "pool contiguous: reserved {} bytes at {:#x}",
            bytes,
            base.as_usize()
        );
        Ok(Self {
            kind: PoolKind::Contiguous,
            base: GpuAddress::new(base.as_u64()),
            heap: Mutex::new(heap),
            backing: PoolBacking::ReservedRange { base, kernel_map },
        })
    }

    /// ドライバ確保の連続プールを構築する
    ///
    /// 要求サイズから 4MiB ずつ縮めながら確保を試みる。戻り値は
    /// (プール, 試行回数)。全て失敗したらプール無効。
    pub fn construct_contiguous_allocated(
        registry: &AllocatorRegistry,
        requested: usize,
        bank_size: usize,
        threshold: usize,
    ) -> (Option<Self>, u32) {
        let mut attempts = 0u32;
        let mut bytes = requested;
        while bytes > 0 {
            attempts += 1;
            let pages = bytes.div_ceil(PAGE_SIZE_4K);
            if let Some(mdl) = Self::allocate_contiguous_mdl(registry, pages) {
                let run_base = match mdl.storage() {
                    PageStorage::Contiguous(run) => run.base_phys(),
                    PageStorage::Scattered(_) => {
                        // 連続要求に散在が返ることはない
                        mdl.allocator().free(mdl);
                        return (None, attempts);
                    }
                };
                let heap = match VidMemHeap::construct(bytes, bank_size, threshold) {
                    Ok(heap) => heap,
                    Err(_) => {
                        mdl.allocator().free(mdl);
                        return (None, attempts);
                    }
                };
                log::info!(
                    "pool contiguous: allocated {} bytes after {} attempts",
                    bytes,
                    attempts
                );
                return (
                    Some(Self {
                        kind: PoolKind::Contiguous,
                        base: GpuAddress::new(run_base.as_u64()),
                        heap: Mutex::new(heap),
                        backing: PoolBacking::AllocatedMdl(mdl),
                    }),
                    attempts,
                );
            }
            bytes = bytes.saturating_sub(SHRINK_STEP);
        }
        log::debug!(
            "pool contiguous: not available after {} attempts",
            attempts
        );
        (None, attempts)
    }

    fn allocate_contiguous_mdl(registry: &AllocatorRegistry, pages: usize) -> Option<Mdl> {
        for entry in registry.iter() {
            match entry.ops().clone().alloc(pages, AllocFlags::CONTIGUOUS) {
                Ok(mdl) => return Some(mdl),
                Err(err) => {
                    log::debug!(
                        "pool contiguous: allocator {} refused {} pages ({})",
                        entry.name(),
                        pages,
                        err
                    );
                }
            }
        }
        None
    }

    #[inline]
    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    #[inline]
    pub const fn base(&self) -> GpuAddress {
        self.base
    }

    /// 管理しているバイト数
    pub fn managed_bytes(&self) -> usize {
        self.heap.lock().managed_bytes()
    }

    /// 空きバイト数
    pub fn free_bytes(&self) -> usize {
        self.heap.lock().free_bytes()
    }

    /// 常設カーネルマッピング (予約済み連続プールのみ)
    pub fn kernel_map(&self) -> Option<MappedAddress> {
        match &self.backing {
            PoolBacking::ReservedRange { kernel_map, .. } => Some(*kernel_map),
            _ => None,
        }
    }

    /// プールから線形割り当てを行い、プール内オフセットを返す
    pub fn allocate(
        &self,
        bytes: usize,
        alignment: usize,
        kind: SurfaceKind,
    ) -> HalResult<usize> {
        self.heap.lock().allocate_linear(bytes, alignment, kind)
    }

    /// プール内オフセットを解放する
    pub fn free(&self, offset: usize) -> HalResult<()> {
        self.heap.lock().free(offset)
    }

    /// プール内オフセットをGPUアドレスへ変換する
    #[inline]
    pub const fn gpu_address(&self, offset: usize) -> GpuAddress {
        self.base.add(offset)
    }

    /// GPUアドレスがこのプールの範囲内か
    pub fn contains(&self, addr: GpuAddress) -> bool {
        let start = self.base.as_u64();
        let end = start + self.managed_bytes() as u64;
        addr.as_u64() >= start && addr.as_u64() < end
    }

    /// GPUアドレスをプール内オフセットへ戻す
    pub fn offset_of(&self, addr: GpuAddress) -> Option<usize> {
        if self.contains(addr) {
            Some((addr.as_u64() - self.base.as_u64()) as usize)
        } else {
            None
        }
    }

    /// ヒープ統計のスナップショット
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }

    /// プールを解体し、バッキングを返却する
    pub fn release(self, os: &OsContext) {
        match self.backing {
            PoolBacking::DeviceLocal => {}
            PoolBacking::ReservedRange { base, kernel_map } => {
                if let Err(err) = os.kernel_unmap(kernel_map) {
                    log::warn!("pool contiguous: unmap failed ({})", err);
                }
                if let Err(err) = os.release_region(base) {
                    log::warn!("pool contiguous: region release failed ({})", err);
                }
            }
            PoolBacking::AllocatedMdl(mdl) => {
                mdl.allocator().free(mdl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{import_allocators, DEFAULT_ALLOCATOR_TABLE};
    use crate::error::HalError;
    use crate::os::sysram::SystemRamConfig;
    use crate::os::OsConfig;
    use alloc::sync::Arc;

    fn build_os(total: usize, low: usize) -> Arc<OsContext> {
        Arc::new(
            OsContext::new(OsConfig {
                ram: SystemRamConfig {
                    total_frames: total,
                    lowmem_frames: low,
                },
                non_paged_cacheable: false,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_zero_sized_pool_is_disabled() {
        let pool = VideoMemoryPool::construct_device_local(
            PoolKind::Internal,
            GpuAddress::new(0),
            0,
            0,
            64,
        )
        .unwrap();
        assert!(pool.is_none());
    }

    #[test]
    fn test_device_local_pool_addressing() {
        let pool = VideoMemoryPool::construct_device_local(
            PoolKind::External,
            GpuAddress::new(0x8000_0000),
            1 << 20,
            0,
            64,
        )
        .unwrap()
        .unwrap();
        let offset = pool.allocate(4096, 64, SurfaceKind::Texture).unwrap();
        let addr = pool.gpu_address(offset);
        assert_eq!(pool.offset_of(addr), Some(offset));
        assert!(!pool.contains(GpuAddress::new(0x7FFF_FFFF)));
        pool.free(offset).unwrap();
    }

    #[test]
    fn test_fixed_contiguous_pool_lifecycle() {
        let os = build_os(1024, 768);
        let base = PhysAddr::new(0x10_0000);
        let bytes = 1 << 20;
        let pool =
            VideoMemoryPool::construct_contiguous_fixed(&os, base, bytes, 0, 64).unwrap();
        assert_eq!(pool.kind(), PoolKind::Contiguous);
        assert!(pool.kernel_map().is_some());
        assert_eq!(os.region_count(), 1);

        // 予約済み範囲との衝突は OutOfResources
        let err = VideoMemoryPool::construct_contiguous_fixed(
            &os,
            PhysAddr::new(0x18_0000),
            1 << 20,
            0,
            64,
        )
        .unwrap_err();
        assert_eq!(err, HalError::OutOfResources);

        pool.release(&os);
        assert_eq!(os.region_count(), 0);
        // 返却後は同じ範囲を再予約できる
        let again =
            VideoMemoryPool::construct_contiguous_fixed(&os, base, bytes, 0, 64).unwrap();
        again.release(&os);
    }

    #[test]
    fn test_allocated_contiguous_pool_shrinks() {
        // 8MiB RAM: 8MiB 要求は失敗し、4MiB へ縮小して成功する
        let os = build_os(2048, 1536);
        let registry = import_allocators(&os, DEFAULT_ALLOCATOR_TABLE);
        let (pool, attempts) =
            VideoMemoryPool::construct_contiguous_allocated(&registry, 8 << 20, 0, 64);
        let pool = pool.unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(pool.managed_bytes(), 4 << 20);

        pool.release(&os);
        assert_eq!(os.sysram().lock().free_frames(), 2048);
    }

    #[test]
    fn test_allocated_contiguous_pool_exhausts() {
        // 1MiB RAM では 4MiB 単位の縮小が全て失敗する
        let os = build_os(256, 192);
        let registry = import_allocators(&os, DEFAULT_ALLOCATOR_TABLE);
        let (pool, attempts) =
            VideoMemoryPool::construct_contiguous_allocated(&registry, 16 << 20, 0, 64);
        assert!(pool.is_none());
        // ceil(16MiB / 4MiB) = 4 回試行される
        assert_eq!(attempts, 4);
    }
}
