//! GALデバイスモジュール
//!
//! アロケータレジストリとビデオメモリプール群を束ね、線形割り当ての
//! フロントエンドを提供します。プールの試行順は
//! internal → external → contiguous → 連続MDL → 散在MDL で、
//! 上位のプールが使えないときだけ下位へ降りていきます。
//!
//! GPUアドレスとプールの対応は範囲検索で行い、アドレスへの
//! ビット埋め込みは行いません。

pub mod pool;
pub mod vidmem;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::allocator::{
    import_allocators, AllocFlags, AllocatorDescriptor, AllocatorRegistry,
    DEFAULT_ALLOCATOR_TABLE,
};
use crate::error::{HalError, HalResult};
use crate::irq::IrqNotifier;
use crate::mdl::Mdl;
use crate::os::sysram::{PhysAddr, PAGE_SIZE_4K};
use crate::os::OsContext;

pub use pool::{GpuAddress, PoolKind, VideoMemoryPool, SHRINK_STEP};
pub use vidmem::{HeapStats, SurfaceKind, VidMemHeap};

// ===== 設定 =====

/// デバイスの構成
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// 内蔵プールのGPUベースアドレス
    pub internal_base: GpuAddress,
    /// 内蔵プールのサイズ (0 = 無し)
    pub internal_size: usize,
    /// 外部プールのGPUベースアドレス
    pub external_base: GpuAddress,
    /// 外部プールのサイズ (0 = 無し)
    pub external_size: usize,
    /// 連続プールの固定物理ベース。None ならドライバが確保する。
    pub contiguous_base: Option<PhysAddr>,
    /// 連続プールの要求サイズ
    pub contiguous_size: usize,
    /// ヒープのバンクサイズ (0 = 単一バンク)
    pub bank_size: usize,
    /// ヒープの分割閾値
    pub heap_threshold: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            internal_base: GpuAddress::new(0),
            internal_size: 0,
            external_base: GpuAddress::new(0),
            external_size: 0,
            contiguous_base: None,
            contiguous_size: 4 << 20,
            bank_size: 0,
            heap_threshold: 64,
        }
    }
}

// ===== 線形割り当ての結果 =====

/// プール選択の方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSelector {
    /// 全段のフォールバックを許す
    Default,
    /// 物理連続が必要 (散在MDLへは降りない)
    ContiguousOnly,
    /// 最初から散在MDLを使う
    Virtual,
}

/// 線形割り当ての結果
#[derive(Debug)]
pub enum LinearAllocation {
    /// プールヒープ内のノード
    Node {
        pool: PoolKind,
        offset: usize,
        address: GpuAddress,
    },
    /// ヒープ外のMDL直接割り当て
    Virtual { mdl: Mdl },
}

impl LinearAllocation {
    /// 物理的に連続な割り当てか
    pub fn is_contiguous(&self) -> bool {
        match self {
            Self::Node { .. } => true,
            Self::Virtual { mdl } => mdl.is_contiguous(),
        }
    }
}

// ===== デバイス本体 =====

/// デバイス統計のスナップショット
#[derive(Debug, Clone, Copy)]
pub struct DeviceStats {
    pub pools: usize,
    pub linear_allocs: u64,
    pub linear_frees: u64,
    pub virtual_fallbacks: u64,
    pub contiguous_shrink_attempts: u32,
}

/// GALデバイス
///
/// OSコンテキスト、アロケータレジストリ、プール群を所有する。
/// 解体時にプールのバッキングを全て返却する。
pub struct GalDevice {
    os: Arc<OsContext>,
    allocators: AllocatorRegistry,
    pools: Vec<VideoMemoryPool>,
    irq: IrqNotifier,
    shrink_attempts: u32,
    linear_allocs: AtomicU64,
    linear_frees: AtomicU64,
    virtual_fallbacks: AtomicU64,
}

impl core::fmt::Debug for GalDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GalDevice")
            .field("allocators", &self.allocators.len())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl GalDevice {
    /// 既定のアロケータテーブルでデバイスを構築する
    pub fn construct(os: Arc<OsContext>, config: DeviceConfig) -> HalResult<Self> {
        Self::construct_with_allocators(os, config, DEFAULT_ALLOCATOR_TABLE)
    }

    /// アロケータテーブルを指定してデバイスを構築する
    ///
    /// 固定ベースの連続プールが予約に失敗した場合のみ構築全体が
    /// 失敗する。その他のプールは無効のまま続行する。
    pub fn construct_with_allocators(
        os: Arc<OsContext>,
        config: DeviceConfig,
        table: &[AllocatorDescriptor],
    ) -> HalResult<Self> {
        let allocators = import_allocators(&os, table);
        let mut pools = Vec::new();
        let mut shrink_attempts = 0;

        if let Some(pool) = VideoMemoryPool::construct_device_local(
            PoolKind::Internal,
            config.internal_base,
            config.internal_size,
            config.bank_size,
            config.heap_threshold,
        )? {
            pools.push(pool);
        }
        if let Some(pool) = VideoMemoryPool::construct_device_local(
            PoolKind::External,
            config.external_base,
            config.external_size,
            config.bank_size,
            config.heap_threshold,
        )? {
            pools.push(pool);
        }

        match config.contiguous_base {
            Some(base) => {
                // 固定ベースの予約失敗は致命的
                let pool = VideoMemoryPool::construct_contiguous_fixed(
                    &os,
                    base,
                    config.contiguous_size,
                    config.bank_size,
                    config.heap_threshold,
                )?;
                pools.push(pool);
            }
            None => {
                let (pool, attempts) = VideoMemoryPool::construct_contiguous_allocated(
                    &allocators,
                    config.contiguous_size,
                    config.bank_size,
                    config.heap_threshold,
                );
                shrink_attempts = attempts;
                if let Some(pool) = pool {
                    pools.push(pool);
                }
            }
        }

        log::info!(
            "device: {} allocators, {} pools",
            allocators.len(),
            pools.len()
        );
        Ok(Self {
            os,
            allocators,
            pools,
            irq: IrqNotifier::new(),
            shrink_attempts,
            linear_allocs: AtomicU64::new(0),
            linear_frees: AtomicU64::new(0),
            virtual_fallbacks: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn os(&self) -> &Arc<OsContext> {
        &self.os
    }

    #[inline]
    pub const fn allocators(&self) -> &AllocatorRegistry {
        &self.allocators
    }

    /// 割り込み通知機
    #[inline]
    pub const fn notifier(&self) -> &IrqNotifier {
        &self.irq
    }

    /// ワーカ側の通知引き取り
    pub fn poll_events(&self) -> bool {
        self.irq.take()
    }

    /// 種別でプールを検索する
    pub fn pool(&self, kind: PoolKind) -> Option<&VideoMemoryPool> {
        self.pools.iter().find(|p| p.kind() == kind)
    }

    // ========================================================================
    // MDL割り当て (レジストリ走査)
    // ========================================================================

    /// レジストリを優先順に走査してMDLを割り当てる
    ///
    /// 全アロケータが失敗した場合は最後のエラーを返す。
    pub fn allocate_paged(&self, num_pages: usize, flags: AllocFlags) -> HalResult<Mdl> {
        let mut last_err = HalError::OutOfMemory;
        for entry in self.allocators.iter() {
            match entry.ops().clone().alloc(num_pages, flags) {
                Ok(mdl) => return Ok(mdl),
                Err(err) => {
                    log::debug!(
                        "device: allocator {} failed {} pages ({})",
                        entry.name(),
                        num_pages,
                        err
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// MDLを生成元アロケータへ返却する
    pub fn free(&self, mdl: Mdl) {
        mdl.allocator().free(mdl);
    }

    // ========================================================================
    // 線形割り当てフロントエンド
    // ========================================================================

    /// プール連鎖から線形メモリを割り当てる
    pub fn allocate_linear(
        &self,
        bytes: usize,
        alignment: usize,
        kind: SurfaceKind,
        selector: PoolSelector,
        cacheable: bool,
    ) -> HalResult<LinearAllocation> {
        if bytes == 0 {
            return Err(HalError::InvalidArgument);
        }
        let pages = bytes.div_ceil(PAGE_SIZE_4K);
        let mut mdl_flags = AllocFlags::CONTIGUOUS;
        if cacheable {
            mdl_flags |= AllocFlags::CACHEABLE;
        }

        match selector {
            PoolSelector::Default => {
                for pool_kind in [PoolKind::Internal, PoolKind::External, PoolKind::Contiguous]
                {
                    if let Some(node) = self.try_pool(pool_kind, bytes, alignment, kind) {
                        return Ok(node);
                    }
                }
                if let Ok(mdl) = self.allocate_paged(pages, mdl_flags) {
                    return Ok(LinearAllocation::Virtual { mdl });
                }
                let scattered = if cacheable {
                    AllocFlags::CACHEABLE
                } else {
                    AllocFlags::empty()
                };
                let mdl = self.allocate_paged(pages, scattered)?;
                self.virtual_fallbacks.fetch_add(1, Ordering::Relaxed);
                Ok(LinearAllocation::Virtual { mdl })
            }
            PoolSelector::ContiguousOnly => {
                if let Some(node) = self.try_pool(PoolKind::Contiguous, bytes, alignment, kind)
                {
                    return Ok(node);
                }
                let mdl = self.allocate_paged(pages, mdl_flags)?;
                Ok(LinearAllocation::Virtual { mdl })
            }
            PoolSelector::Virtual => {
                let scattered = if cacheable {
                    AllocFlags::CACHEABLE
                } else {
                    AllocFlags::empty()
                };
                let mdl = self.allocate_paged(pages, scattered)?;
                self.virtual_fallbacks.fetch_add(1, Ordering::Relaxed);
                Ok(LinearAllocation::Virtual { mdl })
            }
        }
    }

    fn try_pool(
        &self,
        pool_kind: PoolKind,
        bytes: usize,
        alignment: usize,
        kind: SurfaceKind,
    ) -> Option<LinearAllocation> {
        let pool = self.pool(pool_kind)?;
        let offset = pool.allocate(bytes, alignment, kind).ok()?;
        self.linear_allocs.fetch_add(1, Ordering::Relaxed);
        Some(LinearAllocation::Node {
            pool: pool_kind,
            offset,
            address: pool.gpu_address(offset),
        })
    }

    /// 線形割り当てを解放する
    pub fn free_linear(&self, allocation: LinearAllocation) -> HalResult<()> {
        match allocation {
            LinearAllocation::Node { pool, offset, .. } => {
                let pool = self.pool(pool).ok_or(HalError::InvalidArgument)?;
                pool.free(offset)?;
            }
            LinearAllocation::Virtual { mdl } => {
                mdl.allocator().free(mdl);
            }
        }
        self.linear_frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ========================================================================
    // GPUアドレスの橋渡し (範囲検索)
    // ========================================================================

    /// プール内オフセットをGPUアドレスへ変換する
    pub fn gpu_address(&self, kind: PoolKind, offset: usize) -> HalResult<GpuAddress> {
        let pool = self.pool(kind).ok_or(HalError::InvalidArgument)?;
        if offset >= pool.managed_bytes() {
            return Err(HalError::InvalidArgument);
        }
        Ok(pool.gpu_address(offset))
    }

    /// GPUアドレスを (プール種別, オフセット) へ分解する
    pub fn split_address(&self, addr: GpuAddress) -> HalResult<(PoolKind, usize)> {
        for pool in &self.pools {
            if let Some(offset) = pool.offset_of(addr) {
                return Ok((pool.kind(), offset));
            }
        }
        Err(HalError::InvalidArgument)
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            pools: self.pools.len(),
            linear_allocs: self.linear_allocs.load(Ordering::Relaxed),
            linear_frees: self.linear_frees.load(Ordering::Relaxed),
            virtual_fallbacks: self.virtual_fallbacks.load(Ordering::Relaxed),
            contiguous_shrink_attempts: self.shrink_attempts,
        }
    }
}

impl Drop for GalDevice {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            pool.release(&self.os);
        }
    }
}
