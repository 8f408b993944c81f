// ============================================================================
// src/allocator/gfp.rs - General Purpose Page Allocator
// 設計書 4.2: システムRAMからのページ割り当てとマッピング実装
//
// 注意: 連続要求の試行順は 正確サイズ → オーダー丸め → highmem。
// 正確サイズ経路は小サイズ専用で、上限を超える要求は最初から
// オーダー経路へ回る。オーダー丸めで確保したMDLは論理ページ数だけを
// 公開し、解放時に丸め後の全フレームを返却する。
// ============================================================================

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HalError, HalResult};
use crate::mdl::{MappingRecord, Mdl, PageRun, PageStorage};
use crate::os::kmap;
use crate::os::pages::{allocate_page_array, free_page_array, PageArray};
use crate::os::process::{CacheMode, MappedAddress, MappingSize, VmFlags};
use crate::os::sysram::{order_frames, PhysAddr, SystemRam, Zone, PAGE_SIZE_4K};
use crate::os::{OsContext, ProcessId};

use super::{AllocFlags, AllocatorOps, CacheOp};

/// 正確サイズ経路を試す上限ページ数 (64KiB)
pub const EXACT_PATH_LIMIT_PAGES: usize = 16;

/// 汎用ページアロケータ
///
/// システムRAMを直接使う既定のアロケータ。散在割り当てと連続割り当て
/// の両方を扱う。
pub struct GfpAllocator {
    os: Arc<OsContext>,
    allocs: AtomicU64,
    frees: AtomicU64,
    exact_hits: AtomicU64,
    order_hits: AtomicU64,
    highmem_hits: AtomicU64,
    scattered_allocs: AtomicU64,
    user_maps: AtomicU64,
    user_unmaps: AtomicU64,
    kernel_maps: AtomicU64,
    kernel_unmaps: AtomicU64,
    cache_cleans: AtomicU64,
    cache_invalidates: AtomicU64,
    cache_flushes: AtomicU64,
}

/// GFPアロケータ統計のスナップショット
#[derive(Debug, Clone, Copy, Default)]
pub struct GfpStats {
    pub allocs: u64,
    pub frees: u64,
    pub exact_hits: u64,
    pub order_hits: u64,
    pub highmem_hits: u64,
    pub scattered_allocs: u64,
    pub user_maps: u64,
    pub user_unmaps: u64,
    pub kernel_maps: u64,
    pub kernel_unmaps: u64,
    pub cache_cleans: u64,
    pub cache_invalidates: u64,
    pub cache_flushes: u64,
}

/// レジストリ用の構築関数
///
/// 自己診断として1ページの確保と返却を行い、失敗したら読み飛ばし
/// 対象となる。
pub fn construct(os: Arc<OsContext>) -> HalResult<Arc<dyn AllocatorOps>> {
    {
        let mut ram = os.sysram().lock();
        let probe = ram.allocate_page().ok_or(HalError::OutOfMemory)?;
        ram.free_page(probe);
    }
    Ok(Arc::new(GfpAllocator::new(os)))
}

impl GfpAllocator {
    pub fn new(os: Arc<OsContext>) -> Self {
        Self {
            os,
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            exact_hits: AtomicU64::new(0),
            order_hits: AtomicU64::new(0),
            highmem_hits: AtomicU64::new(0),
            scattered_allocs: AtomicU64::new(0),
            user_maps: AtomicU64::new(0),
            user_unmaps: AtomicU64::new(0),
            kernel_maps: AtomicU64::new(0),
            kernel_unmaps: AtomicU64::new(0),
            cache_cleans: AtomicU64::new(0),
            cache_invalidates: AtomicU64::new(0),
            cache_flushes: AtomicU64::new(0),
        }
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> GfpStats {
        GfpStats {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            order_hits: self.order_hits.load(Ordering::Relaxed),
            highmem_hits: self.highmem_hits.load(Ordering::Relaxed),
            scattered_allocs: self.scattered_allocs.load(Ordering::Relaxed),
            user_maps: self.user_maps.load(Ordering::Relaxed),
            user_unmaps: self.user_unmaps.load(Ordering::Relaxed),
            kernel_maps: self.kernel_maps.load(Ordering::Relaxed),
            kernel_unmaps: self.kernel_unmaps.load(Ordering::Relaxed),
            cache_cleans: self.cache_cleans.load(Ordering::Relaxed),
            cache_invalidates: self.cache_invalidates.load(Ordering::Relaxed),
            cache_flushes: self.cache_flushes.load(Ordering::Relaxed),
        }
    }

    /// 連続ページを確保する。戻り値は (ラン, 正確サイズか, 占有フレーム数)。
    fn allocate_run(
        &self,
        ram: &mut SystemRam,
        num_pages: usize,
    ) -> HalResult<(PageRun, bool, usize)> {
        // 1. 正確サイズ (小サイズのみ)
        if num_pages <= EXACT_PATH_LIMIT_PAGES {
            if let Some(base) = ram.allocate_contiguous(num_pages, Zone::Low, 1) {
                self.exact_hits.fetch_add(1, Ordering::Relaxed);
                return Ok((PageRun::new(base, num_pages), true, num_pages));
            }
        }

        // 2. オーダー丸め (lowmem)
        let rounded = order_frames(num_pages);
        if let Some(base) = ram.allocate_contiguous(rounded, Zone::Low, rounded) {
            self.order_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((PageRun::new(base, num_pages), false, rounded));
        }

        // 3. オーダー丸め (highmem)
        if let Some(base) = ram.allocate_contiguous(rounded, Zone::High, rounded) {
            self.highmem_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((PageRun::new(base, num_pages), false, rounded));
        }

        Err(HalError::OutOfMemory)
    }

    fn flush_run(ram: &mut SystemRam, run: &PageRun) -> HalResult<()> {
        if ram.is_highmem(run.base()) {
            for i in 0..run.frames() {
                ram.flush_page(run.base().offset(i))?;
            }
            Ok(())
        } else {
            ram.flush_by_address(run.base_phys(), run.frames() * PAGE_SIZE_4K)
        }
    }

    fn flush_array(ram: &mut SystemRam, array: &PageArray) -> HalResult<()> {
        for handle in array.handles() {
            if ram.is_highmem(handle.frame()) {
                ram.flush_page(handle.frame())?;
            } else {
                ram.flush_by_address(handle.phys(), PAGE_SIZE_4K)?;
            }
        }
        Ok(())
    }

    /// MDLがカーネル直結ウィンドウで見えるか
    ///
    /// 非ページドメモリをキャッシュ有効で扱う構成の連続MDLだけが対象。
    fn direct_mappable(&self, mdl: &Mdl) -> bool {
        self.os.non_paged_cacheable() && mdl.is_contiguous()
    }
}

impl AllocatorOps for GfpAllocator {
    fn alloc(self: Arc<Self>, num_pages: usize, flags: AllocFlags) -> HalResult<Mdl> {
        if num_pages == 0 || num_pages > self.os.sysram().lock().total_frames() {
            return Err(HalError::InvalidArgument);
        }

        let contiguous = flags.contains(AllocFlags::CONTIGUOUS);
        // 非ページドメモリのキャッシュ属性は構成が優先する
        let cacheable = flags.contains(AllocFlags::CACHEABLE)
            || (contiguous && self.os.non_paged_cacheable());

        let (storage, exact, paged) = if contiguous {
            let mut ram = self.os.sysram().lock();
            let (run, exact, taken) = self.allocate_run(&mut ram, num_pages)?;
            if let Err(err) = Self::flush_run(&mut ram, &run) {
                ram.free_contiguous(run.base(), taken);
                return Err(err);
            }
            for i in 0..run.frames() {
                ram.mark_reserved(run.base().offset(i));
            }
            (PageStorage::Contiguous(run), exact, false)
        } else {
            let array = allocate_page_array(&self.os, num_pages)?;
            self.scattered_allocs.fetch_add(1, Ordering::Relaxed);
            let mut ram = self.os.sysram().lock();
            if let Err(err) = Self::flush_array(&mut ram, &array) {
                drop(ram);
                free_page_array(&self.os, array);
                return Err(err);
            }
            for handle in array.handles() {
                ram.mark_reserved(handle.frame());
            }
            (PageStorage::Scattered(array), true, true)
        };

        self.allocs.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "verbose_logging")]
        log::trace!(
            "gfp: {} pages (contiguous={}, cacheable={})",
            num_pages,
            contiguous,
            cacheable
        );
        Ok(Mdl::new(storage, exact, paged, cacheable, self))
    }

    fn free(&self, mdl: Mdl) {
        let exact = mdl.is_exact();
        match mdl.into_storage() {
            PageStorage::Contiguous(run) => {
                let mut ram = self.os.sysram().lock();
                for i in 0..run.frames() {
                    ram.clear_reserved(run.base().offset(i));
                }
                let taken = if exact {
                    run.frames()
                } else {
                    order_frames(run.frames())
                };
                ram.free_contiguous(run.base(), taken);
            }
            PageStorage::Scattered(array) => {
                {
                    let mut ram = self.os.sysram().lock();
                    for handle in array.handles() {
                        ram.clear_reserved(handle.frame());
                    }
                }
                free_page_array(&self.os, array);
            }
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn map_user(
        &self,
        mdl: &Mdl,
        process: ProcessId,
        cacheable: bool,
    ) -> HalResult<MappedAddress> {
        let space = self.os.process(process).ok_or(HalError::InvalidArgument)?;

        // デバイスメモリ相当として扱う。fork時コピーも伸長も禁止する。
        let flags = VmFlags::IO | VmFlags::DONT_COPY | VmFlags::DONT_EXPAND;
        let cache_mode = if cacheable {
            CacheMode::Cached
        } else {
            CacheMode::NonCached
        };

        let mut space = space.write();

        // 第1段階: アドレス範囲の予約
        let base = space.reserve(MappingSize::from_pages(mdl.num_pages()), flags, cache_mode)?;

        // 第2段階: 予約したリージョンの確認
        if space.region(base).is_none() {
            return Err(HalError::OutOfResources);
        }

        // 第3段階: バッキングの確定。失敗時は予約を取り消す。
        if space.commit(base, mdl.storage().to_region_backing()).is_err() {
            let _ = space.unmap(base);
            return Err(HalError::OutOfMemory);
        }
        drop(space);

        mdl.add_mapping(MappingRecord {
            process,
            base,
            page_count: mdl.num_pages(),
        });
        self.user_maps.fetch_add(1, Ordering::Relaxed);
        Ok(base)
    }

    fn unmap_user(
        &self,
        mdl: &Mdl,
        process: ProcessId,
        logical: MappedAddress,
        bytes: usize,
    ) -> HalResult<()> {
        if bytes == 0 {
            return Err(HalError::InvalidArgument);
        }

        // 記録を先に取り外す。プロセス消滅後の後始末でも記録は残さない。
        let record = mdl
            .take_mapping(process, logical)
            .ok_or(HalError::InvalidArgument)?;

        if let Some(space) = self.os.process(process) {
            space.write().unmap(record.base)?;
        }
        self.user_unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn map_kernel(&self, mdl: &Mdl) -> HalResult<MappedAddress> {
        let addr = if self.direct_mappable(mdl) {
            match mdl.storage() {
                PageStorage::Contiguous(run) => kmap::phys_to_virt(run.base_phys()),
                PageStorage::Scattered(_) => return Err(HalError::InvalidArgument),
            }
        } else {
            self.os
                .kernel_map(mdl.storage().to_region_backing(), mdl.size_bytes())?
        };

        // マップ直後に全ページへアクセスして常駐を確定させる
        if let Err(err) = self.os.touch_range(addr, mdl.size_bytes()) {
            if !kmap::direct_window_contains(addr) {
                let _ = self.os.kernel_unmap(addr);
            }
            return Err(err);
        }
        self.kernel_maps.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn unmap_kernel(&self, _mdl: &Mdl, logical: MappedAddress) -> HalResult<()> {
        // 直結ウィンドウのアドレスはマッピング実体を持たない
        if !kmap::direct_window_contains(logical) {
            self.os.kernel_unmap(logical)?;
        }
        self.kernel_unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn logical_to_physical(
        &self,
        mdl: &Mdl,
        logical: MappedAddress,
        process: ProcessId,
    ) -> HalResult<PhysAddr> {
        if process.is_kernel() {
            return self
                .os
                .kernel_translate(logical)
                .ok_or(HalError::InvalidArgument);
        }
        let record = mdl
            .mapping_containing(process, logical)
            .ok_or(HalError::InvalidArgument)?;
        let offset = logical.as_usize() - record.base.as_usize();
        mdl.storage()
            .phys_at(offset)
            .ok_or(HalError::InvalidArgument)
    }

    fn cache(
        &self,
        _mdl: &Mdl,
        _logical: MappedAddress,
        _physical: PhysAddr,
        bytes: usize,
        op: CacheOp,
    ) -> HalResult<()> {
        if bytes == 0 {
            return Err(HalError::InvalidArgument);
        }

        // このアロケータが扱うメモリはalloc時の保守以上を必要としない。
        // 回数だけ数えて成功を返す。
        let counter = match op {
            CacheOp::Clean => &self.cache_cleans,
            CacheOp::Invalidate => &self.cache_invalidates,
            CacheOp::Flush => &self.cache_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn physical(&self, mdl: &Mdl, offset: usize) -> HalResult<PhysAddr> {
        match mdl.storage() {
            // 連続MDLの物理アドレスはラン先頭から計算できるため、
            // ページ問い合わせ経路は散在MDL専用とする
            PageStorage::Contiguous(_) => Err(HalError::InvalidArgument),
            PageStorage::Scattered(_) => {
                if offset >= mdl.size_bytes() {
                    return Err(HalError::InvalidArgument);
                }
                mdl.storage()
                    .phys_at(offset)
                    .ok_or(HalError::InvalidArgument)
            }
        }
    }
}
