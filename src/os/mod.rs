//! OS抽象化レイヤ
//!
//! シミュレートされたシステムRAM、プロセス空間レジストリ、カーネル
//! マッピングウィンドウ、物理領域予約をまとめた [`OsContext`] を提供
//! します。グローバル状態は持たず、利用側が `Arc<OsContext>` を共有
//! します。
//!
//! ロック順序: プロセス空間 → kmap → sysram。同種ロックの多重取得は
//! 禁止。

pub mod kmap;
pub mod pages;
pub mod process;
pub mod sysram;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::error::{HalError, HalResult};
use kmap::KernelVmap;
use process::{MappedAddress, ProcessSpace, RegionBacking};
use sysram::{PhysAddr, SystemRam, SystemRamConfig, PAGE_SIZE_4K};

// ===== プロセスID =====

/// プロセス識別子 (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// カーネル文脈を表す番兵値
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 == Self::KERNEL.0
    }
}

// ===== 設定 =====

/// OSレイヤの構成
#[derive(Debug, Clone, Copy)]
pub struct OsConfig {
    pub ram: SystemRamConfig,
    /// 非ページドメモリをキャッシュ有効で扱うか
    pub non_paged_cacheable: bool,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            ram: SystemRamConfig::default(),
            non_paged_cacheable: false,
        }
    }
}

// ===== 物理領域予約 =====

struct ReservedRegion {
    base: PhysAddr,
    bytes: usize,
    name: &'static str,
}

impl ReservedRegion {
    fn overlaps(&self, base: PhysAddr, bytes: usize) -> bool {
        let s0 = self.base.as_usize();
        let e0 = s0 + self.bytes;
        let s1 = base.as_usize();
        let e1 = s1 + bytes;
        s0 < e1 && s1 < e0
    }
}

// ===== OsContext =====

/// OSレイヤ統計のスナップショット
#[derive(Debug, Clone, Copy, Default)]
pub struct OsStats {
    pub index_fast_allocs: u64,
    pub index_fast_frees: u64,
    pub index_flex_allocs: u64,
    pub index_flex_frees: u64,
    pub regions_reserved: u64,
    pub region_conflicts: u64,
    pub kernel_touches: u64,
}

/// OSサービスのコンテキストオブジェクト
///
/// ドライバの全コンポーネントが `Arc` で共有する。内部の各リソースは
/// 個別の spin ロックで保護され、統計カウンタのみロックフリーの
/// Atomic を使う。
pub struct OsContext {
    config: OsConfig,
    sysram: Mutex<SystemRam>,
    processes: RwLock<HashMap<ProcessId, Arc<RwLock<ProcessSpace>>>>,
    kmap: Mutex<KernelVmap>,
    reserved_regions: Mutex<Vec<ReservedRegion>>,
    index_fast_allocs: AtomicU64,
    index_fast_frees: AtomicU64,
    index_flex_allocs: AtomicU64,
    index_flex_frees: AtomicU64,
    regions_reserved: AtomicU64,
    region_conflicts: AtomicU64,
    kernel_touches: AtomicU64,
}

impl OsContext {
    /// 構成からOSコンテキストを構築する
    pub fn new(config: OsConfig) -> HalResult<Self> {
        let sysram = SystemRam::new(config.ram)?;
        Ok(Self {
            config,
            sysram: Mutex::new(sysram),
            processes: RwLock::new(HashMap::new()),
            kmap: Mutex::new(KernelVmap::new()),
            reserved_regions: Mutex::new(Vec::new()),
            index_fast_allocs: AtomicU64::new(0),
            index_fast_frees: AtomicU64::new(0),
            index_flex_allocs: AtomicU64::new(0),
            index_flex_frees: AtomicU64::new(0),
            regions_reserved: AtomicU64::new(0),
            region_conflicts: AtomicU64::new(0),
            kernel_touches: AtomicU64::new(0),
        })
    }

    #[inline]
    pub const fn config(&self) -> &OsConfig {
        &self.config
    }

    #[inline]
    pub const fn non_paged_cacheable(&self) -> bool {
        self.config.non_paged_cacheable
    }

    /// システムRAMへのアクセス
    #[inline]
    pub const fn sysram(&self) -> &Mutex<SystemRam> {
        &self.sysram
    }

    // ========================================================================
    // プロセス空間レジストリ
    // ========================================================================

    /// プロセス空間を登録する。登録済みなら既存の空間を返す。
    pub fn register_process(&self, pid: ProcessId) -> Arc<RwLock<ProcessSpace>> {
        self.processes
            .write()
            .entry(pid)
            .or_insert_with(|| Arc::new(RwLock::new(ProcessSpace::new())))
            .clone()
    }

    /// プロセス空間を取り外す
    pub fn remove_process(&self, pid: ProcessId) -> bool {
        self.processes.write().remove(&pid).is_some()
    }

    /// プロセス空間を検索する
    pub fn process(&self, pid: ProcessId) -> Option<Arc<RwLock<ProcessSpace>>> {
        self.processes.read().get(&pid).cloned()
    }

    /// 登録済みプロセス数
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    // ========================================================================
    // 物理領域予約
    // プラットフォームから名指しの物理範囲を占有する。
    // 既存の予約・使用中フレームとの衝突は拒否。
    // ========================================================================

    /// 物理領域を予約する
    pub fn reserve_region(
        &self,
        base: PhysAddr,
        bytes: usize,
        name: &'static str,
    ) -> HalResult<()> {
        if bytes == 0 || base.page_offset() != 0 || bytes % PAGE_SIZE_4K != 0 {
            return Err(HalError::InvalidArgument);
        }

        let mut regions = self.reserved_regions.lock();
        if regions.iter().any(|r| r.overlaps(base, bytes)) {
            self.region_conflicts.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "region {}: conflict at {:#x}..{:#x}",
                name,
                base.as_usize(),
                base.as_usize() + bytes
            );
            return Err(HalError::OutOfResources);
        }

        let frames = bytes / PAGE_SIZE_4K;
        let mut ram = self.sysram.lock();
        if !ram.contains(base) || !ram.contains(base.add(bytes - 1)) {
            return Err(HalError::InvalidArgument);
        }
        if !ram.claim_range(base.frame(), frames) {
            self.region_conflicts.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "region {}: frames busy at {:#x}..{:#x}",
                name,
                base.as_usize(),
                base.as_usize() + bytes
            );
            return Err(HalError::OutOfResources);
        }
        drop(ram);

        regions.push(ReservedRegion { base, bytes, name });
        self.regions_reserved.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "region {}: reserved {:#x}..{:#x}",
            name,
            base.as_usize(),
            base.as_usize() + bytes
        );
        Ok(())
    }

    /// 予約済み物理領域を返却する
    pub fn release_region(&self, base: PhysAddr) -> HalResult<()> {
        let mut regions = self.reserved_regions.lock();
        let index = regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(HalError::InvalidArgument)?;
        let region = regions.swap_remove(index);
        self.sysram
            .lock()
            .release_range(region.base.frame(), region.bytes / PAGE_SIZE_4K);
        Ok(())
    }

    /// 予約済み領域数
    pub fn region_count(&self) -> usize {
        self.reserved_regions.lock().len()
    }

    // ========================================================================
    // カーネルマッピングサービス
    // ========================================================================

    /// ページ列をカーネル vmap ウィンドウへマップする
    pub fn kernel_map(&self, backing: RegionBacking, bytes: usize) -> HalResult<MappedAddress> {
        self.kmap.lock().map(backing, bytes)
    }

    /// vmap マッピングを解除する
    pub fn kernel_unmap(&self, addr: MappedAddress) -> HalResult<()> {
        self.kmap.lock().unmap(addr)
    }

    /// カーネル仮想アドレスを物理アドレスへ変換する
    ///
    /// 直結ウィンドウと vmap ウィンドウの双方を解決する。
    pub fn kernel_translate(&self, addr: MappedAddress) -> Option<PhysAddr> {
        if kmap::direct_window_contains(addr) {
            let phys = kmap::direct_to_phys(addr);
            if self.sysram.lock().contains(phys) {
                return Some(phys);
            }
            return None;
        }
        self.kmap.lock().translate(addr)
    }

    /// マップ済み範囲の各ページへアクセスして常駐させる
    pub fn touch_range(&self, addr: MappedAddress, bytes: usize) -> HalResult<()> {
        if bytes == 0 {
            return Err(HalError::InvalidArgument);
        }
        let mut offset = 0;
        while offset < bytes {
            let page_addr = addr.add(offset);
            let phys = self
                .kernel_translate(page_addr)
                .ok_or(HalError::GenericIo)?;
            let mut probe = [0u8; 1];
            self.sysram
                .lock()
                .read_bytes(phys, &mut probe)
                .map_err(|_| HalError::GenericIo)?;
            self.kernel_touches.fetch_add(1, Ordering::Relaxed);
            offset += PAGE_SIZE_4K;
        }
        Ok(())
    }

    /// カーネル仮想アドレス経由で読み取る
    ///
    /// vmap の散在バッキングを跨ぐため、ページ境界ごとに変換する。
    pub fn kernel_read(&self, addr: MappedAddress, buf: &mut [u8]) -> HalResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr.add(done);
            let in_page = cur.as_usize() % PAGE_SIZE_4K;
            let chunk = (PAGE_SIZE_4K - in_page).min(buf.len() - done);
            let phys = self.kernel_translate(cur).ok_or(HalError::GenericIo)?;
            self.sysram
                .lock()
                .read_bytes(phys, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// カーネル仮想アドレス経由で書き込む
    pub fn kernel_write(&self, addr: MappedAddress, data: &[u8]) -> HalResult<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = addr.add(done);
            let in_page = cur.as_usize() % PAGE_SIZE_4K;
            let chunk = (PAGE_SIZE_4K - in_page).min(data.len() - done);
            let phys = self.kernel_translate(cur).ok_or(HalError::GenericIo)?;
            self.sysram
                .lock()
                .write_bytes(phys, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    // ========================================================================
    // 統計
    // ========================================================================

    pub(crate) fn note_index_fast_alloc(&self) {
        self.index_fast_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_index_fast_free(&self) {
        self.index_fast_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_index_flex_alloc(&self) {
        self.index_flex_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_index_flex_free(&self) {
        self.index_flex_frees.fetch_add(1, Ordering::Relaxed);
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> OsStats {
        OsStats {
            index_fast_allocs: self.index_fast_allocs.load(Ordering::Relaxed),
            index_fast_frees: self.index_fast_frees.load(Ordering::Relaxed),
            index_flex_allocs: self.index_flex_allocs.load(Ordering::Relaxed),
            index_flex_frees: self.index_flex_frees.load(Ordering::Relaxed),
            regions_reserved: self.regions_reserved.load(Ordering::Relaxed),
            region_conflicts: self.region_conflicts.load(Ordering::Relaxed),
            kernel_touches: self.kernel_touches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sysram::FrameIndex;
    use alloc::vec;

    fn small_os() -> OsContext {
        OsContext::new(OsConfig {
            ram: SystemRamConfig {
                total_frames: 64,
                lowmem_frames: 48,
            },
            non_paged_cacheable: false,
        })
        .unwrap()
    }

    #[test]
    fn test_register_process_is_idempotent() {
        let os = small_os();
        let pid = ProcessId::new(42);
        let a = os.register_process(pid);
        let b = os.register_process(pid);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(os.process_count(), 1);
        assert!(os.remove_process(pid));
        assert!(os.process(pid).is_none());
    }

    #[test]
    fn test_reserve_region_conflict() {
        let os = small_os();
        let base = PhysAddr::new(0x10000);
        os.reserve_region(base, 4 * PAGE_SIZE_4K, "pool-a").unwrap();
        // 一部でも重なれば拒否
        let overlap = PhysAddr::new(0x12000);
        assert_eq!(
            os.reserve_region(overlap, 4 * PAGE_SIZE_4K, "pool-b"),
            Err(HalError::OutOfResources)
        );
        assert_eq!(os.stats().region_conflicts, 1);
        os.release_region(base).unwrap();
        // 解放後は再予約できる
        os.reserve_region(overlap, 4 * PAGE_SIZE_4K, "pool-b").unwrap();
    }

    #[test]
    fn test_reserve_region_rejects_busy_frames() {
        let os = small_os();
        let frame = os.sysram().lock().allocate_page_in(sysram::Zone::Low).unwrap();
        let result = os.reserve_region(frame.to_phys_addr(), PAGE_SIZE_4K, "busy");
        assert_eq!(result, Err(HalError::OutOfResources));
    }

    #[test]
    fn test_kernel_map_and_rw_roundtrip() {
        let os = small_os();
        let (fa, fb) = {
            let mut ram = os.sysram().lock();
            (ram.allocate_page().unwrap(), ram.allocate_page().unwrap())
        };
        let backing = RegionBacking::Pages(vec![fa, fb]);
        let addr = os.kernel_map(backing, 2 * PAGE_SIZE_4K).unwrap();

        // ページ境界を跨ぐ書き込みと読み戻し
        let data = [0x5A_u8; 64];
        let cross = addr.add(PAGE_SIZE_4K - 32);
        os.kernel_write(cross, &data).unwrap();
        let mut back = [0u8; 64];
        os.kernel_read(cross, &mut back).unwrap();
        assert_eq!(back, data);

        os.touch_range(addr, 2 * PAGE_SIZE_4K).unwrap();
        assert_eq!(os.stats().kernel_touches, 2);
        os.kernel_unmap(addr).unwrap();
    }

    #[test]
    fn test_kernel_translate_direct_window() {
        let os = small_os();
        let frame = FrameIndex::new(3);
        let virt = kmap::phys_to_virt(frame.to_phys_addr());
        assert_eq!(os.kernel_translate(virt), Some(frame.to_phys_addr()));
        // RAM範囲外の直結アドレスは解決しない
        let beyond = kmap::phys_to_virt(PhysAddr::new((1 << 30) as u64));
        assert!(os.kernel_translate(beyond).is_none());
    }
}
