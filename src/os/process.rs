//! プロセス仮想アドレス空間モジュール
//!
//! ユーザ空間マッピングの予約・確定・解除・変換を提供します。
//! 実ページテーブルの代わりに BTreeMap でリージョンを管理し、
//! 物理フレームへの変換はリージョンのバッキング情報から行います。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{HalError, HalResult};
use crate::os::sysram::{FrameIndex, PhysAddr, PAGE_SIZE_4K};

// ===== アドレス・サイズの Newtype =====

/// マップ済み仮想アドレス (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappedAddress(usize);

impl MappedAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// バイトオフセットを加算したアドレス
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

/// マッピングサイズ (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MappingSize(usize);

impl MappingSize {
    #[inline]
    pub const fn new(size: usize) -> Self {
        Self(size)
    }

    #[inline]
    pub const fn from_pages(pages: usize) -> Self {
        Self(pages * PAGE_SIZE_4K)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// 必要なページ数（切り上げ）
    #[inline]
    pub const fn page_count(self) -> usize {
        self.0.div_ceil(PAGE_SIZE_4K)
    }
}

bitflags! {
    /// マッピング属性フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        /// デバイスメモリ扱い (コアダンプ対象外)
        const IO = 1 << 0;
        /// fork 時に複製しない
        const DONT_COPY = 1 << 1;
        /// 伸長を許可しない
        const DONT_EXPAND = 1 << 2;
    }
}

/// キャッシュモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    NonCached,
}

// ===== リージョンのバッキング =====

/// リージョンが指す物理メモリ
#[derive(Debug, Clone)]
pub enum RegionBacking {
    /// 予約のみで物理ページ未確定
    Unbacked,
    /// 散在ページ列 (ページ順に格納)
    Pages(Vec<FrameIndex>),
    /// 物理的に連続したラン
    Run { base: FrameIndex, frames: usize },
}

impl RegionBacking {
    /// バッキングが保持するページ数
    pub fn page_count(&self) -> usize {
        match self {
            Self::Unbacked => 0,
            Self::Pages(frames) => frames.len(),
            Self::Run { frames, .. } => *frames,
        }
    }

    /// リージョン先頭からのバイトオフセットを物理アドレスへ変換
    pub fn translate(&self, offset: usize) -> Option<PhysAddr> {
        let page = offset / PAGE_SIZE_4K;
        let in_page = offset % PAGE_SIZE_4K;
        match self {
            Self::Unbacked => None,
            Self::Pages(frames) => frames
                .get(page)
                .map(|f| PhysAddr::new(f.to_phys_addr().as_u64() + in_page as u64)),
            Self::Run { base, frames } => {
                if page < *frames {
                    Some(PhysAddr::new(
                        base.to_phys_addr().as_u64() + offset as u64,
                    ))
                } else {
                    None
                }
            }
        }
    }
}

// ===== リージョン =====

/// 仮想アドレスリージョン
#[derive(Debug, Clone)]
pub struct VmRegion {
    base: MappedAddress,
    size: MappingSize,
    flags: VmFlags,
    cache_mode: CacheMode,
    backing: RegionBacking,
}

impl VmRegion {
    pub const fn new(
        base: MappedAddress,
        size: MappingSize,
        flags: VmFlags,
        cache_mode: CacheMode,
    ) -> Self {
        Self {
            base,
            size,
            flags,
            cache_mode,
            backing: RegionBacking::Unbacked,
        }
    }

    #[inline]
    pub const fn base(&self) -> MappedAddress {
        self.base
    }

    #[inline]
    pub const fn size(&self) -> MappingSize {
        self.size
    }

    /// リージョン終端 (排他)
    #[inline]
    pub const fn end(&self) -> usize {
        self.base.as_usize() + self.size.as_usize()
    }

    #[inline]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    #[inline]
    pub const fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    #[inline]
    pub const fn backing(&self) -> &RegionBacking {
        &self.backing
    }

    /// アドレスがこのリージョンに含まれるか
    pub fn contains(&self, addr: MappedAddress) -> bool {
        addr.as_usize() >= self.base.as_usize() && addr.as_usize() < self.end()
    }

    /// リージョン内アドレスを物理アドレスへ変換
    pub fn translate(&self, addr: MappedAddress) -> Option<PhysAddr> {
        if !self.contains(addr) {
            return None;
        }
        self.backing.translate(addr.as_usize() - self.base.as_usize())
    }
}

// ===== プロセス空間 =====

/// プロセス空間の統計情報
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpaceStats {
    pub regions: usize,
    pub bytes_mapped: usize,
    pub map_count: u64,
    pub unmap_count: u64,
}

/// プロセス単位の仮想アドレス空間
///
/// リージョンは開始アドレスをキーに BTreeMap で保持する。
/// アドレスは予約 (reserve) と確定 (commit) の2段階で割り当てられ、
/// 解除は開始アドレス完全一致のみを受け付ける。
pub struct ProcessSpace {
    regions: BTreeMap<usize, VmRegion>,
    next_addr: usize,
    map_count: u64,
    unmap_count: u64,
}

impl ProcessSpace {
    /// ユーザ空間マッピングのベースアドレス
    pub const USER_BASE: usize = 0x0000_7000_0000_0000;
    /// ユーザ空間マッピングの上限 (排他)
    pub const USER_LIMIT: usize = 0x0000_8000_0000_0000;

    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_addr: Self::USER_BASE,
            map_count: 0,
            unmap_count: 0,
        }
    }

    /// 空きアドレスを探す (線形プローブ)
    fn find_free_address(&self, size: usize) -> Option<usize> {
        self.probe_from(self.next_addr, size)
            .or_else(|| self.probe_from(Self::USER_BASE, size))
    }

    fn probe_from(&self, start: usize, size: usize) -> Option<usize> {
        let mut candidate = start.max(Self::USER_BASE);
        for (&base, region) in &self.regions {
            if base >= candidate + size {
                break;
            }
            if region.end() > candidate {
                candidate = region.end();
            }
        }
        if candidate + size <= Self::USER_LIMIT {
            Some(candidate)
        } else {
            None
        }
    }

    /// アドレス範囲を予約する (第1段階)
    ///
    /// 空間枯渇時は `OutOfMemory` を返す。
    pub fn reserve(
        &mut self,
        size: MappingSize,
        flags: VmFlags,
        cache_mode: CacheMode,
    ) -> HalResult<MappedAddress> {
        if size.as_usize() == 0 {
            return Err(HalError::InvalidArgument);
        }
        let base = self
            .find_free_address(size.as_usize())
            .ok_or(HalError::OutOfMemory)?;
        let addr = MappedAddress::new(base);
        self.regions
            .insert(base, VmRegion::new(addr, size, flags, cache_mode));
        self.next_addr = base + size.as_usize();
        self.map_count += 1;
        Ok(addr)
    }

    /// 予約済みリージョンを開始アドレスで検索する (第2段階)
    pub fn region(&self, base: MappedAddress) -> Option<&VmRegion> {
        self.regions.get(&base.as_usize())
    }

    /// 予約済みリージョンへバッキングを確定する (第3段階)
    ///
    /// ページ数がリージョンサイズと合わない場合は `InvalidArgument`。
    pub fn commit(&mut self, base: MappedAddress, backing: RegionBacking) -> HalResult<()> {
        let region = self
            .regions
            .get_mut(&base.as_usize())
            .ok_or(HalError::InvalidArgument)?;
        if backing.page_count() != region.size.page_count() {
            return Err(HalError::InvalidArgument);
        }
        region.backing = backing;
        Ok(())
    }

    /// リージョンを解除する
    ///
    /// 開始アドレス完全一致のみ。部分解除や範囲跨ぎは受け付けない。
    pub fn unmap(&mut self, base: MappedAddress) -> HalResult<MappingSize> {
        match self.regions.remove(&base.as_usize()) {
            Some(region) => {
                // 末尾のリージョンを外した場合は探索ヒントを巻き戻す
                if region.end() == self.next_addr {
                    self.next_addr = region.base.as_usize();
                }
                self.unmap_count += 1;
                Ok(region.size)
            }
            None => Err(HalError::InvalidArgument),
        }
    }

    /// 任意のアドレスを含むリージョンを検索する
    pub fn region_containing(&self, addr: MappedAddress) -> Option<&VmRegion> {
        self.regions
            .range(..=addr.as_usize())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// アドレスを物理アドレスへ変換する
    pub fn translate(&self, addr: MappedAddress) -> Option<PhysAddr> {
        self.region_containing(addr)?.translate(addr)
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> ProcessSpaceStats {
        ProcessSpaceStats {
            regions: self.regions.len(),
            bytes_mapped: self.regions.values().map(|r| r.size.as_usize()).sum(),
            map_count: self.map_count,
            unmap_count: self.unmap_count,
        }
    }
}

impl Default for ProcessSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_reserve_assigns_user_range() {
        let mut space = ProcessSpace::new();
        let addr = space
            .reserve(
                MappingSize::from_pages(4),
                VmFlags::IO,
                CacheMode::NonCached,
            )
            .unwrap();
        assert!(addr.as_usize() >= ProcessSpace::USER_BASE);
        assert_eq!(space.stats().regions, 1);
    }

    #[test]
    fn test_reserve_does_not_overlap() {
        let mut space = ProcessSpace::new();
        let a = space
            .reserve(MappingSize::from_pages(2), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        let b = space
            .reserve(MappingSize::from_pages(2), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        let a_end = a.as_usize() + 2 * PAGE_SIZE_4K;
        assert!(b.as_usize() >= a_end || b.as_usize() + 2 * PAGE_SIZE_4K <= a.as_usize());
    }

    #[test]
    fn test_commit_rejects_size_mismatch() {
        let mut space = ProcessSpace::new();
        let addr = space
            .reserve(MappingSize::from_pages(2), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        let backing = RegionBacking::Pages(vec![FrameIndex::new(3)]);
        assert_eq!(space.commit(addr, backing), Err(HalError::InvalidArgument));
    }

    #[test]
    fn test_translate_scattered_backing() {
        let mut space = ProcessSpace::new();
        let addr = space
            .reserve(MappingSize::from_pages(2), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        space
            .commit(
                addr,
                RegionBacking::Pages(vec![FrameIndex::new(7), FrameIndex::new(3)]),
            )
            .unwrap();
        let phys = space.translate(addr.add(PAGE_SIZE_4K + 16)).unwrap();
        assert_eq!(
            phys.as_u64(),
            FrameIndex::new(3).to_phys_addr().as_u64() + 16
        );
    }

    #[test]
    fn test_translate_run_backing() {
        let mut space = ProcessSpace::new();
        let addr = space
            .reserve(MappingSize::from_pages(4), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        space
            .commit(
                addr,
                RegionBacking::Run {
                    base: FrameIndex::new(10),
                    frames: 4,
                },
            )
            .unwrap();
        let phys = space.translate(addr.add(3 * PAGE_SIZE_4K)).unwrap();
        assert_eq!(phys, FrameIndex::new(13).to_phys_addr());
    }

    #[test]
    fn test_unmap_requires_exact_base() {
        let mut space = ProcessSpace::new();
        let addr = space
            .reserve(MappingSize::from_pages(2), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        // 中間アドレスでは解除できない
        assert_eq!(
            space.unmap(addr.add(PAGE_SIZE_4K)),
            Err(HalError::InvalidArgument)
        );
        assert_eq!(space.unmap(addr).unwrap(), MappingSize::from_pages(2));
        // 二重解除も InvalidArgument
        assert_eq!(space.unmap(addr), Err(HalError::InvalidArgument));
    }

    #[test]
    fn test_unbacked_region_translates_to_none() {
        let mut space = ProcessSpace::new();
        let addr = space
            .reserve(MappingSize::from_pages(1), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        assert!(space.translate(addr).is_none());
    }

    #[test]
    fn test_freed_range_is_reusable() {
        let mut space = ProcessSpace::new();
        let first = space
            .reserve(MappingSize::from_pages(8), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        space.unmap(first).unwrap();
        // 再走査で解放済み範囲を再利用できる
        let again = space
            .reserve(MappingSize::from_pages(8), VmFlags::empty(), CacheMode::Cached)
            .unwrap();
        assert_eq!(again, first);
    }
}
