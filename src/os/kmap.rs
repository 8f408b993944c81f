// ============================================================================
// src/os/kmap.rs - Kernel Mapping Windows
// 設計書 2.3: 物理メモリ直結ウィンドウと vmap ウィンドウ
//
// 注意: 直結ウィンドウは lowmem の恒等オフセットマップを模したもので、
// マッピング操作なしで変換できる。散在ページや highmem は vmap 側の
// リージョンテーブルを経由する。
// ============================================================================
#![allow(dead_code)]

use alloc::collections::BTreeMap;

use crate::error::{HalError, HalResult};
use crate::os::process::{MappedAddress, RegionBacking};
use crate::os::sysram::{PhysAddr, PAGE_SIZE_4K};

/// 物理メモリ直結ウィンドウのベース仮想アドレス
pub const PHYSICAL_MEMORY_OFFSET: usize = 0xFFFF_8000_0000_0000;

/// vmap ウィンドウのベース仮想アドレス
pub const VMAP_BASE: usize = 0xFFFF_C000_0000_0000;

/// vmap ウィンドウの上限 (排他、1GiB)
pub const VMAP_LIMIT: usize = 0xFFFF_C000_4000_0000;

/// 物理アドレスを直結ウィンドウの仮想アドレスへ変換
#[inline]
pub const fn phys_to_virt(addr: PhysAddr) -> MappedAddress {
    MappedAddress::new(PHYSICAL_MEMORY_OFFSET + addr.as_usize())
}

/// アドレスが直結ウィンドウ内か
#[inline]
pub const fn direct_window_contains(addr: MappedAddress) -> bool {
    addr.as_usize() >= PHYSICAL_MEMORY_OFFSET && addr.as_usize() < VMAP_BASE
}

/// 直結ウィンドウの仮想アドレスを物理アドレスへ戻す
///
/// 呼び出し側が `direct_window_contains` で確認済みであること。
#[inline]
pub const fn direct_to_phys(addr: MappedAddress) -> PhysAddr {
    PhysAddr::new((addr.as_usize() - PHYSICAL_MEMORY_OFFSET) as u64)
}

// ============================================================================
// vmap リージョンテーブル
// ============================================================================

struct VmapRegion {
    base: MappedAddress,
    bytes: usize,
    backing: RegionBacking,
}

impl VmapRegion {
    fn end(&self) -> usize {
        self.base.as_usize() + self.bytes
    }

    fn contains(&self, addr: MappedAddress) -> bool {
        addr.as_usize() >= self.base.as_usize() && addr.as_usize() < self.end()
    }
}

/// カーネル vmap ウィンドウ
///
/// バッキング済みページ列をカーネル仮想アドレスへ割り付ける。
/// 解除は開始アドレス完全一致のみ。
pub struct KernelVmap {
    regions: BTreeMap<usize, VmapRegion>,
    next_addr: usize,
    map_count: u64,
    unmap_count: u64,
}

/// vmap 統計のスナップショット
#[derive(Debug, Clone, Copy)]
pub struct VmapStats {
    pub regions: usize,
    pub map_count: u64,
    pub unmap_count: u64,
}

impl KernelVmap {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_addr: VMAP_BASE,
            map_count: 0,
            unmap_count: 0,
        }
    }

    fn probe_from(&self, start: usize, bytes: usize) -> Option<usize> {
        let mut candidate = start.max(VMAP_BASE);
        for (&base, region) in &self.regions {
            if base >= candidate + bytes {
                break;
            }
            if region.end() > candidate {
                candidate = region.end();
            }
        }
        if candidate + bytes <= VMAP_LIMIT {
            Some(candidate)
        } else {
            None
        }
    }

    /// バッキング済みページ列をウィンドウへマップする
    pub fn map(&mut self, backing: RegionBacking, bytes: usize) -> HalResult<MappedAddress> {
        if bytes == 0 || backing.page_count() != bytes.div_ceil(PAGE_SIZE_4K) {
            return Err(HalError::InvalidArgument);
        }
        let base = self
            .probe_from(self.next_addr, bytes)
            .or_else(|| self.probe_from(VMAP_BASE, bytes))
            .ok_or(HalError::OutOfMemory)?;
        let addr = MappedAddress::new(base);
        self.regions.insert(
            base,
            VmapRegion {
                base: addr,
                bytes,
                backing,
            },
        );
        self.next_addr = base + bytes;
        self.map_count += 1;
        Ok(addr)
    }

    /// マッピングを解除する
    pub fn unmap(&mut self, base: MappedAddress) -> HalResult<()> {
        match self.regions.remove(&base.as_usize()) {
            Some(_) => {
                self.unmap_count += 1;
                Ok(())
            }
            None => Err(HalError::InvalidArgument),
        }
    }

    /// vmap ウィンドウ内のアドレスを物理アドレスへ変換する
    pub fn translate(&self, addr: MappedAddress) -> Option<PhysAddr> {
        let (_, region) = self.regions.range(..=addr.as_usize()).next_back()?;
        if !region.contains(addr) {
            return None;
        }
        region
            .backing
            .translate(addr.as_usize() - region.base.as_usize())
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> VmapStats {
        VmapStats {
            regions: self.regions.len(),
            map_count: self.map_count,
            unmap_count: self.unmap_count,
        }
    }
}

impl Default for KernelVmap {
    fn default() -> Self {
        Self::new()
    }
}
