//! メモリ記述子 (MDL) モジュール
//!
//! 1回の割り当てを表す記述子を定義します。物理ページの持ち方は
//! [`PageStorage`] のタグ付き列挙で表し、連続ラン (`Contiguous`) と
//! 散在ページ列 (`Scattered`) のどちらか一方のみが存在します。
//! 割り当てに失敗した場合は記述子そのものが作られないため、
//! 「ページを持たないMDL」という状態は型の上で存在しません。
//!
//! 解放は記述子を値で消費するため、二重解放はコンパイル時に弾かれます。
//! ユーザマッピングの後始末は呼び出し側の責務であり、解放時に
//! マッピングリストは検査されません。

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::allocator::AllocatorOps;
use crate::os::pages::PageArray;
use crate::os::process::{MappedAddress, RegionBacking};
use crate::os::sysram::{FrameIndex, PhysAddr, PAGE_SIZE_4K};
use crate::os::ProcessId;

// ===== 物理ページの持ち方 =====

/// 物理的に連続したページのラン
#[derive(Debug, Clone, Copy)]
pub struct PageRun {
    base: FrameIndex,
    frames: usize,
}

impl PageRun {
    #[inline]
    pub const fn new(base: FrameIndex, frames: usize) -> Self {
        Self { base, frames }
    }

    #[inline]
    pub const fn base(&self) -> FrameIndex {
        self.base
    }

    #[inline]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// ラン先頭の物理アドレス
    #[inline]
    pub const fn base_phys(&self) -> PhysAddr {
        self.base.to_phys_addr()
    }

    /// i ページ目の先頭物理アドレス
    pub fn nth_phys(&self, index: usize) -> Option<PhysAddr> {
        if index < self.frames {
            Some(self.base.offset(index).to_phys_addr())
        } else {
            None
        }
    }
}

/// MDLの物理ページ格納形態
///
/// 連続か散在のどちらかのみ。空の格納形態は存在しない。
pub enum PageStorage {
    /// 物理的に連続したラン
    Contiguous(PageRun),
    /// ページ単位で散在する列
    Scattered(PageArray),
}

impl PageStorage {
    /// ページ数
    pub fn page_count(&self) -> usize {
        match self {
            Self::Contiguous(run) => run.frames(),
            Self::Scattered(array) => array.len(),
        }
    }

    #[inline]
    pub const fn is_contiguous(&self) -> bool {
        matches!(self, Self::Contiguous(_))
    }

    /// i ページ目の先頭物理アドレス
    pub fn phys_of_page(&self, index: usize) -> Option<PhysAddr> {
        match self {
            Self::Contiguous(run) => run.nth_phys(index),
            Self::Scattered(array) => array.phys(index),
        }
    }

    /// 先頭からのバイトオフセットを物理アドレスへ変換
    pub fn phys_at(&self, offset: usize) -> Option<PhysAddr> {
        let page = offset / PAGE_SIZE_4K;
        let in_page = offset % PAGE_SIZE_4K;
        self.phys_of_page(page)
            .map(|p| PhysAddr::new(p.as_u64() + in_page as u64))
    }

    /// マッピング用のリージョンバッキングを作る
    pub fn to_region_backing(&self) -> RegionBacking {
        match self {
            Self::Contiguous(run) => RegionBacking::Run {
                base: run.base(),
                frames: run.frames(),
            },
            Self::Scattered(array) => RegionBacking::Pages(array.to_frames()),
        }
    }
}

// ===== マッピング記録 =====

/// ユーザマッピング1件の記録
///
/// 同一プロセスが同じMDLを複数回マップした場合も記録は共有されず、
/// 呼び出しごとに独立した1件となる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord {
    pub process: ProcessId,
    pub base: MappedAddress,
    pub page_count: usize,
}

impl MappingRecord {
    /// アドレスがこのマッピング範囲に含まれるか
    pub fn contains(&self, addr: MappedAddress) -> bool {
        let start = self.base.as_usize();
        let end = start + self.page_count * PAGE_SIZE_4K;
        addr.as_usize() >= start && addr.as_usize() < end
    }
}

// ===== MDL本体 =====

/// メモリ記述子
///
/// 1回の割り当ての物理ページ、属性、ユーザマッピングの記録を保持する。
/// 生成したアロケータへの参照を持ち、解放は必ず同じアロケータへ戻る。
pub struct Mdl {
    num_pages: usize,
    /// 要求ページ数ちょうどで確保されたか (false ならオーダー丸め)
    exact: bool,
    /// ページング可能な汎用メモリか
    paged: bool,
    /// キャッシュ有効で確保されたか
    cacheable: bool,
    storage: PageStorage,
    allocator: Arc<dyn AllocatorOps>,
    /// マッピング記録。MDL単位の専用ロックで保護する。
    mappings: Mutex<Vec<MappingRecord>>,
}

impl core::fmt::Debug for Mdl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mdl")
            .field("num_pages", &self.num_pages)
            .field("exact", &self.exact)
            .field("paged", &self.paged)
            .field("cacheable", &self.cacheable)
            .field("contiguous", &self.storage.is_contiguous())
            .finish_non_exhaustive()
    }
}

impl Mdl {
    /// 記述子を構築する。ページ数は格納形態から導出される。
    pub fn new(
        storage: PageStorage,
        exact: bool,
        paged: bool,
        cacheable: bool,
        allocator: Arc<dyn AllocatorOps>,
    ) -> Self {
        let num_pages = storage.page_count();
        Self {
            num_pages,
            exact,
            paged,
            cacheable,
            storage,
            allocator,
            mappings: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub const fn num_pages(&self) -> usize {
        self.num_pages
    }

    #[inline]
    pub const fn size_bytes(&self) -> usize {
        self.num_pages * PAGE_SIZE_4K
    }

    #[inline]
    pub const fn is_exact(&self) -> bool {
        self.exact
    }

    #[inline]
    pub const fn is_paged(&self) -> bool {
        self.paged
    }

    #[inline]
    pub const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    #[inline]
    pub const fn storage(&self) -> &PageStorage {
        &self.storage
    }

    #[inline]
    pub const fn is_contiguous(&self) -> bool {
        self.storage.is_contiguous()
    }

    /// 生成元アロケータへの参照を取得する
    pub fn allocator(&self) -> Arc<dyn AllocatorOps> {
        self.allocator.clone()
    }

    /// 解放時に格納形態を取り出す (アロケータ専用)
    pub(crate) fn into_storage(self) -> PageStorage {
        self.storage
    }

    // ========================================================================
    // マッピング記録
    // ========================================================================

    /// マッピング記録を追加する
    pub fn add_mapping(&self, record: MappingRecord) {
        self.mappings.lock().push(record);
    }

    /// プロセスの最初のマッピング記録を検索する
    pub fn find_mapping(&self, process: ProcessId) -> Option<MappingRecord> {
        self.mappings
            .lock()
            .iter()
            .find(|m| m.process == process)
            .copied()
    }

    /// (プロセス, 開始アドレス) に一致する記録を取り外す
    pub fn take_mapping(
        &self,
        process: ProcessId,
        base: MappedAddress,
    ) -> Option<MappingRecord> {
        let mut mappings = self.mappings.lock();
        let index = mappings
            .iter()
            .position(|m| m.process == process && m.base == base)?;
        Some(mappings.swap_remove(index))
    }

    /// プロセスのマッピング記録のうち、アドレスを含むものを検索する
    pub fn mapping_containing(
        &self,
        process: ProcessId,
        addr: MappedAddress,
    ) -> Option<MappingRecord> {
        self.mappings
            .lock()
            .iter()
            .find(|m| m.process == process && m.contains(addr))
            .copied()
    }

    /// プロセスのマッピング記録数
    pub fn mapping_count_for(&self, process: ProcessId) -> usize {
        self.mappings
            .lock()
            .iter()
            .filter(|m| m.process == process)
            .count()
    }

    /// 全マッピング記録数
    pub fn total_mappings(&self) -> usize {
        self.mappings.lock().len()
    }
}
