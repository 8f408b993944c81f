// ============================================================================
// src/os/pages.rs - Scattered Page Arrays
// 設計書 2.4: ページ単位割り当てとインデックステーブルの二重戦略
//
// 注意: インデックステーブル自体のメモリも失敗しうる。小さなテーブルは
// 高速経路 (連続カーネルヒープ相当)、大きなテーブルは柔軟経路
// (仮想連続相当) で確保し、どちらで確保したかを配列に記録して解放時に
// 同じ経路へ返す。
// ============================================================================

use alloc::vec::Vec;
use core::mem::size_of;

use crate::error::{HalError, HalResult};
use crate::os::sysram::{FrameIndex, PhysAddr};
use crate::os::OsContext;

/// 高速経路で確保できるインデックステーブルの上限 (バイト)
pub const FAST_INDEX_LIMIT: usize = 128 * 1024;

/// インデックステーブルの確保経路
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBacking {
    /// 連続カーネルヒープ相当の高速経路
    Fast,
    /// 仮想連続相当の柔軟経路
    Flexible,
}

/// ページ数からインデックステーブルの経路を決める
#[inline]
pub const fn index_backing_for(count: usize) -> IndexBacking {
    if count * size_of::<PageHandle>() <= FAST_INDEX_LIMIT {
        IndexBacking::Fast
    } else {
        IndexBacking::Flexible
    }
}

/// 1物理ページへの不透明ハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle(FrameIndex);

impl PageHandle {
    #[inline]
    pub const fn new(frame: FrameIndex) -> Self {
        Self(frame)
    }

    #[inline]
    pub const fn frame(self) -> FrameIndex {
        self.0
    }

    /// ページ先頭の物理アドレス
    #[inline]
    pub const fn phys(self) -> PhysAddr {
        self.0.to_phys_addr()
    }
}

/// 散在ページ配列
///
/// ページ順のハンドル列と、インデックステーブルの確保経路を保持する。
#[derive(Debug)]
pub struct PageArray {
    handles: Vec<PageHandle>,
    backing: IndexBacking,
}

impl PageArray {
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[inline]
    pub const fn index_backing(&self) -> IndexBacking {
        self.backing
    }

    #[inline]
    pub fn handles(&self) -> &[PageHandle] {
        &self.handles
    }

    pub fn get(&self, index: usize) -> Option<PageHandle> {
        self.handles.get(index).copied()
    }

    /// i 番目のページ先頭の物理アドレス
    pub fn phys(&self, index: usize) -> Option<PhysAddr> {
        self.get(index).map(PageHandle::phys)
    }

    /// リージョンバッキング用のフレーム列を作る
    pub fn to_frames(&self) -> Vec<FrameIndex> {
        self.handles.iter().map(|h| h.frame()).collect()
    }
}

/// 散在ページ配列を割り当てる
///
/// 1ページずつ確保し、k ページ目で失敗した場合は確保済みの k ページと
/// インデックステーブルを全て返却してから `OutOfMemory` を返す。
/// 部分的に確保された配列が呼び出し側へ渡ることはない。
pub fn allocate_page_array(os: &OsContext, count: usize) -> HalResult<PageArray> {
    if count == 0 {
        return Err(HalError::InvalidArgument);
    }

    let backing = index_backing_for(count);

    let mut ram = os.sysram().lock();
    if count > ram.total_frames() {
        return Err(HalError::InvalidArgument);
    }

    let mut handles = Vec::new();
    if handles.try_reserve(count).is_err() {
        return Err(HalError::OutOfMemory);
    }
    match backing {
        IndexBacking::Fast => os.note_index_fast_alloc(),
        IndexBacking::Flexible => os.note_index_flex_alloc(),
    }

    for _ in 0..count {
        match ram.allocate_page() {
            Some(frame) => handles.push(PageHandle::new(frame)),
            None => {
                // 巻き戻し: 確保済みページとインデックスを返却
                for handle in &handles {
                    ram.free_page(handle.frame());
                }
                match backing {
                    IndexBacking::Fast => os.note_index_fast_free(),
                    IndexBacking::Flexible => os.note_index_flex_free(),
                }
                return Err(HalError::OutOfMemory);
            }
        }
    }

    Ok(PageArray { handles, backing })
}

/// 散在ページ配列を解放する
///
/// インデックステーブルは確保時と同じ経路へ返される。
pub fn free_page_array(os: &OsContext, array: PageArray) {
    let mut ram = os.sysram().lock();
    for handle in &array.handles {
        ram.free_page(handle.frame());
    }
    match array.backing {
        IndexBacking::Fast => os.note_index_fast_free(),
        IndexBacking::Flexible => os.note_index_flex_free(),
    }
}
