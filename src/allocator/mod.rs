// ============================================================================
// src/allocator/mod.rs - Allocator Interface & Registry
// 設計書 4.1: アロケータ操作テーブルとインポート機構
//
// 注意: レジストリの並び順がそのまま試行優先順になる。記述子の
// 構築に失敗したアロケータは警告を出して読み飛ばし、残りで続行する。
// 利用可能なアロケータが1つも無いレジストリも有効な状態である。
// ============================================================================

pub mod gfp;

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::HalResult;
use crate::mdl::Mdl;
use crate::os::process::MappedAddress;
use crate::os::sysram::PhysAddr;
use crate::os::{OsContext, ProcessId};

bitflags! {
    /// 割り当て要求フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// 物理的に連続したページを要求する
        const CONTIGUOUS = 1 << 0;
        /// キャッシュ有効で確保する
        const CACHEABLE = 1 << 1;
    }
}

/// キャッシュ保守操作の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// 書き戻しのみ
    Clean,
    /// 破棄のみ
    Invalidate,
    /// 書き戻してから破棄
    Flush,
}

/// アロケータ操作テーブル
///
/// MDLを生成した操作と同じ実装が、そのMDLの全ライフサイクル操作を
/// 担当する。`alloc` は `Arc` レシーバを取り、生成するMDLへ自身への
/// 参照を埋め込む。
pub trait AllocatorOps: Send + Sync {
    /// num_pages ページを割り当ててMDLを生成する
    fn alloc(self: Arc<Self>, num_pages: usize, flags: AllocFlags) -> HalResult<Mdl>;

    /// MDLを消費して全ページを返却する
    fn free(&self, mdl: Mdl);

    /// プロセス空間へマップし、記録を追加する
    fn map_user(
        &self,
        mdl: &Mdl,
        process: ProcessId,
        cacheable: bool,
    ) -> HalResult<MappedAddress>;

    /// プロセス空間のマッピングを解除し、記録を取り外す
    fn unmap_user(
        &self,
        mdl: &Mdl,
        process: ProcessId,
        logical: MappedAddress,
        bytes: usize,
    ) -> HalResult<()>;

    /// カーネル空間へマップする
    fn map_kernel(&self, mdl: &Mdl) -> HalResult<MappedAddress>;

    /// カーネルマッピングを解除する
    fn unmap_kernel(&self, mdl: &Mdl, logical: MappedAddress) -> HalResult<()>;

    /// 論理アドレスを物理アドレスへ変換する
    fn logical_to_physical(
        &self,
        mdl: &Mdl,
        logical: MappedAddress,
        process: ProcessId,
    ) -> HalResult<PhysAddr>;

    /// 範囲のキャッシュ保守を行う
    fn cache(
        &self,
        mdl: &Mdl,
        logical: MappedAddress,
        physical: PhysAddr,
        bytes: usize,
        op: CacheOp,
    ) -> HalResult<()>;

    /// MDL内バイトオフセットの物理アドレスを取得する
    fn physical(&self, mdl: &Mdl, offset: usize) -> HalResult<PhysAddr>;
}

// ===== 記述子とレジストリ =====

/// アロケータ記述子
///
/// 名前と構築関数の組。構築はOSコンテキストを受け取り、自己診断に
/// 失敗したら `Err` を返してよい。
#[derive(Clone, Copy)]
pub struct AllocatorDescriptor {
    pub name: &'static str,
    pub construct: fn(Arc<OsContext>) -> HalResult<Arc<dyn AllocatorOps>>,
}

/// インポート済みアロケータ
pub struct RegisteredAllocator {
    name: &'static str,
    ops: Arc<dyn AllocatorOps>,
}

impl RegisteredAllocator {
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn ops(&self) -> &Arc<dyn AllocatorOps> {
        &self.ops
    }
}

/// アロケータレジストリ
///
/// 並び順 = 試行優先順。
pub struct AllocatorRegistry {
    entries: Vec<RegisteredAllocator>,
}

impl AllocatorRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAllocator> {
        self.entries.iter()
    }

    /// 名前で検索する
    pub fn find(&self, name: &str) -> Option<&RegisteredAllocator> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// 記述子テーブルからレジストリを構築する
///
/// 構築に失敗した記述子は警告ログを出して読み飛ばす。
pub fn import_allocators(
    os: &Arc<OsContext>,
    table: &[AllocatorDescriptor],
) -> AllocatorRegistry {
    let mut entries = Vec::new();
    for desc in table {
        match (desc.construct)(os.clone()) {
            Ok(ops) => {
                log::debug!("allocator {}: imported", desc.name);
                entries.push(RegisteredAllocator {
                    name: desc.name,
                    ops,
                });
            }
            Err(err) => {
                log::warn!("allocator {}: unavailable ({})", desc.name, err);
            }
        }
    }
    AllocatorRegistry { entries }
}

/// 既定のアロケータテーブル
pub const DEFAULT_ALLOCATOR_TABLE: &[AllocatorDescriptor] = &[AllocatorDescriptor {
    name: "gfp",
    construct: gfp::construct,
}];
