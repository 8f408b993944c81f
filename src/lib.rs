//! galcore-mm - GPUカーネルドライバのメモリ管理サブシステム
//!
//! GPUデバイスドライバのメモリ割り当て層を実装します。構成要素:
//!
//! - **OS抽象化層** ([`os`]): シミュレートされたシステムRAM、プロセス
//!   空間、カーネルマッピング、物理領域予約
//! - **メモリ記述子** ([`mdl`]): 連続/散在のタグ付き物理ページ格納と
//!   マッピング記録
//! - **アロケータ** ([`allocator`]): 9操作のアロケータテーブルと
//!   読み飛ばし式レジストリ
//! - **デバイス層** ([`device`]): バンク分割ヒープ、3種のプール、
//!   線形割り当てのフォールバック連鎖
//! - **割り込み通知** ([`irq`]): ISRからワーカへのロックフリー通知
//!
//! グローバル状態は持たず、`Arc<OsContext>` を起点に全てを依存注入で
//! 組み立てます。ホスト上のテストをそのまま実行できます。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod allocator;
pub mod device;
pub mod error;
pub mod irq;
pub mod mdl;
pub mod os;

// ===== 主要型の再エクスポート =====

// ステータス
pub use error::{HalError, HalResult};

// OS層
pub use os::pages::{IndexBacking, PageArray, PageHandle, FAST_INDEX_LIMIT};
pub use os::process::{CacheMode, MappedAddress, MappingSize, VmFlags};
pub use os::sysram::{FrameIndex, PhysAddr, SystemRamConfig, PAGE_SIZE_4K};
pub use os::{OsConfig, OsContext, OsStats, ProcessId};

// MDL
pub use mdl::{MappingRecord, Mdl, PageRun, PageStorage};

// アロケータ
pub use allocator::gfp::GfpAllocator;
pub use allocator::{
    import_allocators, AllocFlags, AllocatorDescriptor, AllocatorOps, AllocatorRegistry,
    CacheOp, DEFAULT_ALLOCATOR_TABLE,
};

// デバイス層
pub use device::{
    DeviceConfig, DeviceStats, GalDevice, GpuAddress, LinearAllocation, PoolKind,
    PoolSelector, SurfaceKind,
};

// 割り込み
pub use irq::{IrqNotifier, IrqStats};
