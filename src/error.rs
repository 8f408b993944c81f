//! 統一ステータスモジュール
//!
//! ドライバ全体で使用されるステータスコードを定義します。
//! 例外ではなくステータス値で伝播し、呼び出し側は `?` で委譲します。

use core::fmt;

/// ドライバ全体の統一ステータスコード
///
/// すべての失敗経路はこの4種に正規化される。非Okが返った時点で
/// 呼び出し先は部分状態を完全にロールバック済みである。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// ページまたは仮想領域の割り当てが枯渇
    OutOfMemory,
    /// 予約後の領域lookup失敗、またはメモリ領域予約の競合
    OutOfResources,
    /// 不正なフラグ・カウント、契約違反の呼び出し
    InvalidArgument,
    /// マッピングプリミティブの失敗、内部不整合
    GenericIo,
}

impl HalError {
    /// ログ出力用の短い説明文字列
    pub const fn as_str(self) -> &'static str {
        match self {
            HalError::OutOfMemory => "out of memory",
            HalError::OutOfResources => "out of resources",
            HalError::InvalidArgument => "invalid argument",
            HalError::GenericIo => "generic I/O failure",
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ドライバの結果型エイリアス
pub type HalResult<T> = Result<T, HalError>;
