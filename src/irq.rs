// ============================================================================
// src/irq.rs - Interrupt Notifier
// 設計書 6.1: ISR から下半分ワーカへの通知
//
// 注意: post_from_isr は割り込み文脈から呼ばれるため、ロック取得と
// ヒープ割り当てを一切行わない。デバイスへの再入はワーカ側の take
// 以降でのみ許される。
// ============================================================================

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// 割り込み通知機
///
/// ISR 側は旗を立てるだけで、実際の処理はワーカが引き取る。
pub struct IrqNotifier {
    pending: AtomicBool,
    posts: AtomicU64,
    wakes: AtomicU64,
}

/// 通知機統計のスナップショット
#[derive(Debug, Clone, Copy)]
pub struct IrqStats {
    pub posts: u64,
    pub wakes: u64,
    pub pending: bool,
}

impl IrqNotifier {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            posts: AtomicU64::new(0),
            wakes: AtomicU64::new(0),
        }
    }

    /// ISR 文脈から通知を投函する
    #[inline]
    pub fn post_from_isr(&self) {
        self.pending.store(true, Ordering::Release);
        self.posts.fetch_add(1, Ordering::Relaxed);
    }

    /// ワーカ側で通知を引き取る。通知が有った場合のみ true。
    pub fn take(&self) -> bool {
        let had = self.pending.swap(false, Ordering::Acquire);
        if had {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }
        had
    }

    /// 未処理の通知が残っているか
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> IrqStats {
        IrqStats {
            posts: self.posts.load(Ordering::Relaxed),
            wakes: self.wakes.load(Ordering::Relaxed),
            pending: self.has_pending(),
        }
    }
}

impl Default for IrqNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_take() {
        let notifier = IrqNotifier::new();
        assert!(!notifier.take());

        notifier.post_from_isr();
        notifier.post_from_isr();
        assert!(notifier.has_pending());

        // 複数回の投函も1回の引き取りにまとまる
        assert!(notifier.take());
        assert!(!notifier.take());

        let stats = notifier.stats();
        assert_eq!(stats.posts, 2);
        assert_eq!(stats.wakes, 1);
        assert!(!stats.pending);
    }
}
