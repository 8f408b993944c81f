// ============================================================================
// src/os/sysram.rs - Simulated System RAM & Physical Frame Table
// 設計書 2.1: lowmem/highmem 2ゾーンのビットマップフレーム管理
//
// 注意: 構造体全体が呼び出し側の Mutex で保護されるため、内部の
// カウンタは通常の u64 を使用。Mutex + Atomic の二重化はオーバーヘッド。
// ============================================================================
#![allow(dead_code)]

use alloc::vec::Vec;

use crate::error::{HalError, HalResult};

// ============================================================================
// 型安全性: 物理アドレスとフレーム番号の Newtype
// 物理アドレス・フレームインデックス・仮想アドレスの取り違えを
// コンパイル時に防ぐ
// ============================================================================

/// 4KiB ページサイズ
pub const PAGE_SIZE_4K: usize = 4096;

/// 物理アドレス (Newtype)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// ページ内オフセット
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 as usize) % PAGE_SIZE_4K
    }

    /// このアドレスを含むフレーム番号
    #[inline]
    pub const fn frame(self) -> FrameIndex {
        FrameIndex::from_phys_addr(self.0)
    }

    /// バイトオフセットを加算したアドレス
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

/// フレーム番号（物理アドレス / PAGE_SIZE_4K）
///
/// 型安全性のための Newtype パターン。
/// `usize` や `PhysAddr` との取り違えをコンパイル時に検出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex(usize);

impl FrameIndex {
    /// フレーム番号から作成
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// 物理アドレスからフレーム番号を計算
    #[inline]
    pub const fn from_phys_addr(addr: u64) -> Self {
        Self((addr as usize) / PAGE_SIZE_4K)
    }

    /// フレーム番号を物理アドレスに変換
    #[inline]
    pub const fn to_phys_addr(self) -> PhysAddr {
        PhysAddr::new((self.0 * PAGE_SIZE_4K) as u64)
    }

    /// 生の値を取得
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// n フレーム先のフレーム番号
    #[inline]
    pub const fn offset(self, n: usize) -> Self {
        Self(self.0 + n)
    }

    /// ビットマップのワードインデックスを取得
    #[inline]
    pub const fn word_index(self) -> usize {
        self.0 / 64
    }

    /// ビットマップ内のビット位置を取得
    #[inline]
    pub const fn bit_index(self) -> usize {
        self.0 % 64
    }
}

/// フレームゾーン
///
/// Low はカーネルがアドレス指定でキャッシュ保守できる領域、
/// High はページ単位のフォールバック保守が必要な領域。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Low,
    High,
}

// ============================================================================
// 設定
// ============================================================================

/// システムRAMの構成
#[derive(Debug, Clone, Copy)]
pub struct SystemRamConfig {
    /// 総フレーム数
    pub total_frames: usize,
    /// lowmem ゾーンのフレーム数 (残りが highmem)
    pub lowmem_frames: usize,
}

impl Default for SystemRamConfig {
    fn default() -> Self {
        // 16MiB RAM / うち 12MiB を lowmem とする
        Self {
            total_frames: 4096,
            lowmem_frames: 3072,
        }
    }
}

// ============================================================================
// SystemRam 本体
// ============================================================================

/// シミュレートされたシステムRAM
///
/// 実バイト列 (`Vec<u8>`) とビットマップフレームテーブルを持ち、
/// 物理アドレス経由の読み書きとキャッシュ保守の記録を提供する。
/// ホスト上のテストはこのバイト列を通して実メモリ動作を観測できる。
pub struct SystemRam {
    /// 実バッキングストア (total_frames * PAGE_SIZE_4K バイト)
    ram: Vec<u8>,
    /// 使用中ビットマップ (1 = 使用中)
    bitmap: Vec<u64>,
    /// 予約マークビットマップ (1 = reserved)
    reserved: Vec<u64>,
    /// 総フレーム数
    total_frames: usize,
    /// lowmem 境界
    lowmem_frames: usize,
    /// 空きフレーム数
    free_frames: usize,
    /// lowmem ゾーンの次回探索ヒント
    hint_low: usize,
    /// highmem ゾーンの次回探索ヒント
    hint_high: usize,
    // 統計 (Mutex 保護下なので通常の u64)
    pages_allocated: u64,
    pages_freed: u64,
    flushes_by_address: u64,
    flushes_by_page: u64,
}

/// SystemRam 統計のスナップショット
#[derive(Debug, Clone, Copy)]
pub struct RamStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub flushes_by_address: u64,
    pub flushes_by_page: u64,
}

impl SystemRam {
    /// 構成からRAMを構築する
    pub fn new(config: SystemRamConfig) -> HalResult<Self> {
        if config.total_frames == 0 || config.lowmem_frames > config.total_frames {
            return Err(HalError::InvalidArgument);
        }

        let bytes = config.total_frames * PAGE_SIZE_4K;
        let mut ram = Vec::new();
        ram.try_reserve(bytes).map_err(|_| HalError::OutOfMemory)?;
        ram.resize(bytes, 0);

        let words = config.total_frames.div_ceil(64);
        let mut bitmap = Vec::new();
        bitmap
            .try_reserve(words)
            .map_err(|_| HalError::OutOfMemory)?;
        bitmap.resize(words, 0);

        let mut reserved = Vec::new();
        reserved
            .try_reserve(words)
            .map_err(|_| HalError::OutOfMemory)?;
        reserved.resize(words, 0);

        Ok(Self {
            ram,
            bitmap,
            reserved,
            total_frames: config.total_frames,
            lowmem_frames: config.lowmem_frames,
            free_frames: config.total_frames,
            hint_low: 0,
            hint_high: config.lowmem_frames,
            pages_allocated: 0,
            pages_freed: 0,
            flushes_by_address: 0,
            flushes_by_page: 0,
        })
    }

    /// 総フレーム数
    #[inline]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// 空きフレーム数
    #[inline]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// lowmem 境界 (このフレーム番号以降が highmem)
    #[inline]
    pub const fn lowmem_frames(&self) -> usize {
        self.lowmem_frames
    }

    /// フレームが highmem ゾーンに属するか
    #[inline]
    pub const fn is_highmem(&self, frame: FrameIndex) -> bool {
        frame.as_usize() >= self.lowmem_frames
    }

    /// 物理アドレスがRAM範囲内か
    #[inline]
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr.as_usize() < self.ram.len()
    }

    /// ゾーンのフレーム範囲 [start, end)
    const fn zone_range(&self, zone: Zone) -> (usize, usize) {
        match zone {
            Zone::Low => (0, self.lowmem_frames),
            Zone::High => (self.lowmem_frames, self.total_frames),
        }
    }

    // ========================================================================
    // ビットマップ操作
    // ========================================================================

    #[inline]
    fn is_used(&self, frame: FrameIndex) -> bool {
        (self.bitmap[frame.word_index()] >> frame.bit_index()) & 1 != 0
    }

    #[inline]
    fn mark_used(&mut self, frame: FrameIndex) {
        debug_assert!(!self.is_used(frame));
        self.bitmap[frame.word_index()] |= 1 << frame.bit_index();
        self.free_frames -= 1;
    }

    #[inline]
    fn mark_free(&mut self, frame: FrameIndex) {
        debug_assert!(self.is_used(frame));
        self.bitmap[frame.word_index()] &= !(1 << frame.bit_index());
        self.free_frames += 1;
    }

    // ========================================================================
    // 単一ページ割り当て
    // highmem 優先 (GFP_HIGHUSER 相当)、枯渇時に lowmem へフォールバック
    // ========================================================================

    /// 1ページ割り当てる。highmem を優先し、無ければ lowmem を使う。
    pub fn allocate_page(&mut self) -> Option<FrameIndex> {
        if let Some(frame) = self.allocate_page_in(Zone::High) {
            return Some(frame);
        }
        self.allocate_page_in(Zone::Low)
    }

    /// 指定ゾーンから1ページ割り当てる
    pub fn allocate_page_in(&mut self, zone: Zone) -> Option<FrameIndex> {
        let (start, end) = self.zone_range(zone);
        if start == end {
            return None;
        }

        let hint = match zone {
            Zone::Low => self.hint_low,
            Zone::High => self.hint_high,
        };
        let hint = hint.clamp(start, end - 1);

        // ヒントから末尾、次に先頭からヒントまで走査
        let found = self
            .scan_free(hint, end)
            .or_else(|| self.scan_free(start, hint));

        let frame = found?;
        self.mark_used(frame);
        self.pages_allocated += 1;
        match zone {
            Zone::Low => self.hint_low = frame.as_usize() + 1,
            Zone::High => self.hint_high = frame.as_usize() + 1,
        }
        Some(frame)
    }

    fn scan_free(&self, start: usize, end: usize) -> Option<FrameIndex> {
        (start..end)
            .map(FrameIndex::new)
            .find(|&f| !self.is_used(f))
    }

    /// 1ページ解放する
    ///
    /// 予約マークが残ったままの解放は呼び出し規約違反。
    pub fn free_page(&mut self, frame: FrameIndex) {
        debug_assert!(!self.is_reserved(frame));
        self.mark_free(frame);
        self.pages_freed += 1;
        if self.is_highmem(frame) {
            if frame.as_usize() < self.hint_high {
                self.hint_high = frame.as_usize();
            }
        } else if frame.as_usize() < self.hint_low {
            self.hint_low = frame.as_usize();
        }
    }

    // ========================================================================
    // 連続割り当て (first-fit、アライメント付き)
    // ========================================================================

    /// 指定ゾーンから連続 count フレームを first-fit で割り当てる
    ///
    /// alignment はフレーム単位 (1 = 制約なし)。
    pub fn allocate_contiguous(
        &mut self,
        count: usize,
        zone: Zone,
        alignment: usize,
    ) -> Option<FrameIndex> {
        if count == 0 {
            return None;
        }
        let align = alignment.max(1);
        let (zone_start, zone_end) = self.zone_range(zone);

        let mut start = zone_start.next_multiple_of(align);
        'outer: while start + count <= zone_end {
            for i in 0..count {
                if self.is_used(FrameIndex::new(start + i)) {
                    start = (start + i + 1).next_multiple_of(align);
                    continue 'outer;
                }
            }
            for i in 0..count {
                self.mark_used(FrameIndex::new(start + i));
            }
            self.pages_allocated += count as u64;
            return Some(FrameIndex::new(start));
        }
        None
    }

    /// 連続フレーム列を解放する
    pub fn free_contiguous(&mut self, base: FrameIndex, count: usize) {
        for i in 0..count {
            let frame = base.offset(i);
            debug_assert!(!self.is_reserved(frame));
            self.mark_free(frame);
        }
        self.pages_freed += count as u64;
        if base.as_usize() < self.lowmem_frames {
            self.hint_low = self.hint_low.min(base.as_usize());
        } else {
            self.hint_high = self.hint_high.min(base.as_usize());
        }
    }

    // ========================================================================
    // 名指しの範囲占有 (物理領域予約用)
    // ========================================================================

    /// base から count フレームを名指しで占有する
    ///
    /// 1フレームでも使用中または範囲外なら何も変更せず false を返す。
    pub fn claim_range(&mut self, base: FrameIndex, count: usize) -> bool {
        if count == 0 || base.as_usize() + count > self.total_frames {
            return false;
        }
        for i in 0..count {
            if self.is_used(base.offset(i)) {
                return false;
            }
        }
        for i in 0..count {
            self.mark_used(base.offset(i));
        }
        true
    }

    /// `claim_range` で占有した範囲を返す
    pub fn release_range(&mut self, base: FrameIndex, count: usize) {
        for i in 0..count {
            self.mark_free(base.offset(i));
        }
    }

    // ========================================================================
    // 予約マーク
    // 割り当て済みページに対する reserve/unreserve の対称性は
    // 上位のアロケータが保証する
    // ========================================================================

    /// フレームに予約マークを付ける
    pub fn mark_reserved(&mut self, frame: FrameIndex) {
        self.reserved[frame.word_index()] |= 1 << frame.bit_index();
    }

    /// フレームの予約マークを外す
    pub fn clear_reserved(&mut self, frame: FrameIndex) {
        self.reserved[frame.word_index()] &= !(1 << frame.bit_index());
    }

    /// フレームが予約マーク済みか
    pub fn is_reserved(&self, frame: FrameIndex) -> bool {
        (self.reserved[frame.word_index()] >> frame.bit_index()) & 1 != 0
    }

    // ========================================================================
    // キャッシュ保守の記録
    // 実キャッシュの代わりに呼び出し回数を記録する
    // ========================================================================

    /// アドレス指定のキャッシュフラッシュ (lowmem 用)
    pub fn flush_by_address(&mut self, addr: PhysAddr, bytes: usize) -> HalResult<()> {
        if bytes == 0 || addr.as_usize() + bytes > self.ram.len() {
            return Err(HalError::InvalidArgument);
        }
        self.flushes_by_address += 1;
        Ok(())
    }

    /// ページ構造体指定のdcacheフラッシュ (highmem フォールバック)
    pub fn flush_page(&mut self, frame: FrameIndex) -> HalResult<()> {
        if frame.as_usize() >= self.total_frames {
            return Err(HalError::InvalidArgument);
        }
        self.flushes_by_page += 1;
        Ok(())
    }

    // ========================================================================
    // 物理アドレス経由の読み書き
    // ========================================================================

    /// 物理アドレスから読み取る
    pub fn read_bytes(&self, addr: PhysAddr, buf: &mut [u8]) -> HalResult<()> {
        let start = addr.as_usize();
        let end = start.checked_add(buf.len()).ok_or(HalError::InvalidArgument)?;
        if end > self.ram.len() {
            return Err(HalError::InvalidArgument);
        }
        buf.copy_from_slice(&self.ram[start..end]);
        Ok(())
    }

    /// 物理アドレスへ書き込む
    pub fn write_bytes(&mut self, addr: PhysAddr, data: &[u8]) -> HalResult<()> {
        let start = addr.as_usize();
        let end = start
            .checked_add(data.len())
            .ok_or(HalError::InvalidArgument)?;
        if end > self.ram.len() {
            return Err(HalError::InvalidArgument);
        }
        self.ram[start..end].copy_from_slice(data);
        Ok(())
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> RamStats {
        RamStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            pages_allocated: self.pages_allocated,
            pages_freed: self.pages_freed,
            flushes_by_address: self.flushes_by_address,
            flushes_by_page: self.flushes_by_page,
        }
    }
}

// ============================================================================
// オーダー計算 (2のべき乗丸め)
// ============================================================================

/// count フレームを格納できる最小のオーダーを返す
pub const fn frames_to_order(count: usize) -> u32 {
    if count <= 1 {
        0
    } else {
        count.next_power_of_two().trailing_zeros()
    }
}

/// オーダー丸め後のフレーム数
pub const fn order_frames(count: usize) -> usize {
    1 << frames_to_order(count)
}
