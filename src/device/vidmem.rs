// ============================================================================
// src/device/vidmem.rs - Banked Video Memory Heap
// 設計書 5.1: バンク分割ヒープと面種別ごとの優先バンク
//
// 注意: ノード列は各バンク内を隙間なく敷き詰める。隣接ノードの
// オフセットが一致しない場合はヒープ破損として GenericIo を返す。
// ============================================================================

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{HalError, HalResult};

/// 面種別
///
/// バンク選択の優先度を決めるために使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SurfaceKind {
    Unknown = 0,
    RenderTarget,
    Depth,
    HierarchicalDepth,
    Texture,
    Vertex,
    Index,
    TileStatus,
    Bitmap,
}

impl SurfaceKind {
    pub const COUNT: usize = 9;

    #[inline]
    pub const fn as_index(self) -> usize {
        self as usize
    }
}

/// 管理可能なバンク数の上限
pub const MAX_BANKS: usize = SurfaceKind::COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Free,
    Allocated,
}

#[derive(Debug, Clone, Copy)]
struct HeapNode {
    bytes: usize,
    state: NodeState,
}

struct Bank {
    start: usize,
    bytes: usize,
    /// バンク内オフセット → ノード。キー順で隙間なく並ぶ。
    nodes: BTreeMap<usize, HeapNode>,
}

impl Bank {
    fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.start + self.bytes
    }
}

/// ヒープ統計のスナップショット
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub managed_bytes: usize,
    pub free_bytes: usize,
    pub banks: usize,
    pub allocs: u64,
    pub frees: u64,
    pub splits: u64,
    pub merges: u64,
}

/// バンク分割ビデオメモリヒープ
///
/// プール内オフセット空間 [0, managed_bytes) を管理する。
/// GPUアドレスへの変換は所有するプールが行う。
pub struct VidMemHeap {
    managed_bytes: usize,
    free_bytes: usize,
    threshold: usize,
    banks: Vec<Bank>,
    mapping: [usize; SurfaceKind::COUNT],
    allocs: u64,
    frees: u64,
    splits: u64,
    merges: u64,
}

impl VidMemHeap {
    /// ヒープを構築する
    ///
    /// `bank_size` が 0 なら単一バンク。上限を超えた残域は管理外と
    /// なる。
    pub fn construct(bytes: usize, bank_size: usize, threshold: usize) -> HalResult<Self> {
        if bytes == 0 {
            return Err(HalError::InvalidArgument);
        }

        let mut banks: Vec<Bank> = Vec::new();
        let mut offset = 0usize;
        let mut remaining = bytes;
        while remaining > 0 && banks.len() < MAX_BANKS {
            let bank_bytes = if bank_size == 0 {
                remaining
            } else {
                let next = (offset + 1).next_multiple_of(bank_size);
                (next - offset).min(remaining)
            };
            let mut nodes = BTreeMap::new();
            nodes.insert(
                offset,
                HeapNode {
                    bytes: bank_bytes,
                    state: NodeState::Free,
                },
            );
            banks.push(Bank {
                start: offset,
                bytes: bank_bytes,
                nodes,
            });
            offset += bank_bytes;
            remaining -= bank_bytes;
        }
        if remaining > 0 {
            log::debug!("vidmem: {} bytes beyond bank limit left unmanaged", remaining);
        }

        // 面種別を末尾バンクから順に割り付ける
        let mut mapping = [0usize; SurfaceKind::COUNT];
        let mut bank = banks.len() - 1;
        mapping[SurfaceKind::RenderTarget.as_index()] = bank;
        mapping[SurfaceKind::Bitmap.as_index()] = bank;
        if bank > 1 {
            bank -= 1;
        }
        mapping[SurfaceKind::Depth.as_index()] = bank;
        mapping[SurfaceKind::HierarchicalDepth.as_index()] = bank;
        if bank > 1 {
            bank -= 1;
        }
        mapping[SurfaceKind::Texture.as_index()] = bank;
        if bank > 1 {
            bank -= 1;
        }
        mapping[SurfaceKind::Vertex.as_index()] = bank;
        if bank > 1 {
            bank -= 1;
        }
        mapping[SurfaceKind::Index.as_index()] = bank;
        if bank > 1 {
            bank -= 1;
        }
        mapping[SurfaceKind::TileStatus.as_index()] = bank;
        mapping[SurfaceKind::Unknown.as_index()] = 0;

        let managed = offset;
        Ok(Self {
            managed_bytes: managed,
            free_bytes: managed,
            threshold,
            banks,
            mapping,
            allocs: 0,
            frees: 0,
            splits: 0,
            merges: 0,
        })
    }

    #[inline]
    pub const fn managed_bytes(&self) -> usize {
        self.managed_bytes
    }

    #[inline]
    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// 面種別の優先バンク
    #[inline]
    pub const fn preferred_bank(&self, kind: SurfaceKind) -> usize {
        self.mapping[kind.as_index()]
    }

    /// 全バンクのノード総数
    pub fn node_count(&self) -> usize {
        self.banks.iter().map(|b| b.nodes.len()).sum()
    }

    /// バンク内の空きノードを first-fit で探す
    ///
    /// 戻り値は (ノードオフセット, アライメント調整量)。
    fn fit_in_bank(&self, bank_idx: usize, bytes: usize, alignment: usize) -> Option<(usize, usize)> {
        for (&offset, node) in &self.banks[bank_idx].nodes {
            if node.state != NodeState::Free {
                continue;
            }
            let skip = if alignment == 0 {
                0
            } else {
                let rem = offset % alignment;
                if rem == 0 {
                    0
                } else {
                    alignment - rem
                }
            };
            if node.bytes >= bytes + skip {
                return Some((offset, skip));
            }
        }
        None
    }

    /// 線形割り当て
    ///
    /// 優先バンク、下位バンク (降順)、上位バンク (昇順) の順に探す。
    /// 戻り値はヒープ内オフセット。
    pub fn allocate_linear(
        &mut self,
        bytes: usize,
        alignment: usize,
        kind: SurfaceKind,
    ) -> HalResult<usize> {
        if bytes == 0 {
            return Err(HalError::InvalidArgument);
        }
        if bytes > self.free_bytes {
            return Err(HalError::OutOfMemory);
        }

        let preferred = self.mapping[kind.as_index()];
        let order = core::iter::once(preferred)
            .chain((0..preferred).rev())
            .chain(preferred + 1..self.banks.len());

        for bank_idx in order {
            let Some((node_off, skip)) = self.fit_in_bank(bank_idx, bytes, alignment) else {
                continue;
            };

            let threshold = self.threshold;
            let mut splits = 0u64;
            let bank = &mut self.banks[bank_idx];
            let mut offset = node_off;
            let mut node = bank.nodes.remove(&offset).ok_or(HalError::GenericIo)?;

            // アライメント調整分を左側の空きノードとして切り出す
            if skip > 0 {
                bank.nodes.insert(
                    offset,
                    HeapNode {
                        bytes: skip,
                        state: NodeState::Free,
                    },
                );
                node.bytes -= skip;
                offset += skip;
                splits += 1;
            }

            // 余りが閾値を超えるときだけ後半を切り離す
            if node.bytes - bytes > threshold {
                bank.nodes.insert(
                    offset + bytes,
                    HeapNode {
                        bytes: node.bytes - bytes,
                        state: NodeState::Free,
                    },
                );
                node.bytes = bytes;
                splits += 1;
            }

            node.state = NodeState::Allocated;
            let taken = node.bytes;
            bank.nodes.insert(offset, node);

            self.free_bytes -= taken;
            self.splits += splits;
            self.allocs += 1;
            #[cfg(feature = "verbose_logging")]
            log::trace!("vidmem: {} bytes at {:#x} (bank {})", taken, offset, bank_idx);
            return Ok(offset);
        }

        Err(HalError::OutOfMemory)
    }

    /// ノードを解放して隣接する空きノードと結合する
    ///
    /// 割り当て済みノードの開始オフセット以外は `InvalidArgument`。
    /// 解放済みノードの再解放も `InvalidArgument`。
    pub fn free(&mut self, offset: usize) -> HalResult<()> {
        let bank_idx = self
            .banks
            .iter()
            .position(|b| b.contains(offset))
            .ok_or(HalError::InvalidArgument)?;

        let mut merges = 0u64;
        let freed;
        {
            let bank = &mut self.banks[bank_idx];
            let node = bank
                .nodes
                .get_mut(&offset)
                .ok_or(HalError::InvalidArgument)?;
            if node.state == NodeState::Free {
                return Err(HalError::InvalidArgument);
            }
            node.state = NodeState::Free;
            freed = node.bytes;
            let mut bytes = node.bytes;

            // 後続ノードとの結合
            let next = bank
                .nodes
                .range(offset + 1..)
                .next()
                .map(|(&k, n)| (k, n.bytes, n.state));
            if let Some((next_off, next_bytes, next_state)) = next {
                if next_state == NodeState::Free {
                    if next_off != offset + bytes {
                        return Err(HalError::GenericIo);
                    }
                    bank.nodes.remove(&next_off);
                    bytes += next_bytes;
                    if let Some(node) = bank.nodes.get_mut(&offset) {
                        node.bytes = bytes;
                    }
                    merges += 1;
                }
            }

            // 先行ノードとの結合
            let prev = bank
                .nodes
                .range(..offset)
                .next_back()
                .map(|(&k, n)| (k, n.bytes, n.state));
            if let Some((prev_off, prev_bytes, prev_state)) = prev {
                if prev_state == NodeState::Free {
                    if prev_off + prev_bytes != offset {
                        return Err(HalError::GenericIo);
                    }
                    if let Some(node) = bank.nodes.remove(&offset) {
                        if let Some(prev_node) = bank.nodes.get_mut(&prev_off) {
                            prev_node.bytes += node.bytes;
                            merges += 1;
                        }
                    }
                }
            }
        }

        self.free_bytes += freed;
        self.frees += 1;
        self.merges += merges;
        Ok(())
    }

    /// 統計のスナップショットを取得
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            managed_bytes: self.managed_bytes,
            free_bytes: self.free_bytes,
            banks: self.banks.len(),
            allocs: self.allocs,
            frees: self.frees,
            splits: self.splits,
            merges: self.merges,
        }
    }
}
