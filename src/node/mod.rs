//! # Tree Nodes
//!
//! A node is one unit of caching and I/O. Internal nodes (`height > 0`)
//! hold `n_children` child pointers, `n_children - 1` pivot keys, and one
//! message buffer per child. Leaf nodes (`height == 0`) hold `n_children`
//! basements separated by the same pivot arrangement.
//!
//! ## Partition States
//!
//! Each of a node's partitions is independently in one of four states:
//!
//! ```text
//!              create                    cache partial-evict
//!   Invalid ──────────> Available <──────────────────────┐
//!                           │  decompress                │
//!                           │<──────────── Compressed ───┤
//!                           │   partial fetch    │       │ age out
//!                           └────────────────────┴──> OnDisk
//! ```
//!
//! `Invalid` partitions have never been populated (fresh node before its
//! basements/buffers are attached). `OnDisk` partitions exist only in the
//! node's serialized image; `Compressed` ones hold the undecoded sub-block;
//! `Available` ones are the live [`Basement`] or [`MessageBuffer`].
//!
//! A per-partition clock bit drives partial eviction: any fetch-plan
//! contact sets it, the evictor clears it on the first pass and pages the
//! partition out on the second.
//!
//! ## Reactivity
//!
//! After a mutation a node is classified:
//!
//! - leaf: **fissible** if its serialized size exceeds `nodesize` and it
//!   has more than one entry; **fusible** if four times its size fits in
//!   `nodesize` and the last basement is not in a sequential-insert run;
//! - nonleaf: **fissible** past `TREE_FANOUT` children, **fusible** below
//!   a quarter of it.
//!
//! The flush engine reacts to the classification with a split or merge.

pub mod serialize;

use crate::config::TREE_FANOUT;
use crate::leaf::{Basement, KeyCmp};
use crate::msg::{MessageBuffer, Msn, MIN_MSN};

pub use serialize::{deserialize_node, serialize_node, NodeLayout, PartLocation};

/// Logical node id, translated to a file location by the block table.
pub type Blocknum = u64;

/// Reserved; never allocated to a node.
pub const BLOCKNUM_NONE: Blocknum = 0;

/// Hash of a node's identity, computed once and carried beside the
/// blocknum so cache lookups don't rehash.
pub fn fullhash(blocknum: Blocknum) -> u32 {
    // Fibonacci hashing; good spread for sequential blocknums.
    (blocknum.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as u32
}

/// Per-child aggregate statistics, kept approximately current and marked
/// `exact` only when refreshed from a fully-applied child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtreeEstimates {
    pub nkeys: u64,
    pub ndata: u64,
    pub dsize: u64,
    pub exact: bool,
}

impl SubtreeEstimates {
    pub fn zero() -> Self {
        Self {
            nkeys: 0,
            ndata: 0,
            dsize: 0,
            exact: true,
        }
    }

    pub fn accumulate(&mut self, other: &SubtreeEstimates) {
        self.nkeys += other.nkeys;
        self.ndata += other.ndata;
        self.dsize += other.dsize;
        self.exact &= other.exact;
    }
}

impl Default for SubtreeEstimates {
    fn default() -> Self {
        Self::zero()
    }
}

/// An undecoded partition sub-block, exactly as stored on disk.
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    pub bytes: Vec<u8>,
    pub uncompressed_len: u32,
}

#[derive(Debug, Clone)]
pub enum PartitionState {
    Invalid,
    OnDisk,
    Compressed(CompressedBlock),
    Leaf(Basement),
    Internal(MessageBuffer),
}

impl PartitionState {
    pub fn is_available(&self) -> bool {
        matches!(self, PartitionState::Leaf(_) | PartitionState::Internal(_))
    }
}

/// One child slot of a node: routing target, payload state, clock bit, and
/// subtree statistics.
#[derive(Debug, Clone)]
pub struct Partition {
    /// The child node this slot routes to; [`BLOCKNUM_NONE`] in leaves.
    pub child_blocknum: Blocknum,
    pub state: PartitionState,
    /// Second-chance bit for partial eviction.
    pub clock: bool,
    pub estimates: SubtreeEstimates,
}

impl Partition {
    pub fn invalid() -> Self {
        Self {
            child_blocknum: BLOCKNUM_NONE,
            state: PartitionState::Invalid,
            clock: false,
            estimates: SubtreeEstimates::zero(),
        }
    }

    pub fn leaf(bn: Basement) -> Self {
        Self {
            child_blocknum: BLOCKNUM_NONE,
            state: PartitionState::Leaf(bn),
            clock: false,
            estimates: SubtreeEstimates::zero(),
        }
    }

    pub fn internal(child_blocknum: Blocknum) -> Self {
        Self {
            child_blocknum,
            state: PartitionState::Internal(MessageBuffer::new()),
            clock: false,
            estimates: SubtreeEstimates::zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivity {
    Stable,
    Fissible,
    Fusible,
}

#[derive(Debug)]
pub struct Node {
    pub blocknum: Blocknum,
    pub fullhash: u32,
    /// 0 = leaf.
    pub height: u32,
    pub nodesize: u32,
    pub flags: u32,
    pub layout_version: u32,
    pub layout_version_original: u32,
    pub build_id: u32,
    pub dirty: bool,
    /// Watermark in the newest serialized image of this node. Gates
    /// ancestor replay after a load.
    pub max_msn_applied_on_disk: Msn,
    /// Watermark of the live object; always >= the on-disk watermark.
    pub max_msn_applied_in_memory: Msn,
    /// `n_children - 1` strictly increasing keys; child `i` covers
    /// `(pivots[i-1], pivots[i]]` with open ends at the edges.
    pub pivots: Vec<Vec<u8>>,
    pub total_pivot_bytes: usize,
    pub partitions: Vec<Partition>,
    /// Where the partitions of the last written image live, for partial
    /// fetch. `None` until first serialized or when loaded fresh.
    pub layout: Option<NodeLayout>,
}

impl Node {
    /// A fresh node with every partition `Invalid`. The caller attaches
    /// basements or buffers before unpinning.
    pub fn new_empty(
        blocknum: Blocknum,
        height: u32,
        n_children: usize,
        nodesize: u32,
        flags: u32,
    ) -> Self {
        Self {
            blocknum,
            fullhash: fullhash(blocknum),
            height,
            nodesize,
            flags,
            layout_version: crate::config::LAYOUT_VERSION,
            layout_version_original: crate::config::LAYOUT_VERSION,
            build_id: crate::config::BUILD_ID,
            dirty: true,
            max_msn_applied_on_disk: MIN_MSN,
            max_msn_applied_in_memory: MIN_MSN,
            pivots: Vec::new(),
            total_pivot_bytes: 0,
            partitions: (0..n_children).map(|_| Partition::invalid()).collect(),
            layout: None,
        }
    }

    /// A new single-basement leaf, ready for inserts.
    pub fn new_leaf(blocknum: Blocknum, nodesize: u32, flags: u32) -> Self {
        let mut node = Self::new_empty(blocknum, 0, 1, nodesize, flags);
        node.partitions[0] = Partition::leaf(Basement::new());
        node
    }

    pub fn n_children(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Extend the node by one child on the right; `pivot` separates the
    /// previous last child from the new one (absent only when the node was
    /// empty of pivots and had a single child).
    pub fn append_child(&mut self, partition: Partition, pivot: Option<Vec<u8>>) {
        if let Some(p) = pivot {
            self.total_pivot_bytes += p.len();
            self.pivots.push(p);
        }
        self.partitions.push(partition);
        self.dirty = true;
        debug_assert_eq!(self.pivots.len() + 1, self.partitions.len());
    }

    /// Which child covers `key`? Probes the last pivot first so right-edge
    /// sequential inserts skip the binary search.
    pub fn which_child(&self, key: &[u8], cmp: KeyCmp) -> usize {
        let n = self.n_children();
        if n == 1 {
            return 0;
        }
        if cmp(key, &self.pivots[n - 2]) == std::cmp::Ordering::Greater {
            return n - 1;
        }
        // First pivot >= key; child i covers (pivots[i-1], pivots[i]].
        self.pivots
            .partition_point(|p| cmp(key, p) == std::cmp::Ordering::Greater)
    }

    pub fn basement(&self, i: usize) -> &Basement {
        match &self.partitions[i].state {
            PartitionState::Leaf(bn) => bn,
            other => panic!("partition {i} is not an available basement: {other:?}"),
        }
    }

    pub fn basement_mut(&mut self, i: usize) -> &mut Basement {
        match &mut self.partitions[i].state {
            PartitionState::Leaf(bn) => bn,
            other => panic!("partition {i} is not an available basement: {other:?}"),
        }
    }

    pub fn buffer(&self, i: usize) -> &MessageBuffer {
        match &self.partitions[i].state {
            PartitionState::Internal(buf) => buf,
            other => panic!("partition {i} is not an available buffer: {other:?}"),
        }
    }

    pub fn buffer_mut(&mut self, i: usize) -> &mut MessageBuffer {
        match &mut self.partitions[i].state {
            PartitionState::Internal(buf) => buf,
            other => panic!("partition {i} is not an available buffer: {other:?}"),
        }
    }

    pub fn is_entirely_in_memory(&self) -> bool {
        self.partitions.iter().all(|p| p.state.is_available())
    }

    pub fn assert_entirely_in_memory(&self) {
        assert!(
            self.is_entirely_in_memory(),
            "node {} must be fully resident",
            self.blocknum
        );
    }

    pub fn touch_clock(&mut self, i: usize) {
        self.partitions[i].clock = true;
    }

    /// Total entries across a fully resident leaf.
    pub fn leaf_num_entries(&self) -> usize {
        self.assert_entirely_in_memory();
        (0..self.n_children()).map(|i| self.basement(i).len()).sum()
    }

    /// Bytes buffered for child `i` of an internal node.
    pub fn child_buffer_bytes(&self, i: usize) -> usize {
        self.buffer(i).n_bytes()
    }

    /// Serialized size this node would occupy before compression. Drives
    /// the reactivity and gorged checks; requires full residency.
    pub fn serialized_size_estimate(&self) -> usize {
        self.assert_entirely_in_memory();
        let mut size = serialize::PREFIX_SIZE
            + self.total_pivot_bytes
            + 4 * self.pivots.len()
            + serialize::DIR_ENTRY_SIZE * self.n_children();
        for i in 0..self.n_children() {
            size += match &self.partitions[i].state {
                PartitionState::Leaf(bn) => 4 + bn.n_bytes(),
                PartitionState::Internal(buf) => 4 + buf.n_bytes(),
                _ => unreachable!(),
            };
        }
        size
    }

    /// In-memory footprint for cache accounting. Unlike the serialized
    /// estimate this tolerates paged-out partitions.
    pub fn memory_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>() + self.total_pivot_bytes;
        for p in &self.partitions {
            size += std::mem::size_of::<Partition>();
            size += match &p.state {
                PartitionState::Invalid | PartitionState::OnDisk => 0,
                PartitionState::Compressed(cb) => cb.bytes.capacity(),
                PartitionState::Leaf(bn) => bn.memsize(),
                PartitionState::Internal(buf) => {
                    buf.iter().map(|m| m.buffered_size()).sum::<usize>()
                }
            };
        }
        size
    }

    /// Is some child buffer nonempty? (Precondition of a flush.)
    pub fn has_buffered_messages(&self) -> bool {
        debug_assert!(self.height > 0);
        (0..self.n_children()).any(|i| !self.buffer(i).is_empty())
    }

    /// A nonleaf over its target size with something buffered must flush.
    pub fn is_gorged(&self) -> bool {
        self.assert_entirely_in_memory();
        debug_assert!(self.height > 0);
        self.serialized_size_estimate() > self.nodesize as usize && self.has_buffered_messages()
    }

    pub fn reactivity(&self) -> Reactivity {
        self.assert_entirely_in_memory();
        if self.is_leaf() {
            self.leaf_reactivity()
        } else {
            self.nonleaf_reactivity()
        }
    }

    fn leaf_reactivity(&self) -> Reactivity {
        if !self.dirty {
            return Reactivity::Stable;
        }
        let size = self.serialized_size_estimate();
        if size > self.nodesize as usize && self.leaf_num_entries() > 1 {
            Reactivity::Fissible
        } else if size * 4 < self.nodesize as usize
            && self.basement(self.n_children() - 1).seqinsert() == 0
        {
            Reactivity::Fusible
        } else {
            Reactivity::Stable
        }
    }

    fn nonleaf_reactivity(&self) -> Reactivity {
        let n = self.n_children();
        if n > TREE_FANOUT {
            Reactivity::Fissible
        } else if n * 4 < TREE_FANOUT {
            Reactivity::Fusible
        } else {
            Reactivity::Stable
        }
    }

    /// Recompute a leaf partition's estimates from its live basement.
    pub fn refresh_leaf_estimates(&mut self, i: usize) {
        let (n, dsize) = {
            let bn = self.basement(i);
            (bn.len() as u64, bn.n_bytes() as u64)
        };
        self.partitions[i].estimates = SubtreeEstimates {
            nkeys: n,
            ndata: n,
            dsize,
            exact: true,
        };
    }

    /// Sum of per-child estimates: what this node contributes to its
    /// parent's slot.
    pub fn aggregate_estimates(&self) -> SubtreeEstimates {
        let mut total = SubtreeEstimates::zero();
        for p in &self.partitions {
            total.accumulate(&p.estimates);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::default_key_cmp;
    use crate::msg::{Message, MessageType, Xids};

    fn leaf_with_keys(keys: &[&[u8]]) -> Node {
        let mut node = Node::new_leaf(1, 4096, 0);
        for (i, k) in keys.iter().enumerate() {
            let mut m =
                Message::new(MessageType::Insert, Xids::root(), k.to_vec(), b"v".to_vec());
            m.msn = i as Msn + 1;
            node.basement_mut(0).apply_message(&m, default_key_cmp, None);
            node.max_msn_applied_in_memory = m.msn;
        }
        node
    }

    #[test]
    fn new_empty_partitions_are_invalid() {
        let node = Node::new_empty(3, 1, 4, 4096, 0);
        assert!(node.dirty);
        assert_eq!(node.n_children(), 4);
        assert_eq!(node.max_msn_applied_in_memory, MIN_MSN);
        assert!(!node.is_entirely_in_memory());
        assert!(matches!(node.partitions[0].state, PartitionState::Invalid));
    }

    #[test]
    fn which_child_routes_by_pivot() {
        let mut node = Node::new_empty(1, 1, 0, 4096, 0);
        node.partitions.push(Partition::internal(10));
        node.append_child(Partition::internal(11), Some(b"g".to_vec()));
        node.append_child(Partition::internal(12), Some(b"p".to_vec()));

        // child 0: (-inf, "g"], child 1: ("g", "p"], child 2: ("p", +inf)
        assert_eq!(node.which_child(b"a", default_key_cmp), 0);
        assert_eq!(node.which_child(b"g", default_key_cmp), 0);
        assert_eq!(node.which_child(b"h", default_key_cmp), 1);
        assert_eq!(node.which_child(b"p", default_key_cmp), 1);
        assert_eq!(node.which_child(b"q", default_key_cmp), 2);
    }

    #[test]
    fn nonleaf_reactivity_thresholds() {
        let mut node = Node::new_empty(1, 1, 0, 4096, 0);
        for i in 0..TREE_FANOUT + 1 {
            let pivot = (i > 0).then(|| vec![i as u8]);
            node.append_child(Partition::internal(i as Blocknum + 10), pivot);
        }
        assert_eq!(node.reactivity(), Reactivity::Fissible);

        // Drop to FANOUT children: stable.
        node.partitions.pop();
        node.pivots.pop();
        assert_eq!(node.nonleaf_reactivity(), Reactivity::Stable);

        // Below a quarter of the fanout: fusible.
        let mut small = Node::new_empty(2, 1, 0, 4096, 0);
        for i in 0..TREE_FANOUT / 4 - 1 {
            let pivot = (i > 0).then(|| vec![i as u8]);
            small.append_child(Partition::internal(i as Blocknum + 10), pivot);
        }
        assert_eq!(small.reactivity(), Reactivity::Fusible);
    }

    #[test]
    fn leaf_reactivity_tracks_size() {
        let mut node = Node::new_leaf(1, 4096, 0);
        assert_eq!(node.reactivity(), Reactivity::Fusible);

        for i in 0..96u32 {
            let key = format!("key{i:010}");
            let mut m = Message::new(
                MessageType::Insert,
                Xids::root(),
                key.into_bytes(),
                vec![0u8; 64],
            );
            m.msn = i as Msn + 1;
            node.basement_mut(0).apply_message(&m, default_key_cmp, None);
        }
        assert_eq!(node.reactivity(), Reactivity::Fissible);

        // A clean node is never reshaped.
        node.dirty = false;
        assert_eq!(node.reactivity(), Reactivity::Stable);
    }

    #[test]
    fn estimates_aggregate() {
        let mut node = leaf_with_keys(&[b"a", b"b", b"c"]);
        node.refresh_leaf_estimates(0);
        let est = node.aggregate_estimates();
        assert_eq!(est.nkeys, 3);
        assert_eq!(est.ndata, 3);
        assert!(est.exact);
        assert!(est.dsize > 0);
    }
}
