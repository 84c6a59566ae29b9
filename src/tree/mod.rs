//! # The Tree Engine
//!
//! [`Brt`] is one dictionary: a buffered repository tree over a single
//! file. Writes enter through [`ingress`], travel down through [`flush`],
//! reshape through [`reshape`], and reads come back through [`search`]
//! and [`cursor`] with [`ancestors`] replaying deferred messages at the
//! leaves. [`checkpoint`] couples the whole thing to durability.
//!
//! ## Ownership
//!
//! - Node memory belongs to the [`cache`](crate::cache); the tree holds
//!   pins and mutates only while pinned.
//! - Block locations belong to the block table; the tree only ever asks
//!   for fresh locations (copy-on-write) and returns old ones.
//! - The header is the tree's own, behind a lock shared with the
//!   checkpoint driver.
//!
//! ## Concurrency model
//!
//! Callers serialize operations with a process-wide token (the database
//! lock); internal locks exist so the cache can do I/O for other
//! dictionaries concurrently, not to make one dictionary multi-writer.
//! The only suspension point is a pin, and the non-blocking variant turns
//! suspension into unwind-and-retry.

pub(crate) mod ancestors;
mod checkpoint;
mod cursor;
mod flush;
mod ingress;
mod reshape;
mod search;

pub use cursor::{Cursor, CursorOutcome};
pub use crate::leaf::{TxnView, UpdateFn};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::{FetchPlan, NodeAdapter, NodeCache, NodeGuard};
use crate::config::{
    DEFAULT_BASEMENT_NODESIZE, DEFAULT_CACHE_BYTES, DEFAULT_NODESIZE, LAYOUT_VERSION,
};
use crate::error::EngineError;
use crate::leaf::{default_key_cmp, KeyCmp};
use crate::msg::{Message, MessageType, TxnId, Xids};
use crate::node::serialize::{attach_fetched_partition, decompress_partition, serialize_node};
use crate::node::{deserialize_node, Blocknum, Node, PartitionState};
use crate::storage::{
    load_newest_header, BlockLoc, BlockTable, FileStore, Header, DATA_START,
};

pub(crate) type TreeNodeGuard<'a> = NodeGuard<'a, NodeStore>;

/// Per-environment monotonic counters, shared by every dictionary the
/// caller opens. Not globals: embedders may run several environments in
/// one process.
#[derive(Debug, Default)]
pub struct Env {
    root_put_serial: AtomicU64,
    dict_id_serial: AtomicU64,
}

impl Env {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn next_root_put(&self) -> u64 {
        self.root_put_serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_dict_id(&self) -> u64 {
        self.dict_id_serial.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Tuning and behavior knobs for one dictionary.
#[derive(Clone)]
pub struct TreeOptions {
    pub nodesize: u32,
    pub basement_nodesize: u32,
    pub flags: u32,
    pub cache_bytes: usize,
    pub cmp: KeyCmp,
    /// Callback for `Update` messages; required before using the update
    /// entry points.
    pub update_cb: Option<UpdateFn>,
    /// Transaction that created the dictionary; snapshot cursors from
    /// views that cannot see it are refused.
    pub create_txnid: TxnId,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            nodesize: DEFAULT_NODESIZE,
            basement_nodesize: DEFAULT_BASEMENT_NODESIZE,
            flags: 0,
            cache_bytes: DEFAULT_CACHE_BYTES,
            cmp: default_key_cmp,
            update_cb: None,
            create_txnid: crate::msg::TXNID_NONE,
        }
    }
}

/// Aggregate entry-count estimates around a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyRange {
    pub less: u64,
    pub equal: u64,
    pub greater: u64,
}

/// Dictionary-level statistics from the root's subtree estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat64 {
    pub file_size: u64,
    pub nkeys: u64,
    pub ndata: u64,
    pub dsize: u64,
}

/// Disk-backed node source: the tree-side implementation of the cache's
/// [`NodeAdapter`] contract.
pub struct NodeStore {
    pub(crate) store: FileStore,
    pub(crate) blocks: Mutex<BlockTable>,
    cmp: KeyCmp,
    basement_nodesize: u32,
}

impl NodeStore {
    pub(crate) fn new_blocknum(&self) -> Blocknum {
        self.blocks.lock().allocate_blocknum()
    }

    /// Which partitions does `plan` want materialized in `node`?
    fn wanted_partitions(&self, node: &Node, plan: &FetchPlan) -> Vec<usize> {
        match plan {
            FetchPlan::All => (0..node.n_children()).collect(),
            FetchPlan::None | FetchPlan::Min => Vec::new(),
            FetchPlan::Subset(hint) => vec![search::which_child_to_search(
                node,
                hint.dir,
                hint.bound.as_deref(),
                hint.bound_inclusive,
                hint.pivot_bound.as_deref(),
                self.cmp,
            )],
        }
    }
}

impl NodeAdapter for NodeStore {
    fn fetch(&self, blocknum: Blocknum, plan: &FetchPlan) -> Result<Node> {
        let loc = self
            .blocks
            .lock()
            .translate(blocknum)
            .ok_or_else(|| eyre!("block {blocknum} has no location"))?;
        let bytes = self.store.read_at(loc.offset, loc.size as usize)?;
        let mut node =
            deserialize_node(&bytes).wrap_err_with(|| format!("deserializing block {blocknum}"))?;
        ensure!(
            node.blocknum == blocknum,
            "block {blocknum} contains node {}",
            node.blocknum
        );
        for i in self.wanted_partitions(&node, plan) {
            decompress_partition(&mut node, i)?;
            node.touch_clock(i);
        }
        Ok(node)
    }

    fn partial_fetch_required(&self, node: &mut Node, plan: &FetchPlan) -> bool {
        let mut required = false;
        for i in self.wanted_partitions(node, plan) {
            node.touch_clock(i);
            if !node.partitions[i].state.is_available() {
                required = true;
            }
        }
        required
    }

    fn partial_fetch(&self, node: &mut Node, plan: &FetchPlan) -> Result<()> {
        for i in self.wanted_partitions(node, plan) {
            if node.partitions[i].state.is_available() {
                continue;
            }
            if matches!(node.partitions[i].state, PartitionState::Invalid) {
                bail!(
                    "partial fetch of invalid partition {i} in node {}",
                    node.blocknum
                );
            }
            if matches!(node.partitions[i].state, PartitionState::OnDisk) {
                let loc = self
                    .blocks
                    .lock()
                    .translate(node.blocknum)
                    .ok_or_else(|| eyre!("block {} has no location", node.blocknum))?;
                let (off, len) = node
                    .layout
                    .as_ref()
                    .ok_or_else(|| eyre!("node {} has no layout", node.blocknum))?
                    .sub_block_range(i);
                let raw = self.store.read_at(loc.offset + off, len)?;
                attach_fetched_partition(node, i, raw)?;
            }
            decompress_partition(node, i)?;
        }
        Ok(())
    }

    fn partial_evict(&self, node: &mut Node) {
        // Dirty nodes hold authoritative state; internal nodes are cheap
        // and structural. Neither sheds partitions.
        if node.dirty || node.height > 0 || node.layout.is_none() {
            return;
        }
        for p in &mut node.partitions {
            if matches!(p.state, PartitionState::Compressed(_)) {
                p.state = PartitionState::OnDisk;
            } else if matches!(p.state, PartitionState::Leaf(_)) {
                if p.clock {
                    p.clock = false;
                } else {
                    p.state = PartitionState::OnDisk;
                }
            }
        }
    }

    fn flush(
        &self,
        node: &mut Node,
        write_me: bool,
        _keep_me: bool,
        for_checkpoint: bool,
    ) -> Result<()> {
        if write_me {
            let (bytes, layout) = serialize_node(node, self.basement_nodesize)?;
            let loc = self
                .blocks
                .lock()
                .realloc(node.blocknum, bytes.len() as u32);
            self.store.write_at(loc.offset, &bytes)?;
            node.layout = Some(layout);
            node.max_msn_applied_on_disk = node.max_msn_applied_in_memory;
            node.dirty = false;
            debug!(
                blocknum = node.blocknum,
                bytes = bytes.len(),
                offset = loc.offset,
                for_checkpoint,
                "wrote node"
            );
        }
        Ok(())
    }
}

/// One open dictionary.
pub struct Brt {
    pub(crate) opts: TreeOptions,
    pub(crate) env: Arc<Env>,
    pub(crate) header: RwLock<Header>,
    pub(crate) node_store: Arc<NodeStore>,
    pub(crate) cache: NodeCache<NodeStore>,
    pub(crate) prev_translation: Mutex<Option<BlockLoc>>,
    pub(crate) checkpoint_twin: Mutex<Option<Header>>,
}

impl Brt {
    /// Create a new dictionary file: an empty leaf root plus an initial
    /// checkpoint so the file is immediately reopenable.
    pub fn create(path: &Path, opts: TreeOptions, env: Arc<Env>) -> Result<Self> {
        ensure!(opts.nodesize > 0, "nodesize must be positive");
        let store = FileStore::create(path)?;
        let mut blocks = BlockTable::new(DATA_START);
        let root_blocknum = blocks.allocate_blocknum();

        let mut header = Header::new(
            opts.nodesize,
            opts.basement_nodesize,
            opts.flags,
            env.next_dict_id(),
        );
        header.root_blocknum = root_blocknum;
        header.create_txnid = opts.create_txnid;

        let node_store = Arc::new(NodeStore {
            store,
            blocks: Mutex::new(blocks),
            cmp: opts.cmp,
            basement_nodesize: opts.basement_nodesize,
        });
        let cache = NodeCache::new(Arc::clone(&node_store), opts.cache_bytes);
        let tree = Self {
            opts,
            env,
            header: RwLock::new(header),
            node_store,
            cache,
            prev_translation: Mutex::new(None),
            checkpoint_twin: Mutex::new(None),
        };

        let root = Node::new_leaf(root_blocknum, tree.opts.nodesize, tree.opts.flags);
        drop(tree.cache.insert_new(root));
        tree.checkpoint()?;
        Ok(tree)
    }

    /// Open an existing dictionary from its newest durable checkpoint.
    pub fn open(path: &Path, opts: TreeOptions, env: Arc<Env>) -> Result<Self> {
        let store = FileStore::open(path)?;
        let (mut header, translation_offset, translation_size) = load_newest_header(&store)?;
        ensure!(
            header.layout_version == LAYOUT_VERSION,
            "unsupported layout version {}",
            header.layout_version
        );
        let translation_bytes =
            store.read_at(translation_offset, translation_size as usize)?;
        let blocks = BlockTable::deserialize(&translation_bytes)
            .wrap_err("loading block translation")?;
        header.root_put_counter = 0;

        let mut opts = opts;
        opts.nodesize = header.nodesize;
        opts.basement_nodesize = header.basement_nodesize;
        opts.flags = header.flags;

        let node_store = Arc::new(NodeStore {
            store,
            blocks: Mutex::new(blocks),
            cmp: opts.cmp,
            basement_nodesize: opts.basement_nodesize,
        });
        let cache = NodeCache::new(Arc::clone(&node_store), opts.cache_bytes);
        Ok(Self {
            opts,
            env,
            header: RwLock::new(header),
            node_store,
            cache,
            prev_translation: Mutex::new(Some(BlockLoc {
                offset: translation_offset,
                size: translation_size,
            })),
            checkpoint_twin: Mutex::new(None),
        })
    }

    // ── Write surface ────────────────────────────────────────────────────

    /// Generic message entry point. Most callers use the typed wrappers.
    pub fn put(
        &self,
        key: &[u8],
        val: &[u8],
        mtype: MessageType,
        xids: Xids,
    ) -> Result<()> {
        let (key, val) = if mtype.applies_all() {
            (Vec::new(), val.to_vec())
        } else {
            (key.to_vec(), val.to_vec())
        };
        self.ingress(Message::new(mtype, xids, key, val))
    }

    pub fn insert(&self, key: &[u8], val: &[u8], xids: Xids) -> Result<()> {
        self.put(key, val, MessageType::Insert, xids)
    }

    /// Insert only if no live value exists under `view`.
    pub fn insert_no_overwrite(
        &self,
        key: &[u8],
        val: &[u8],
        xids: Xids,
        view: &TxnView,
    ) -> Result<()> {
        if self.lookup(key, view)?.is_some() {
            return Err(EngineError::KeyExists.into());
        }
        self.put(key, val, MessageType::InsertNoOverwrite, xids)
    }

    pub fn delete(&self, key: &[u8], xids: Xids) -> Result<()> {
        self.put(key, b"", MessageType::DeleteAny, xids)
    }

    pub fn commit_any(&self, key: &[u8], xids: Xids) -> Result<()> {
        self.put(key, b"", MessageType::CommitAny, xids)
    }

    pub fn abort_any(&self, key: &[u8], xids: Xids) -> Result<()> {
        self.put(key, b"", MessageType::AbortAny, xids)
    }

    pub fn commit_txn(&self, xids: Xids) -> Result<()> {
        self.put(b"", b"", MessageType::CommitBroadcastTxn, xids)
    }

    pub fn abort_txn(&self, xids: Xids) -> Result<()> {
        self.put(b"", b"", MessageType::AbortBroadcastTxn, xids)
    }

    /// Apply the update callback to one key.
    pub fn update(&self, key: &[u8], extra: &[u8], xids: Xids) -> Result<()> {
        ensure!(self.opts.update_cb.is_some(), "no update callback configured");
        self.put(key, extra, MessageType::Update, xids)
    }

    /// Apply the update callback to every key in the dictionary.
    pub fn update_broadcast(&self, extra: &[u8], xids: Xids) -> Result<()> {
        ensure!(self.opts.update_cb.is_some(), "no update callback configured");
        self.put(b"", extra, MessageType::UpdateBroadcastAll, xids)
    }

    /// Flatten provisional state left by transactions that are no longer
    /// live. `live_root_txns` is the snapshot of still-running roots.
    pub fn optimize(&self, live_root_txns: &[TxnId]) -> Result<()> {
        self.put(
            b"",
            b"",
            MessageType::Optimize,
            Xids::from_chain(live_root_txns),
        )
    }

    /// The upgrade variant of [`optimize`](Self::optimize): additionally
    /// records the running layout version in every leaf it touches.
    pub fn optimize_for_upgrade(&self) -> Result<()> {
        self.put(
            b"",
            &LAYOUT_VERSION.to_le_bytes(),
            MessageType::OptimizeForUpgrade,
            Xids::root(),
        )
    }

    fn ingress(&self, msg: Message) -> Result<()> {
        self.check_poisoned()?;
        match ingress::root_put(self, msg) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poison(-1, &format!("{err:#}"));
                Err(err)
            }
        }
    }

    // ── Read surface ─────────────────────────────────────────────────────

    /// Point lookup under `view`.
    pub fn lookup(&self, key: &[u8], view: &TxnView) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        let mut search = search::Search::point_lookup(key);
        Ok(self.search_full(&mut search, view)?.map(|hit| hit.val))
    }

    /// Open a positioned reader. Snapshot views must be able to see the
    /// dictionary's creation.
    pub fn cursor(&self, view: TxnView) -> Result<Cursor<'_>> {
        self.check_poisoned()?;
        let create_txnid = self.header.read().create_txnid;
        if view.is_snapshot && !view.reads_txn(create_txnid) {
            return Err(EngineError::DictionaryTooNewForSnapshot.into());
        }
        Ok(Cursor::new(self, view))
    }

    /// Estimate how many entries sort below, at, and above `key`.
    pub fn keyrange(&self, key: &[u8]) -> Result<KeyRange> {
        self.check_poisoned()?;
        let mut acc = KeyRange::default();
        let root_blocknum = self.header.read().root_blocknum;
        self.keyrange_node(root_blocknum, key, &mut acc)?;
        Ok(acc)
    }

    fn keyrange_node(&self, blocknum: Blocknum, key: &[u8], acc: &mut KeyRange) -> Result<()> {
        use std::cmp::Ordering;
        let guard = self.cache.pin(blocknum, &FetchPlan::All)?;
        let node = guard.read();
        let cmp = self.opts.cmp;
        let n = node.n_children();
        let compares: Vec<Ordering> = node.pivots.iter().map(|p| cmp(p, key)).collect();
        for i in 0..n {
            let prev = if i == 0 { Ordering::Less } else { compares[i - 1] };
            let next = if i < n - 1 { compares[i] } else { Ordering::Greater };
            let est = node.partitions[i].estimates;
            if next == Ordering::Less {
                acc.less += est.ndata;
            } else if prev == Ordering::Greater {
                acc.greater += est.ndata;
            } else if prev == Ordering::Equal && next == Ordering::Equal {
                acc.equal += est.ndata;
            } else if node.height > 0 {
                let child = node.partitions[i].child_blocknum;
                self.keyrange_node(child, key, acc)?;
            } else {
                let bn = node.basement(i);
                match bn.find_zero(key, cmp) {
                    Ok(idx) => {
                        acc.less += idx as u64;
                        acc.equal += 1;
                        acc.greater += (bn.len() - idx - 1) as u64;
                    }
                    Err(idx) => {
                        acc.less += idx as u64;
                        acc.greater += (bn.len() - idx) as u64;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dictionary statistics from the root's estimates; a prefix-only
    /// fetch, so this never faults partitions in.
    pub fn stat64(&self) -> Result<Stat64> {
        self.check_poisoned()?;
        let root_blocknum = self.header.read().root_blocknum;
        let guard = self.cache.pin(root_blocknum, &FetchPlan::Min)?;
        let node = guard.read();
        let est = node.aggregate_estimates();
        Ok(Stat64 {
            file_size: self.node_store.store.len()?,
            nkeys: est.nkeys,
            ndata: est.ndata,
            dsize: est.dsize,
        })
    }

    // ── Durability ───────────────────────────────────────────────────────

    /// Run a full fuzzy checkpoint; on success the current tree state is
    /// durable and reopenable.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_poisoned()?;
        match checkpoint::run_checkpoint(self) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poison(-2, &format!("{err:#}"));
                Err(err)
            }
        }
    }

    /// Checkpoint and consume the handle.
    pub fn close(self) -> Result<()> {
        self.checkpoint()
    }

    /// Hook for tests: make the next `n` non-blocking pins lose their
    /// race, exercising the unwind-and-retry path.
    pub fn force_try_again(&self, n: u32) {
        self.cache.force_try_again(n);
    }

    // ── Poisoning ────────────────────────────────────────────────────────

    fn check_poisoned(&self) -> Result<()> {
        if let Some((code, msg)) = &self.header.read().panic {
            return Err(EngineError::Poisoned {
                code: *code,
                msg: msg.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn poison(&self, code: i32, msg: &str) {
        let mut header = self.header.write();
        if header.panic.is_none() {
            tracing::error!(code, msg, "engine poisoned");
            header.panic = Some((code, msg.to_string()));
        }
    }
}
