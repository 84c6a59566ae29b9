//! # BurrowDB - Write-Optimized Embedded Storage Engine
//!
//! BurrowDB is an embedded key/value storage engine built around a buffered
//! repository tree: a B-tree variant whose internal nodes carry per-child
//! message queues. A write appends a small message at the root instead of
//! mutating a leaf; messages flush downward lazily in batches, amortizing
//! random I/O across many writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Tree API (put/lookup/cursor)     │
//! ├─────────────────────────────────────┤
//! │  Root ingress │ Flush │ Split/Merge │
//! ├─────────────────────────────────────┤
//! │  Node cache (pin/unpin, partial     │
//! │  fetch, clock-driven eviction)      │
//! ├─────────────────────────────────────┤
//! │  Node codec (partition sub-blocks,  │
//! │  zstd compression, CRC64 trailers)  │
//! ├─────────────────────────────────────┤
//! │  Block table (copy-on-write block   │
//! │  locations) + dual header slots     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//!
//! A `put` stamps the message with the next MSN (message sequence number)
//! and appends it to the root's per-child queue. When the root grows past
//! its target size the heaviest child's queue is drained one level down.
//! Splits and merges trigger off node "reactivity" (size thresholds) after
//! each flush.
//!
//! ## Read Path
//!
//! A search descends with non-blocking pins; if a pin would require I/O the
//! descent unwinds (all ancestor pins released in LIFO order) and retries.
//! On reaching a leaf, any messages still buffered in ancestors are replayed
//! into the in-memory leaf partitions, gated by MSN so replay is idempotent.
//!
//! ## Durability
//!
//! Node writes never overwrite in place: every write goes to a freshly
//! allocated block location. A fuzzy checkpoint clones the header, writes
//! all dirty nodes to shadow locations, then publishes the new header slot
//! with an fsync. The write-ahead log and recovery driver live outside this
//! crate; durability of individual messages piggybacks on them.
//!
//! ## Module Overview
//!
//! - [`msg`]: message kinds, MSN stamps, transaction-id stacks, child queues
//! - [`leaf`]: MVCC leaf entries and basement (leaf partition) containers
//! - [`node`]: the partitioned node, its state machine, and the disk codec
//! - [`storage`]: block table, file store, header slots
//! - [`cache`]: node cache with partial fetch and partial eviction
//! - [`tree`]: the engine proper - ingress, flush, reshape, search, cursors

#[macro_use]
mod macros;

pub mod cache;
pub mod config;
pub mod leaf;
pub mod msg;
pub mod node;
pub mod storage;
pub mod tree;

mod error;

pub use error::EngineError;
pub use leaf::{default_key_cmp, KeyCmp, UpdateFn};
pub use msg::{MessageType, Msn, TxnId, Xids, TXNID_NONE};
pub use tree::{Brt, Cursor, CursorOutcome, Env, KeyRange, Stat64, TreeOptions, TxnView};
