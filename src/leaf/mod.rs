//! # Leaf Layer
//!
//! A leaf node is an array of partitions; each partition is a *basement*:
//! an ordered container of MVCC leaf entries. One leaf entry records, for
//! one key, either a single committed value or a committed slot plus a
//! stack of provisional operations keyed by transaction path.
//!
//! - [`entry`]: the leaf-entry codec and its single mutator,
//!   [`entry::apply_message`]
//! - [`basement`]: the ordered container, heaviside search, and the
//!   sequential-insert fast path

pub mod basement;
pub mod entry;

pub use basement::Basement;
pub use entry::{Committed, LeafEntry, Provisional, ProvisionalOp};

use crate::msg::{TxnId, Xids, TXNID_NONE};

/// Key comparator applied throughout the tree. Pivots, basement ordering,
/// and message routing all use the same ordering.
pub type KeyCmp = fn(&[u8], &[u8]) -> std::cmp::Ordering;

/// The default comparator: plain byte order.
pub fn default_key_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// User callback for `Update` messages: `(key, current value, extra) ->
/// Some(new value) | None`, where `None` synthesizes a delete.
pub type UpdateFn = fn(&[u8], Option<&[u8]>, &[u8]) -> Option<Vec<u8>>;

/// A reader's view of the transaction world, fixed at cursor creation.
///
/// A value written by transaction `id` is visible iff `id` is on the
/// reader's own ancestor stack, or `id` is older than every transaction
/// that was live when the view was taken.
#[derive(Debug, Clone)]
pub struct TxnView {
    /// The reader's own transaction stack (root to innermost).
    pub xids: Xids,
    /// Every id strictly below this was committed before the view began.
    pub oldest_live: TxnId,
    /// Snapshot reads keep this view across the cursor's whole lifetime.
    pub is_snapshot: bool,
}

impl TxnView {
    /// A reader outside any transaction with no live writers: sees all
    /// committed state.
    pub fn wide_open() -> Self {
        Self {
            xids: Xids::root(),
            oldest_live: TxnId::MAX,
            is_snapshot: false,
        }
    }

    pub fn of_txn(xids: Xids, oldest_live: TxnId) -> Self {
        Self {
            xids,
            oldest_live,
            is_snapshot: false,
        }
    }

    pub fn snapshot(xids: Xids, oldest_live: TxnId) -> Self {
        Self {
            xids,
            oldest_live,
            is_snapshot: true,
        }
    }

    /// Does this reader accept a value written by `id`?
    pub fn reads_txn(&self, id: TxnId) -> bool {
        id == TXNID_NONE || self.xids.contains(id) || id < self.oldest_live
    }
}
