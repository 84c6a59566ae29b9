//! # Leaf Entries
//!
//! One leaf entry holds the MVCC state for one key:
//!
//! - a *committed* slot - either a present value or a tombstone - and
//! - a stack of *provisional* operations (insert-value or delete), each
//!   tagged with the transaction stack that issued it, ordered outermost
//!   to innermost.
//!
//! An entry is **clean** when the stack is empty and the committed slot
//! holds a value. An entry whose stack empties onto a committed tombstone
//! ceases to exist: [`apply_message`] returns `None` and the basement
//! removes it.
//!
//! The sole mutator is [`apply_message`]. Readers go through
//! [`LeafEntry::visible_value`], which walks the provisional stack from
//! innermost to outermost looking for the first operation whose writer the
//! reader's [`TxnView`] accepts, falling back to the committed slot.
//!
//! ## Lifecycle of a transactional write
//!
//! ```text
//! INSERT(xids=[7], "v")      stack: [(7, Insert "v")]   committed: Tombstone
//! COMMIT_ANY(xids=[7])       stack: []                  committed: Present "v"
//! DELETE_ANY(xids=[9])       stack: [(9, Delete)]       committed: Present "v"
//! ABORT_ANY(xids=[9])        stack: []                  committed: Present "v"
//! ```

use smallvec::SmallVec;

use super::TxnView;
use crate::msg::{Message, MessageType, Xids};

/// The committed slot of a leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    Present(Vec<u8>),
    Tombstone,
}

/// A provisional (uncommitted) operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionalOp {
    Insert(Vec<u8>),
    Delete,
}

/// One uncommitted operation and the transaction path that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisional {
    pub xids: Xids,
    pub op: ProvisionalOp,
}

/// MVCC state for one key. See the module docs for the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    key: Vec<u8>,
    committed: Committed,
    stack: SmallVec<[Provisional; 1]>,
}

impl LeafEntry {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn keylen(&self) -> usize {
        self.key.len()
    }

    pub fn committed(&self) -> &Committed {
        &self.committed
    }

    pub fn stack(&self) -> &[Provisional] {
        &self.stack
    }

    /// No provisional state, committed slot holds a value.
    pub fn is_clean(&self) -> bool {
        self.stack.is_empty() && matches!(self.committed, Committed::Present(_))
    }

    /// The newest operation regardless of visibility: the innermost
    /// provisional op if any, else the committed slot.
    pub fn latest_val(&self) -> Option<&[u8]> {
        match self.stack.last() {
            Some(Provisional {
                op: ProvisionalOp::Insert(v),
                ..
            }) => Some(v),
            Some(Provisional {
                op: ProvisionalOp::Delete,
                ..
            }) => None,
            None => match &self.committed {
                Committed::Present(v) => Some(v),
                Committed::Tombstone => None,
            },
        }
    }

    pub fn latest_is_del(&self) -> bool {
        self.latest_val().is_none()
    }

    /// Any provisional operation issued under the given transaction chain?
    pub fn has_xids(&self, xids: &Xids) -> bool {
        self.stack.iter().any(|p| p.xids.starts_with(xids))
    }

    /// The value this reader sees, or `None` for "no such key".
    pub fn visible_value(&self, view: &TxnView) -> Option<&[u8]> {
        for p in self.stack.iter().rev() {
            if view.reads_txn(p.xids.innermost()) {
                return match &p.op {
                    ProvisionalOp::Insert(v) => Some(v),
                    ProvisionalOp::Delete => None,
                };
            }
        }
        match &self.committed {
            Committed::Present(v) => Some(v),
            Committed::Tombstone => None,
        }
    }

    /// Serialized footprint, mirroring the on-disk leaf-entry framing.
    pub fn disksize(&self) -> usize {
        let committed = match &self.committed {
            Committed::Present(v) => 1 + 4 + v.len(),
            Committed::Tombstone => 1,
        };
        let stack: usize = self
            .stack
            .iter()
            .map(|p| {
                p.xids.serialized_size()
                    + match &p.op {
                        ProvisionalOp::Insert(v) => 1 + 4 + v.len(),
                        ProvisionalOp::Delete => 1,
                    }
            })
            .sum();
        4 + self.key.len() + 1 + committed + 4 + stack
    }

    /// In-memory footprint for cache attribution.
    pub fn memsize(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.capacity() + {
            let committed = match &self.committed {
                Committed::Present(v) => v.capacity(),
                Committed::Tombstone => 0,
            };
            let stack: usize = self
                .stack
                .iter()
                .map(|p| {
                    std::mem::size_of::<Provisional>()
                        + match &p.op {
                            ProvisionalOp::Insert(v) => v.capacity(),
                            ProvisionalOp::Delete => 0,
                        }
                })
                .sum();
            committed + stack
        }
    }

    /// Reassemble an entry from its serialized parts.
    pub(crate) fn from_parts(
        key: Vec<u8>,
        committed: Committed,
        stack: SmallVec<[Provisional; 1]>,
    ) -> Self {
        Self {
            key,
            committed,
            stack,
        }
    }
}

/// Apply one message to the existing entry for its key (if any), producing
/// the replacement entry or `None` when the key ceases to exist.
///
/// This is the only place leaf-entry state changes. `Update` messages never
/// reach here - the basement translates them into a synthesized insert or
/// delete first.
pub fn apply_message(existing: Option<&LeafEntry>, msg: &Message) -> Option<LeafEntry> {
    match msg.mtype {
        MessageType::Insert => Some(apply_insert(existing, msg)),
        MessageType::InsertNoOverwrite => {
            // An existing live value wins; the entry is preserved so replay
            // of the same message stays a no-op.
            match existing {
                Some(le) if !le.latest_is_del() => Some(le.clone()),
                _ => Some(apply_insert(existing, msg)),
            }
        }
        MessageType::DeleteAny => apply_delete(existing, msg),
        MessageType::AbortAny | MessageType::AbortBroadcastTxn => {
            let le = existing?;
            let mut le = le.clone();
            le.stack.retain(|p| !p.xids.starts_with(&msg.xids));
            finish(le)
        }
        MessageType::CommitAny | MessageType::CommitBroadcastTxn => {
            let le = existing?;
            if !le.has_xids(&msg.xids) {
                return Some(le.clone());
            }
            let mut le = le.clone();
            promote_matching(&mut le, &msg.xids);
            finish(le)
        }
        MessageType::CommitBroadcastAll => {
            let le = existing?;
            if le.is_clean() {
                return Some(le.clone());
            }
            let mut le = le.clone();
            promote_matching(&mut le, &Xids::root());
            finish(le)
        }
        MessageType::Optimize | MessageType::OptimizeForUpgrade => {
            // The message's xids carry the set of root transactions still
            // live when the optimize was issued; their provisional state is
            // left alone, everything else is flattened as committed.
            let le = existing?;
            if le.is_clean() {
                return Some(le.clone());
            }
            let outermost = le.stack.first().map(|p| p.xids.outermost());
            match outermost {
                Some(root) if msg.xids.contains(root) => Some(le.clone()),
                _ => {
                    let mut le = le.clone();
                    promote_matching(&mut le, &Xids::root());
                    finish(le)
                }
            }
        }
        MessageType::None => existing.cloned(),
        MessageType::Update | MessageType::UpdateBroadcastAll => {
            unreachable!("update messages are synthesized into insert/delete by the basement")
        }
    }
}

fn apply_insert(existing: Option<&LeafEntry>, msg: &Message) -> LeafEntry {
    if msg.xids.is_root() {
        // Committed write: the locking layer above guarantees no live
        // provisional state can race this key, so the stack resets.
        return LeafEntry {
            key: msg.key.clone(),
            committed: Committed::Present(msg.val.clone()),
            stack: SmallVec::new(),
        };
    }
    let mut le = existing.cloned().unwrap_or(LeafEntry {
        key: msg.key.clone(),
        committed: Committed::Tombstone,
        stack: SmallVec::new(),
    });
    upsert_provisional(&mut le, msg, ProvisionalOp::Insert(msg.val.clone()));
    le
}

fn apply_delete(existing: Option<&LeafEntry>, msg: &Message) -> Option<LeafEntry> {
    if msg.xids.is_root() {
        // Committed delete removes the entry outright.
        return None;
    }
    let le = existing?;
    let mut le = le.clone();
    upsert_provisional(&mut le, msg, ProvisionalOp::Delete);
    Some(le)
}

fn upsert_provisional(le: &mut LeafEntry, msg: &Message, op: ProvisionalOp) {
    if let Some(p) = le.stack.iter_mut().find(|p| p.xids == msg.xids) {
        p.op = op;
    } else {
        le.stack.push(Provisional {
            xids: msg.xids.clone(),
            op,
        });
    }
}

/// Fold every provisional op under `prefix` into the committed slot
/// (innermost wins) and drop them from the stack.
fn promote_matching(le: &mut LeafEntry, prefix: &Xids) {
    let mut promoted: Option<ProvisionalOp> = None;
    le.stack.retain(|p| {
        if p.xids.starts_with(prefix) {
            promoted = Some(p.op.clone());
            false
        } else {
            true
        }
    });
    if let Some(op) = promoted {
        le.committed = match op {
            ProvisionalOp::Insert(v) => Committed::Present(v),
            ProvisionalOp::Delete => Committed::Tombstone,
        };
    }
}

fn finish(le: LeafEntry) -> Option<LeafEntry> {
    if le.stack.is_empty() && matches!(le.committed, Committed::Tombstone) {
        None
    } else {
        Some(le)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::TxnId;

    fn m(mtype: MessageType, xids: &[TxnId], key: &[u8], val: &[u8]) -> Message {
        let mut msg = Message::new(mtype, Xids::from_chain(xids), key.to_vec(), val.to_vec());
        msg.msn = 1;
        msg
    }

    #[test]
    fn committed_insert_then_lookup() {
        let le = apply_message(None, &m(MessageType::Insert, &[], b"k", b"v")).unwrap();
        assert!(le.is_clean());
        assert_eq!(le.latest_val(), Some(&b"v"[..]));
        assert_eq!(le.visible_value(&TxnView::wide_open()), Some(&b"v"[..]));
    }

    #[test]
    fn insert_no_overwrite_preserves_live_value() {
        let le = apply_message(None, &m(MessageType::Insert, &[], b"k", b"old")).unwrap();
        let le2 =
            apply_message(Some(&le), &m(MessageType::InsertNoOverwrite, &[], b"k", b"new"))
                .unwrap();
        assert_eq!(le2.latest_val(), Some(&b"old"[..]));
    }

    #[test]
    fn insert_no_overwrite_fills_deleted_slot() {
        let le = apply_message(None, &m(MessageType::Insert, &[7], b"k", b"v")).unwrap();
        let le = apply_message(Some(&le), &m(MessageType::DeleteAny, &[7], b"k", b"")).unwrap();
        assert!(le.latest_is_del());
        let le2 =
            apply_message(Some(&le), &m(MessageType::InsertNoOverwrite, &[7], b"k", b"new"))
                .unwrap();
        assert_eq!(le2.latest_val(), Some(&b"new"[..]));
    }

    #[test]
    fn committed_delete_removes_entry() {
        let le = apply_message(None, &m(MessageType::Insert, &[], b"k", b"v")).unwrap();
        assert!(apply_message(Some(&le), &m(MessageType::DeleteAny, &[], b"k", b"")).is_none());
        assert!(apply_message(None, &m(MessageType::DeleteAny, &[], b"k", b"")).is_none());
    }

    #[test]
    fn provisional_insert_commit_cycle() {
        let le = apply_message(None, &m(MessageType::Insert, &[7], b"k", b"v")).unwrap();
        assert!(!le.is_clean());
        assert_eq!(le.stack().len(), 1);

        // Visible to the writer, invisible to a concurrent reader.
        let writer = TxnView::of_txn(Xids::from_chain(&[7]), 7);
        let other = TxnView::of_txn(Xids::from_chain(&[8]), 7);
        assert_eq!(le.visible_value(&writer), Some(&b"v"[..]));
        assert_eq!(le.visible_value(&other), None);

        let le = apply_message(Some(&le), &m(MessageType::CommitAny, &[7], b"k", b"")).unwrap();
        assert!(le.is_clean());
        assert_eq!(le.visible_value(&other), Some(&b"v"[..]));
    }

    #[test]
    fn provisional_insert_abort_removes_entry() {
        let le = apply_message(None, &m(MessageType::Insert, &[7], b"k", b"v")).unwrap();
        assert!(apply_message(Some(&le), &m(MessageType::AbortAny, &[7], b"k", b"")).is_none());
    }

    #[test]
    fn provisional_delete_abort_restores_committed() {
        let le = apply_message(None, &m(MessageType::Insert, &[], b"k", b"v")).unwrap();
        let le = apply_message(Some(&le), &m(MessageType::DeleteAny, &[9], b"k", b"")).unwrap();
        assert!(le.latest_is_del());
        let le = apply_message(Some(&le), &m(MessageType::AbortAny, &[9], b"k", b"")).unwrap();
        assert!(le.is_clean());
        assert_eq!(le.latest_val(), Some(&b"v"[..]));
    }

    #[test]
    fn provisional_delete_commit_removes_entry() {
        let le = apply_message(None, &m(MessageType::Insert, &[], b"k", b"v")).unwrap();
        let le = apply_message(Some(&le), &m(MessageType::DeleteAny, &[9], b"k", b"")).unwrap();
        assert!(
            apply_message(Some(&le), &m(MessageType::CommitAny, &[9], b"k", b"")).is_none()
        );
    }

    #[test]
    fn nested_txn_commit_promotes_innermost() {
        let le = apply_message(None, &m(MessageType::Insert, &[7], b"k", b"outer")).unwrap();
        let le = apply_message(Some(&le), &m(MessageType::Insert, &[7, 8], b"k", b"inner"))
            .unwrap();
        assert_eq!(le.stack().len(), 2);
        // Committing the root promotes the innermost op.
        let le = apply_message(Some(&le), &m(MessageType::CommitBroadcastTxn, &[7], b"", b""))
            .unwrap();
        assert!(le.is_clean());
        assert_eq!(le.latest_val(), Some(&b"inner"[..]));
    }

    #[test]
    fn optimize_skips_live_transactions() {
        let live = apply_message(None, &m(MessageType::Insert, &[7], b"k", b"v")).unwrap();
        // txn 7 is still live: listed in the optimize message's xids.
        let kept =
            apply_message(Some(&live), &m(MessageType::Optimize, &[7], b"", b"")).unwrap();
        assert!(!kept.is_clean());

        // txn 7 no longer live: its provisional state flattens.
        let flat = apply_message(Some(&live), &m(MessageType::Optimize, &[], b"", b"")).unwrap();
        assert!(flat.is_clean());
        assert_eq!(flat.latest_val(), Some(&b"v"[..]));
    }

    #[test]
    fn disksize_counts_all_parts() {
        let le = apply_message(None, &m(MessageType::Insert, &[7], b"key", b"value")).unwrap();
        // key(4+3) + committed tag(1) + tombstone(1) + stack len(4)
        //   + one provisional: xids(1+8) + op tag+len+val(1+4+5)
        assert_eq!(le.disksize(), 4 + 3 + 1 + 1 + 4 + 9 + 10);
        assert!(le.memsize() >= le.keylen());
    }
}
