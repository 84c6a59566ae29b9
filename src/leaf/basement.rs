//! # Basement Nodes
//!
//! A basement is one leaf partition: an ordered array of leaf entries plus
//! the bookkeeping the engine needs around it:
//!
//! - `n_bytes`: running sum of entry disk sizes, used by reactivity checks;
//! - `seqinsert`: a hint counting consecutive inserts that landed near the
//!   right edge, which switches the insert path to an append-likely probe
//!   that checks only the last element;
//! - `soft_copy_up_to_date`: whether ancestor messages have been replayed
//!   into this in-memory copy;
//! - `max_msn_applied`: the highest MSN absorbed, gating replay so applying
//!   the same message twice is a no-op.
//!
//! ## Sequential insert window
//!
//! An insert counts as sequential when it lands within
//! `max(1, min(32, n/16))` entries of the right edge. While the counter is
//! nonzero the next insert first probes only the last entry, turning a
//! right-edge append workload into O(1) placement instead of a binary
//! search.

use std::cmp::Ordering;

use super::entry::{self, LeafEntry};
use super::{KeyCmp, UpdateFn};
use crate::config::{SEQINSERT_WINDOW_DIVISOR, SEQINSERT_WINDOW_MAX};
use crate::msg::{Message, MessageType, Msn, MIN_MSN};

/// One leaf partition: an ordered run of leaf entries.
#[derive(Debug, Clone)]
pub struct Basement {
    entries: Vec<LeafEntry>,
    n_bytes: usize,
    seqinsert: u32,
    soft_copy_up_to_date: bool,
    max_msn_applied: Msn,
    /// Version recorded by the newest `OptimizeForUpgrade` seen, if any.
    optimized_for_upgrade: u32,
}

impl Default for Basement {
    fn default() -> Self {
        Self::new()
    }
}

impl Basement {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            n_bytes: 0,
            seqinsert: 0,
            soft_copy_up_to_date: false,
            max_msn_applied: MIN_MSN,
            optimized_for_upgrade: 0,
        }
    }

    /// Rebuild a basement from entries already in key order (deserialize,
    /// split, merge).
    pub fn from_sorted_entries(entries: Vec<LeafEntry>, max_msn_applied: Msn) -> Self {
        let n_bytes = entries.iter().map(|le| le.disksize()).sum();
        Self {
            entries,
            n_bytes,
            seqinsert: 0,
            soft_copy_up_to_date: false,
            max_msn_applied,
            optimized_for_upgrade: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn seqinsert(&self) -> u32 {
        self.seqinsert
    }

    /// Carry the sequential-insert hint across a rewrite of the basement
    /// array (serialization rebalance).
    pub(crate) fn force_seqinsert(&mut self, v: u32) {
        self.seqinsert = v;
    }

    pub fn soft_copy_up_to_date(&self) -> bool {
        self.soft_copy_up_to_date
    }

    pub fn set_soft_copy_up_to_date(&mut self, v: bool) {
        self.soft_copy_up_to_date = v;
    }

    pub fn max_msn_applied(&self) -> Msn {
        self.max_msn_applied
    }

    pub fn set_max_msn_applied(&mut self, msn: Msn) {
        self.max_msn_applied = msn;
    }

    pub fn optimized_for_upgrade(&self) -> u32 {
        self.optimized_for_upgrade
    }

    pub fn fetch(&self, idx: usize) -> Option<&LeafEntry> {
        self.entries.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LeafEntry> {
        self.entries.iter()
    }

    pub fn memsize(&self) -> usize {
        std::mem::size_of::<Self>() + self.entries.iter().map(|le| le.memsize()).sum::<usize>()
    }

    /// Exact search: `Ok(idx)` on a hit, `Err(insertion_point)` otherwise.
    pub fn find_zero(&self, key: &[u8], cmp: KeyCmp) -> Result<usize, usize> {
        self.entries.binary_search_by(|le| cmp(le.key(), key))
    }

    /// Index of the first entry `>= key` (or `> key` when not inclusive).
    pub fn lower_bound(&self, key: &[u8], cmp: KeyCmp, inclusive: bool) -> usize {
        self.entries.partition_point(|le| match cmp(le.key(), key) {
            Ordering::Less => true,
            Ordering::Equal => !inclusive,
            Ordering::Greater => false,
        })
    }

    /// Index of the last entry `<= key` (or `< key`), if any.
    pub fn upper_bound(&self, key: &[u8], cmp: KeyCmp, inclusive: bool) -> Option<usize> {
        let n = self.entries.partition_point(|le| match cmp(le.key(), key) {
            Ordering::Less => true,
            Ordering::Equal => inclusive,
            Ordering::Greater => false,
        });
        n.checked_sub(1)
    }

    pub fn insert_at(&mut self, idx: usize, le: LeafEntry) {
        self.n_bytes += le.disksize();
        self.entries.insert(idx, le);
    }

    pub fn set_at(&mut self, idx: usize, le: LeafEntry) {
        self.n_bytes -= self.entries[idx].disksize();
        self.n_bytes += le.disksize();
        self.entries[idx] = le;
    }

    pub fn delete_at(&mut self, idx: usize) -> LeafEntry {
        let le = self.entries.remove(idx);
        self.n_bytes -= le.disksize();
        le
    }

    /// Split off the entries from `idx` onward into a new basement (used by
    /// leaf fission). Both halves keep the MSN watermark.
    pub fn split_off(&mut self, idx: usize) -> Basement {
        let right = self.entries.split_off(idx);
        let moved: usize = right.iter().map(|le| le.disksize()).sum();
        self.n_bytes -= moved;
        self.seqinsert = 0;
        let mut bn = Basement::from_sorted_entries(right, self.max_msn_applied);
        bn.soft_copy_up_to_date = self.soft_copy_up_to_date;
        bn
    }

    /// Apply one message to this partition. Returns true when anything
    /// changed. Messages at or below the absorbed MSN watermark are
    /// ignored, making replay idempotent.
    pub fn apply_message(
        &mut self,
        msg: &Message,
        cmp: KeyCmp,
        update_cb: Option<UpdateFn>,
    ) -> bool {
        if msg.msn <= self.max_msn_applied {
            return false;
        }
        self.max_msn_applied = msg.msn;

        match msg.mtype {
            MessageType::Insert | MessageType::InsertNoOverwrite => {
                self.apply_keyed_upsert(msg, cmp);
                true
            }
            MessageType::DeleteAny | MessageType::AbortAny | MessageType::CommitAny => {
                match self.find_zero(&msg.key, cmp) {
                    Ok(idx) => {
                        self.apply_at(idx, msg);
                        true
                    }
                    Err(_) => false,
                }
            }
            MessageType::CommitBroadcastAll
            | MessageType::Optimize
            | MessageType::OptimizeForUpgrade => {
                if msg.mtype == MessageType::OptimizeForUpgrade && msg.val.len() >= 4 {
                    self.optimized_for_upgrade =
                        u32::from_le_bytes(msg.val[..4].try_into().unwrap());
                }
                self.sweep(msg, |le| !le.is_clean())
            }
            MessageType::CommitBroadcastTxn | MessageType::AbortBroadcastTxn => {
                self.sweep(msg, |le| le.has_xids(&msg.xids))
            }
            MessageType::Update => {
                let idx = self.find_zero(&msg.key, cmp);
                self.apply_update(idx, &msg.key, msg, update_cb)
            }
            MessageType::UpdateBroadcastAll => {
                let mut made_change = false;
                let mut idx = 0;
                while idx < self.entries.len() {
                    let before = self.entries.len();
                    let key = self.entries[idx].key().to_vec();
                    made_change |= self.apply_update(Ok(idx), &key, msg, update_cb);
                    if self.entries.len() == before {
                        idx += 1;
                    }
                }
                made_change
            }
            MessageType::None => false,
        }
    }

    fn apply_keyed_upsert(&mut self, msg: &Message, cmp: KeyCmp) {
        let doing_seqinsert = self.seqinsert;
        self.seqinsert = 0;

        // Append-likely probe: while the sequential hint is hot, check only
        // the last entry before falling back to binary search.
        let found = if doing_seqinsert > 0 {
            match self.entries.last() {
                Some(last) if cmp(last.key(), &msg.key) == Ordering::Less => {
                    Err(self.entries.len())
                }
                _ => self.find_zero(&msg.key, cmp),
            }
        } else {
            self.find_zero(&msg.key, cmp)
        };

        let (was_found, idx) = match found {
            Ok(idx) => (true, idx),
            Err(idx) => (false, idx),
        };
        let new_le = {
            let existing = was_found.then(|| &self.entries[idx]);
            entry::apply_message(existing, msg)
        };
        match (new_le, was_found) {
            (Some(le), true) => self.set_at(idx, le),
            (Some(le), false) => self.insert_at(idx, le),
            (None, true) => {
                self.delete_at(idx);
            }
            (None, false) => {}
        }

        // Did this insert land within the right-edge window?
        let n = self.entries.len() as u32;
        let w = (n / SEQINSERT_WINDOW_DIVISOR).clamp(1, SEQINSERT_WINDOW_MAX);
        if n.saturating_sub(idx as u32) <= w {
            self.seqinsert = doing_seqinsert + 1;
        }
    }

    fn apply_at(&mut self, idx: usize, msg: &Message) {
        let new_le = entry::apply_message(Some(&self.entries[idx]), msg);
        match new_le {
            Some(le) => self.set_at(idx, le),
            None => {
                self.delete_at(idx);
            }
        }
    }

    /// Apply a broadcast to every entry passing `filter`, handling removals
    /// without skipping neighbors.
    fn sweep(&mut self, msg: &Message, filter: impl Fn(&LeafEntry) -> bool) -> bool {
        let mut made_change = false;
        let mut idx = 0;
        while idx < self.entries.len() {
            if filter(&self.entries[idx]) {
                let before = self.entries.len();
                self.apply_at(idx, msg);
                made_change = true;
                if self.entries.len() == before {
                    idx += 1;
                }
            } else {
                idx += 1;
            }
        }
        made_change
    }

    fn apply_update(
        &mut self,
        found: Result<usize, usize>,
        key: &[u8],
        msg: &Message,
        update_cb: Option<UpdateFn>,
    ) -> bool {
        let Some(cb) = update_cb else {
            return false;
        };
        let old = match found {
            Ok(idx) => self.entries[idx].latest_val().map(|v| v.to_vec()),
            Err(_) => None,
        };
        let synthesized = match cb(key, old.as_deref(), &msg.val) {
            Some(new_val) => Message {
                mtype: MessageType::Insert,
                msn: msg.msn,
                xids: msg.xids.clone(),
                key: key.to_vec(),
                val: new_val,
            },
            None => Message {
                mtype: MessageType::DeleteAny,
                msn: msg.msn,
                xids: msg.xids.clone(),
                key: key.to_vec(),
                val: Vec::new(),
            },
        };
        match found {
            Ok(idx) => {
                self.apply_at(idx, &synthesized);
                true
            }
            Err(idx) => match entry::apply_message(None, &synthesized) {
                Some(le) => {
                    self.insert_at(idx, le);
                    true
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::{default_key_cmp, TxnView};
    use crate::msg::{MessageType, Xids};

    fn insert_msg(msn: Msn, key: &[u8], val: &[u8]) -> Message {
        let mut m = Message::new(MessageType::Insert, Xids::root(), key.to_vec(), val.to_vec());
        m.msn = msn;
        m
    }

    fn populated(keys: &[&[u8]]) -> Basement {
        let mut bn = Basement::new();
        for (i, k) in keys.iter().enumerate() {
            bn.apply_message(&insert_msg(i as Msn + 1, k, b"v"), default_key_cmp, None);
        }
        bn
    }

    #[test]
    fn ordered_insert_and_find() {
        let bn = populated(&[b"d", b"a", b"c", b"b"]);
        let keys: Vec<_> = bn.iter().map(|le| le.key().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(bn.find_zero(b"c", default_key_cmp), Ok(2));
        assert_eq!(bn.find_zero(b"bb", default_key_cmp), Err(2));
    }

    #[test]
    fn bounds() {
        let bn = populated(&[b"b", b"d", b"f"]);
        assert_eq!(bn.lower_bound(b"d", default_key_cmp, true), 1);
        assert_eq!(bn.lower_bound(b"d", default_key_cmp, false), 2);
        assert_eq!(bn.lower_bound(b"a", default_key_cmp, true), 0);
        assert_eq!(bn.lower_bound(b"g", default_key_cmp, true), 3);
        assert_eq!(bn.upper_bound(b"d", default_key_cmp, true), Some(1));
        assert_eq!(bn.upper_bound(b"d", default_key_cmp, false), Some(0));
        assert_eq!(bn.upper_bound(b"a", default_key_cmp, true), None);
    }

    #[test]
    fn replay_same_msn_is_noop() {
        let mut bn = Basement::new();
        let m1 = insert_msg(5, b"k", b"v1");
        assert!(bn.apply_message(&m1, default_key_cmp, None));
        // A different payload at the same MSN must be ignored: the first
        // application already absorbed this point in the write order.
        let m2 = insert_msg(5, b"k", b"v2");
        assert!(!bn.apply_message(&m2, default_key_cmp, None));
        assert_eq!(bn.fetch(0).unwrap().latest_val(), Some(&b"v1"[..]));
    }

    #[test]
    fn seqinsert_counts_right_edge_runs() {
        let mut bn = Basement::new();
        for i in 0..8u32 {
            let key = format!("key{i:04}");
            bn.apply_message(&insert_msg(i as Msn + 1, key.as_bytes(), b"v"), default_key_cmp, None);
        }
        assert!(bn.seqinsert() >= 7, "ascending run must keep the hint hot");

        // An insert far from the right edge resets the hint.
        bn.apply_message(&insert_msg(100, b"aaa", b"v"), default_key_cmp, None);
        assert_eq!(bn.seqinsert(), 0);
    }

    #[test]
    fn broadcast_commit_txn_sweeps_only_matching() {
        let mut bn = Basement::new();
        let mut m = Message::new(
            MessageType::Insert,
            Xids::from_chain(&[7]),
            b"a".to_vec(),
            b"va".to_vec(),
        );
        m.msn = 1;
        bn.apply_message(&m, default_key_cmp, None);
        let mut m = Message::new(
            MessageType::Insert,
            Xids::from_chain(&[9]),
            b"b".to_vec(),
            b"vb".to_vec(),
        );
        m.msn = 2;
        bn.apply_message(&m, default_key_cmp, None);

        let mut commit =
            Message::new(MessageType::CommitBroadcastTxn, Xids::from_chain(&[7]), vec![], vec![]);
        commit.msn = 3;
        assert!(bn.apply_message(&commit, default_key_cmp, None));

        assert!(bn.fetch(0).unwrap().is_clean());
        assert!(!bn.fetch(1).unwrap().is_clean());
    }

    #[test]
    fn update_synthesizes_insert_or_delete() {
        fn bump(_key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> Option<Vec<u8>> {
            match old {
                Some(v) => {
                    let mut out = v.to_vec();
                    out.extend_from_slice(extra);
                    Some(out)
                }
                None => None,
            }
        }

        let mut bn = populated(&[b"k"]);
        let mut upd = Message::new(MessageType::Update, Xids::root(), b"k".to_vec(), b"+".to_vec());
        upd.msn = 50;
        assert!(bn.apply_message(&upd, default_key_cmp, Some(bump)));
        assert_eq!(bn.fetch(0).unwrap().latest_val(), Some(&b"v+"[..]));

        // Update of a missing key where the callback declines: no entry.
        let mut upd = Message::new(MessageType::Update, Xids::root(), b"z".to_vec(), b"+".to_vec());
        upd.msn = 51;
        assert!(!bn.apply_message(&upd, default_key_cmp, Some(bump)));
        assert_eq!(bn.len(), 1);
    }

    #[test]
    fn split_off_preserves_bytes_and_watermark() {
        let mut bn = populated(&[b"a", b"b", b"c", b"d"]);
        let total = bn.n_bytes();
        let right = bn.split_off(2);
        assert_eq!(bn.len(), 2);
        assert_eq!(right.len(), 2);
        assert_eq!(bn.n_bytes() + right.n_bytes(), total);
        assert_eq!(right.max_msn_applied(), bn.max_msn_applied());
    }

    #[test]
    fn provisional_delete_hidden_from_other_readers() {
        let mut bn = populated(&[b"k"]);
        let mut del = Message::new(MessageType::DeleteAny, Xids::from_chain(&[3]), b"k".to_vec(), vec![]);
        del.msn = 10;
        bn.apply_message(&del, default_key_cmp, None);

        let le = bn.fetch(0).unwrap();
        let deleter = TxnView::of_txn(Xids::from_chain(&[3]), 3);
        let other = TxnView::of_txn(Xids::from_chain(&[4]), 3);
        assert_eq!(le.visible_value(&deleter), None);
        assert_eq!(le.visible_value(&other), Some(&b"v"[..]));
    }
}
