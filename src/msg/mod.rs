//! # Message Model
//!
//! Every mutation of the tree is a message: a small value object carrying
//! its kind, an MSN stamp, the issuing transaction's id stack, and the
//! key/value payload. Messages are appended at the root and travel down the
//! tree through per-child buffers; the MSN (assigned exactly once, at root
//! ingress) defines the total order of writes against one dictionary.
//!
//! Messages come in two routing classes:
//!
//! - **targeted** - carry a key and are routed to exactly one child at each
//!   level (`which_child` on the pivots);
//! - **broadcast** - keyless, duplicated into every child's buffer on the
//!   way down.
//!
//! ## MSN ordering invariant
//!
//! Any message sitting in a node's child buffer has an MSN strictly greater
//! than the node's `max_msn_applied_in_memory` had when the message
//! arrived, and strictly greater than the MSN any node below it has
//! absorbed. Replay during ancestor application is therefore idempotent:
//! a leaf skips messages at or below its own watermark.

mod buffer;
mod xids;

pub use buffer::MessageBuffer;
pub use xids::{TxnId, Xids, TXNID_NONE};

use crate::config::MSG_OVERHEAD;

/// Message sequence number. Monotone per dictionary, assigned at root
/// ingress.
pub type Msn = u64;

/// MSN of a freshly created node: below every real message.
pub const MIN_MSN: Msn = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    None = 0,
    Insert = 1,
    InsertNoOverwrite = 2,
    DeleteAny = 3,
    AbortAny = 4,
    CommitAny = 5,
    Update = 6,
    UpdateBroadcastAll = 7,
    CommitBroadcastAll = 8,
    CommitBroadcastTxn = 9,
    AbortBroadcastTxn = 10,
    Optimize = 11,
    OptimizeForUpgrade = 12,
}

impl MessageType {
    /// Keyed messages, routed to a single child at each level.
    pub fn applies_once(self) -> bool {
        matches!(
            self,
            MessageType::Insert
                | MessageType::InsertNoOverwrite
                | MessageType::DeleteAny
                | MessageType::AbortAny
                | MessageType::CommitAny
                | MessageType::Update
        )
    }

    /// Keyless messages, duplicated into every child on descent.
    pub fn applies_all(self) -> bool {
        matches!(
            self,
            MessageType::UpdateBroadcastAll
                | MessageType::CommitBroadcastAll
                | MessageType::CommitBroadcastTxn
                | MessageType::AbortBroadcastTxn
                | MessageType::Optimize
                | MessageType::OptimizeForUpgrade
        )
    }

    pub fn does_nothing(self) -> bool {
        matches!(self, MessageType::None)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MessageType::None,
            1 => MessageType::Insert,
            2 => MessageType::InsertNoOverwrite,
            3 => MessageType::DeleteAny,
            4 => MessageType::AbortAny,
            5 => MessageType::CommitAny,
            6 => MessageType::Update,
            7 => MessageType::UpdateBroadcastAll,
            8 => MessageType::CommitBroadcastAll,
            9 => MessageType::CommitBroadcastTxn,
            10 => MessageType::AbortBroadcastTxn,
            11 => MessageType::Optimize,
            12 => MessageType::OptimizeForUpgrade,
            _ => return None,
        })
    }
}

/// One buffered mutation. The key is empty for broadcast messages; the
/// value is empty where the kind carries none (deletes, commits, aborts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub msn: Msn,
    pub xids: Xids,
    pub key: Vec<u8>,
    pub val: Vec<u8>,
}

impl Message {
    pub fn new(mtype: MessageType, xids: Xids, key: Vec<u8>, val: Vec<u8>) -> Self {
        debug_assert!(!mtype.applies_all() || key.is_empty());
        Self {
            mtype,
            msn: MIN_MSN,
            xids,
            key,
            val,
        }
    }

    /// Bytes this message is charged for in a child buffer; mirrors the
    /// serialized framing so buffer weights track on-disk size.
    pub fn buffered_size(&self) -> usize {
        self.key.len() + self.val.len() + MSG_OVERHEAD + self.xids.serialized_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_classes_are_disjoint() {
        let all = [
            MessageType::None,
            MessageType::Insert,
            MessageType::InsertNoOverwrite,
            MessageType::DeleteAny,
            MessageType::AbortAny,
            MessageType::CommitAny,
            MessageType::Update,
            MessageType::UpdateBroadcastAll,
            MessageType::CommitBroadcastAll,
            MessageType::CommitBroadcastTxn,
            MessageType::AbortBroadcastTxn,
            MessageType::Optimize,
            MessageType::OptimizeForUpgrade,
        ];
        for t in all {
            let classes =
                t.applies_once() as u8 + t.applies_all() as u8 + t.does_nothing() as u8;
            assert_eq!(classes, 1, "{t:?} must be in exactly one routing class");
            assert_eq!(MessageType::from_u8(t as u8), Some(t));
        }
        assert_eq!(MessageType::from_u8(99), None);
    }

    #[test]
    fn buffered_size_tracks_payload() {
        let m = Message::new(
            MessageType::Insert,
            Xids::from_chain(&[5]),
            b"key".to_vec(),
            b"value".to_vec(),
        );
        assert_eq!(m.buffered_size(), 3 + 5 + MSG_OVERHEAD + 9);
    }
}
