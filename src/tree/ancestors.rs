//! # Ancestor Chains and Deferred-Message Replay
//!
//! A descent remembers its path as a stack-allocated linked list of
//! `(node, childnum)` frames - each frame lives in the caller's stack
//! frame and borrows the pinned node, so the chain can never outlive the
//! pins that back it.
//!
//! When a leaf is pinned for a query, the messages still buffered in its
//! ancestors are replayed into the in-memory basements before the leaf is
//! searched. A message applies iff:
//!
//! 1. its MSN is above the leaf's on-disk watermark (older messages are
//!    already reflected in the loaded image), and
//! 2. it is a broadcast, or its key falls inside the leaf's pivot range
//!    `(lower_bound_exclusive, upper_bound_inclusive]`.
//!
//! Replay changes only the in-memory soft copy: the ancestors keep their
//! buffers, the leaf's dirty bit is untouched, and the on-disk image stays
//! stale until a real flush arrives. The per-basement MSN watermark makes
//! replay idempotent when the same messages are seen again.

use crate::leaf::{KeyCmp, UpdateFn};
use crate::msg::Message;
use crate::node::Node;

/// One frame of the descent path: `node` is the pinned ancestor, and the
/// child the descent took is `childnum`. `next` points one level closer to
/// the root.
pub(crate) struct Ancestors<'a> {
    pub node: &'a Node,
    pub childnum: usize,
    pub next: Option<&'a Ancestors<'a>>,
}

/// The key range a node (or one of its partitions) is responsible for.
/// `None` bounds are infinite.
#[derive(Debug, Clone, Default)]
pub(crate) struct PivotBounds {
    pub lower_exclusive: Option<Vec<u8>>,
    pub upper_inclusive: Option<Vec<u8>>,
}

impl PivotBounds {
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Narrow these bounds to child `childnum` of `node`.
    pub fn next(&self, node: &Node, childnum: usize) -> PivotBounds {
        let lower = if childnum > 0 {
            Some(node.pivots[childnum - 1].clone())
        } else {
            self.lower_exclusive.clone()
        };
        let upper = if childnum < node.n_children() - 1 {
            Some(node.pivots[childnum].clone())
        } else {
            self.upper_inclusive.clone()
        };
        PivotBounds {
            lower_exclusive: lower,
            upper_inclusive: upper,
        }
    }

    pub fn contains(&self, key: &[u8], cmp: KeyCmp) -> bool {
        use std::cmp::Ordering;
        if let Some(lower) = &self.lower_exclusive {
            if cmp(lower, key) != Ordering::Less {
                return false;
            }
        }
        if let Some(upper) = &self.upper_inclusive {
            if cmp(key, upper) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

fn message_in_range(msg: &Message, bounds: &PivotBounds, cmp: KeyCmp) -> bool {
    if msg.mtype.applies_all() {
        return true;
    }
    bounds.contains(&msg.key, cmp)
}

/// Bring a pinned leaf up to date with everything its ancestors still
/// buffer for it. Only in-memory state changes; see the module docs.
pub(crate) fn apply_ancestors(
    leaf: &mut Node,
    ancestors: Option<&Ancestors<'_>>,
    bounds: &PivotBounds,
    cmp: KeyCmp,
    update_cb: Option<UpdateFn>,
) {
    debug_assert!(leaf.is_leaf());

    let mut max_ancestor_msn = leaf.max_msn_applied_in_memory;
    let mut refreshed = false;

    for i in 0..leaf.n_children() {
        if !leaf.partitions[i].state.is_available() {
            continue;
        }
        if leaf.basement(i).soft_copy_up_to_date() {
            continue;
        }
        refreshed = true;

        let curr_bounds = bounds.next(leaf, i);
        let min_msn = leaf.max_msn_applied_on_disk;
        let bn = leaf.basement_mut(i);
        let mut frame = ancestors;
        while let Some(a) = frame {
            for msg in a.node.buffer(a.childnum).iter() {
                if msg.msn > min_msn && message_in_range(msg, &curr_bounds, cmp) {
                    bn.apply_message(msg, cmp, update_cb);
                }
            }
            max_ancestor_msn = max_ancestor_msn.max(a.node.max_msn_applied_in_memory);
            frame = a.next;
        }
        bn.set_soft_copy_up_to_date(true);
    }

    if refreshed {
        leaf.max_msn_applied_in_memory = max_ancestor_msn;
        for i in 0..leaf.n_children() {
            if leaf.partitions[i].state.is_available() {
                leaf.refresh_leaf_estimates(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::default_key_cmp;
    use crate::msg::{MessageType, Xids};
    use crate::node::{Partition, PartitionState};

    fn leaf_node(blocknum: u64) -> Node {
        Node::new_leaf(blocknum, 1 << 20, 0)
    }

    fn parent_with_buffered(msgs: Vec<Message>) -> Node {
        let mut parent = Node::new_empty(1, 1, 0, 1 << 20, 0);
        parent.partitions.push(Partition::internal(2));
        for msg in msgs {
            parent.buffer_mut(0).enqueue(msg);
        }
        parent
    }

    fn insert_at(msn: u64, key: &[u8]) -> Message {
        let mut m =
            Message::new(MessageType::Insert, Xids::root(), key.to_vec(), b"v".to_vec());
        m.msn = msn;
        m
    }

    #[test]
    fn replay_applies_new_messages_only() {
        let parent = parent_with_buffered(vec![insert_at(5, b"a"), insert_at(6, b"b")]);
        let mut leaf = leaf_node(2);
        leaf.max_msn_applied_on_disk = 5;
        leaf.max_msn_applied_in_memory = 5;
        leaf.basement_mut(0).set_max_msn_applied(5);

        let anc = Ancestors {
            node: &parent,
            childnum: 0,
            next: None,
        };
        apply_ancestors(
            &mut leaf,
            Some(&anc),
            &PivotBounds::infinite(),
            default_key_cmp,
            None,
        );

        // msn 5 is already on disk; only msn 6 lands.
        assert_eq!(leaf.basement(0).len(), 1);
        assert_eq!(leaf.basement(0).fetch(0).unwrap().key(), b"b");
        assert!(leaf.basement(0).soft_copy_up_to_date());
        assert_eq!(leaf.max_msn_applied_in_memory, 6);
        // The parent's buffer is untouched and the leaf is not dirtied.
        assert_eq!(parent.buffer(0).len(), 2);
        assert!(!leaf.dirty);
    }

    #[test]
    fn replay_respects_pivot_range() {
        let parent = parent_with_buffered(vec![insert_at(1, b"a"), insert_at(2, b"m")]);
        let mut leaf = leaf_node(2);

        let anc = Ancestors {
            node: &parent,
            childnum: 0,
            next: None,
        };
        let bounds = PivotBounds {
            lower_exclusive: Some(b"c".to_vec()),
            upper_inclusive: Some(b"z".to_vec()),
        };
        apply_ancestors(&mut leaf, Some(&anc), &bounds, default_key_cmp, None);

        assert_eq!(leaf.basement(0).len(), 1);
        assert_eq!(leaf.basement(0).fetch(0).unwrap().key(), b"m");
    }

    #[test]
    fn replay_skips_up_to_date_and_paged_out_basements() {
        let parent = parent_with_buffered(vec![insert_at(1, b"a")]);
        let mut leaf = leaf_node(2);
        leaf.basement_mut(0).set_soft_copy_up_to_date(true);

        let anc = Ancestors {
            node: &parent,
            childnum: 0,
            next: None,
        };
        apply_ancestors(
            &mut leaf,
            Some(&anc),
            &PivotBounds::infinite(),
            default_key_cmp,
            None,
        );
        assert_eq!(leaf.basement(0).len(), 0, "up-to-date basement is left alone");

        let mut evicted = leaf_node(3);
        evicted.partitions[0].state = PartitionState::OnDisk;
        apply_ancestors(
            &mut evicted,
            Some(&anc),
            &PivotBounds::infinite(),
            default_key_cmp,
            None,
        );
        assert!(matches!(evicted.partitions[0].state, PartitionState::OnDisk));
    }

    #[test]
    fn chain_replays_oldest_first() {
        // Messages flush downward, so the ancestor closer to the leaf
        // holds the older message. The chain walks leaf-upward: older
        // applies first, the root-side newer one wins.
        let parent = parent_with_buffered(vec![insert_at(1, b"k")]);
        let mut newer = insert_at(2, b"k");
        newer.val = b"new".to_vec();
        let grandparent = parent_with_buffered(vec![newer]);

        let gp_frame = Ancestors {
            node: &grandparent,
            childnum: 0,
            next: None,
        };
        let p_frame = Ancestors {
            node: &parent,
            childnum: 0,
            next: Some(&gp_frame),
        };

        let mut leaf = leaf_node(4);
        apply_ancestors(
            &mut leaf,
            Some(&p_frame),
            &PivotBounds::infinite(),
            default_key_cmp,
            None,
        );
        assert_eq!(leaf.basement(0).len(), 1);
        assert_eq!(
            leaf.basement(0).fetch(0).unwrap().latest_val(),
            Some(&b"new"[..])
        );
    }
}
