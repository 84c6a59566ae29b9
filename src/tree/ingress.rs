//! # Root Ingress
//!
//! Every write enters the tree here. The root is pinned non-blocking
//! (retrying from scratch if the pin loses a race), the message is stamped
//! with the next MSN, and then:
//!
//! - a leaf root absorbs the message directly into its basements;
//! - a nonleaf root appends it to the targeted child's buffer (broadcasts
//!   are duplicated into every child's buffer).
//!
//! Leaves that happen to be resident are brought current immediately - the
//! same message is applied to them through the in-memory path, gated by
//! their MSN watermarks so the later buffered copy replays as a no-op.
//! This keeps warm data consistent without waiting for a flush.
//!
//! Finally, a gorged root flushes its heaviest child once, and root
//! reactivity is handled (a fissible root splits under a brand-new root;
//! a fusible root is left alone - there is nothing to merge it with).

use eyre::{ensure, Result};
use tracing::trace;

use super::ancestors::PivotBounds;
use super::{flush, reshape, Brt};
use crate::cache::{FetchPlan, PinOutcome};
use crate::leaf::{KeyCmp, UpdateFn};
use crate::msg::Message;
use crate::node::{Blocknum, Node};

/// Append a message to an internal node, routing or duplicating by kind.
pub(crate) fn nonleaf_put(node: &mut Node, msg: Message, cmp: KeyCmp) -> Result<()> {
    debug_assert!(node.height > 0);
    ensure!(
        msg.msn > node.max_msn_applied_in_memory,
        "message MSN {} not above node {} watermark {}",
        msg.msn,
        node.blocknum,
        node.max_msn_applied_in_memory
    );
    node.max_msn_applied_in_memory = msg.msn;

    if msg.mtype.applies_once() {
        let childnum = node.which_child(&msg.key, cmp);
        node.buffer_mut(childnum).enqueue(msg);
    } else if msg.mtype.applies_all() {
        for childnum in 0..node.n_children() {
            node.buffer_mut(childnum).enqueue(msg.clone());
        }
    }
    node.dirty = true;
    Ok(())
}

/// Apply a message to the resident basements of a leaf node, gated by the
/// node's in-memory watermark. `authoritative` marks the application that
/// *owns* the message (a leaf root); non-authoritative applications keep
/// the node clean because the buffered copy above remains the durable one.
pub(crate) fn apply_to_leaf_node(
    node: &mut Node,
    msg: &Message,
    cmp: KeyCmp,
    update_cb: Option<UpdateFn>,
    authoritative: bool,
) -> bool {
    debug_assert!(node.is_leaf());
    if msg.msn <= node.max_msn_applied_in_memory {
        return false;
    }
    node.max_msn_applied_in_memory = msg.msn;

    let mut made_change = false;
    if msg.mtype.applies_once() {
        let childnum = node.which_child(&msg.key, cmp);
        if node.partitions[childnum].state.is_available() {
            made_change = node.basement_mut(childnum).apply_message(msg, cmp, update_cb);
            if made_change {
                node.refresh_leaf_estimates(childnum);
            }
        }
    } else if msg.mtype.applies_all() {
        for childnum in 0..node.n_children() {
            if node.partitions[childnum].state.is_available() {
                if node.basement_mut(childnum).apply_message(msg, cmp, update_cb) {
                    made_change = true;
                    node.refresh_leaf_estimates(childnum);
                }
            }
        }
    }
    if authoritative && made_change {
        node.dirty = true;
    }
    made_change
}

/// Keep already-resident leaves current: descend from the (locked) root
/// through whatever interior nodes are in cache and apply the message to
/// each reachable leaf. Nothing is fetched and nothing is dirtied - the
/// buffered copy of the message stays authoritative. Estimates are
/// refreshed back up the warm path (inexactly, since unreached subtrees
/// keep their old numbers).
fn apply_to_warm_leaves(tree: &Brt, root: &mut Node, msg: &Message) {
    if root.height == 0 {
        return; // already applied directly at the root
    }
    let cmp = tree.opts.cmp;
    if msg.mtype.applies_once() {
        let childnum = root.which_child(&msg.key, cmp);
        if let Some(est) = descend_warm(tree, root.partitions[childnum].child_blocknum, msg) {
            root.partitions[childnum].estimates = est;
        }
    } else if msg.mtype.applies_all() {
        for childnum in 0..root.n_children() {
            if let Some(est) = descend_warm(tree, root.partitions[childnum].child_blocknum, msg)
            {
                root.partitions[childnum].estimates = est;
            }
        }
    }
}

/// Returns the node's refreshed aggregate estimates (marked inexact) when
/// the node was resident, so the parent can adopt them.
fn descend_warm(
    tree: &Brt,
    blocknum: Blocknum,
    msg: &Message,
) -> Option<crate::node::SubtreeEstimates> {
    let Some(guard) = tree.cache.pin_if_cached(blocknum) else {
        return None;
    };
    let mut node = guard.write();
    if node.height > 0 {
        let cmp = tree.opts.cmp;
        if msg.mtype.applies_once() {
            let childnum = node.which_child(&msg.key, cmp);
            let child = node.partitions[childnum].child_blocknum;
            drop(node);
            let child_est = descend_warm(tree, child, msg);
            let mut node = guard.write();
            if let Some(est) = child_est {
                node.partitions[childnum].estimates = est;
            }
            let mut agg = node.aggregate_estimates();
            agg.exact = false;
            Some(agg)
        } else {
            let children: Vec<Blocknum> =
                node.partitions.iter().map(|p| p.child_blocknum).collect();
            drop(node);
            let child_ests: Vec<_> = children
                .into_iter()
                .map(|child| descend_warm(tree, child, msg))
                .collect();
            let mut node = guard.write();
            for (childnum, child_est) in child_ests.into_iter().enumerate() {
                if let Some(est) = child_est {
                    node.partitions[childnum].estimates = est;
                }
            }
            let mut agg = node.aggregate_estimates();
            agg.exact = false;
            Some(agg)
        }
    } else {
        apply_to_leaf_node(&mut node, msg, tree.opts.cmp, tree.opts.update_cb, false);
        let mut agg = node.aggregate_estimates();
        agg.exact = false;
        Some(agg)
    }
}

/// Stamp and push one message into the tree. See the module docs for the
/// full sequence.
pub(crate) fn root_put(tree: &Brt, mut msg: Message) -> Result<()> {
    loop {
        let root_blocknum = tree.header.read().root_blocknum;
        let guard = match tree.cache.pin_nonblocking(root_blocknum, &FetchPlan::All)? {
            PinOutcome::TryAgain => {
                trace!("root pin lost the race; retrying put");
                continue;
            }
            PinOutcome::Pinned(g) => g,
        };

        {
            let mut header = tree.header.write();
            header.root_put_counter = tree.env.next_root_put();
        }

        let mut node = guard.write();
        node.assert_entirely_in_memory();
        msg.msn = node.max_msn_applied_in_memory + 1;

        {
            let mut header = tree.header.write();
            ensure!(
                msg.msn > header.highest_msn,
                "MSN {} regressed below header watermark {}",
                msg.msn,
                header.highest_msn
            );
            header.highest_msn = msg.msn;
            header.dirty = true;
        }

        if node.is_leaf() {
            apply_to_leaf_node(&mut node, &msg, tree.opts.cmp, tree.opts.update_cb, true);
        } else {
            nonleaf_put(&mut node, msg.clone(), tree.opts.cmp)?;
        }
        debug_assert_eq!(msg.msn, node.max_msn_applied_in_memory);

        apply_to_warm_leaves(tree, &mut node, &msg);

        if node.height > 0 && node.is_gorged() {
            // One message went in; flushing a single child suffices.
            flush::flush_some_child(tree, &mut node, true, true, None, &PivotBounds::infinite())?;
        }

        reshape::maybe_reactive_root(tree, &mut node)?;
        return Ok(());
    }
}
