//! # Flush Engine
//!
//! A flush moves the entire buffered queue for one child of an internal
//! node down into that child. Flushing to another internal node re-homes
//! the messages into *its* per-child queues (routing targeted messages,
//! duplicating broadcasts); flushing to a leaf is a pure drain - the leaf
//! was brought up to date by ancestor replay when it was pinned, so the
//! messages are already reflected in its basements.
//!
//! ## Policy
//!
//! - **Heaviest child first**: the child with the most buffered bytes,
//!   lowest index on ties.
//! - **Cascade control**: the first flush of an ingress may chase gorged
//!   grandchildren repeatedly; any deeper flush pushes at most one level
//!   further. This discharges pressure without letting a single put walk
//!   the whole tree.
//! - After the flush the child's reactivity is handled immediately
//!   (split or merge), and the parent's estimate for that child is
//!   refreshed.

use eyre::{ensure, Result};
use tracing::debug;

use super::ancestors::{apply_ancestors, Ancestors, PivotBounds};
use super::{reshape, Brt};
use crate::cache::FetchPlan;
use crate::msg::Message;
use crate::node::{Node, Reactivity};

/// The child with the most buffered bytes; ties break to the lowest index.
pub(crate) fn find_heaviest_child(node: &Node) -> usize {
    debug_assert!(node.n_children() > 0);
    let mut max_child = 0;
    let mut max_weight = node.child_buffer_bytes(0);
    for i in 1..node.n_children() {
        let w = node.child_buffer_bytes(i);
        if w > max_weight {
            max_child = i;
            max_weight = w;
        }
    }
    max_child
}

/// Refresh the parent's per-child statistics from the child itself.
pub(crate) fn fixup_child_estimates(
    parent: &mut Node,
    childnum: usize,
    child: &Node,
    exact: bool,
) {
    let mut est = child.aggregate_estimates();
    if !exact {
        est.exact = false;
    }
    parent.partitions[childnum].estimates = est;
}

/// Pick the heaviest child of `node`, flush it, and react to whatever
/// shape the child ends up in.
pub(crate) fn flush_some_child(
    tree: &Brt,
    node: &mut Node,
    is_first_flush: bool,
    flush_recursively: bool,
    ancestors: Option<&Ancestors<'_>>,
    bounds: &PivotBounds,
) -> Result<()> {
    debug_assert!(node.height > 0);
    node.assert_entirely_in_memory();

    let childnum = find_heaviest_child(node);
    ensure!(
        !node.buffer(childnum).is_empty(),
        "flush selected child {childnum} with an empty buffer"
    );
    let child_re = flush_this_child(
        tree,
        node,
        childnum,
        is_first_flush,
        flush_recursively,
        ancestors,
        bounds,
    )?;
    handle_reactive_child(tree, node, childnum, child_re, ancestors, bounds)
}

/// Push everything buffered for `childnum` down into the child. Returns
/// the child's reactivity so the caller can split or merge it.
pub(crate) fn flush_this_child(
    tree: &Brt,
    node: &mut Node,
    childnum: usize,
    is_first_flush: bool,
    flush_recursively: bool,
    ancestors: Option<&Ancestors<'_>>,
    bounds: &PivotBounds,
) -> Result<Reactivity> {
    debug_assert!(node.height > 0);
    node.assert_entirely_in_memory();

    let child_blocknum = node.partitions[childnum].child_blocknum;
    ensure!(
        tree.node_store.blocks.lock().is_allocated(child_blocknum),
        "flush into unallocated block {child_blocknum}"
    );
    let next_bounds = bounds.next(node, childnum);
    let child_guard = tree.cache.pin(child_blocknum, &FetchPlan::All)?;
    let mut child = child_guard.write();
    child.assert_entirely_in_memory();
    debug!(
        parent = node.blocknum,
        child = child_blocknum,
        childnum,
        bytes = node.child_buffer_bytes(childnum),
        "flushing child buffer"
    );

    if child.is_leaf() {
        // Ancestor replay (this node's buffer included) brings the leaf up
        // to date; the buffer then just empties.
        {
            let frame = Ancestors {
                node: &*node,
                childnum,
                next: ancestors,
            };
            apply_ancestors(
                &mut child,
                Some(&frame),
                &next_bounds,
                tree.opts.cmp,
                tree.opts.update_cb,
            );
        }
        node.buffer_mut(childnum).drain().for_each(drop);
        node.dirty = true;
        child.dirty = true;
    } else {
        let msgs: Vec<Message> = node.buffer_mut(childnum).drain().collect();
        node.dirty = true;
        for msg in msgs {
            super::ingress::nonleaf_put(&mut child, msg, tree.opts.cmp)?;
        }

        // Having pushed all that down, the child may now be gorged; chase
        // it within the cascade budget.
        if flush_recursively {
            let mut n_flushed = 0;
            while child.is_gorged() && (is_first_flush || n_flushed == 0) {
                let frame = Ancestors {
                    node: &*node,
                    childnum,
                    next: ancestors,
                };
                flush_some_child(
                    tree,
                    &mut child,
                    is_first_flush && n_flushed == 0,
                    flush_recursively,
                    Some(&frame),
                    &next_bounds,
                )?;
                n_flushed += 1;
            }
        }
    }

    fixup_child_estimates(node, childnum, &child, true);
    let re = child.reactivity();
    Ok(re)
}

/// React to a child's post-flush shape: split the fissible, merge the
/// fusible.
pub(crate) fn handle_reactive_child(
    tree: &Brt,
    node: &mut Node,
    childnum: usize,
    re: Reactivity,
    ancestors: Option<&Ancestors<'_>>,
    bounds: &PivotBounds,
) -> Result<()> {
    match re {
        Reactivity::Stable => Ok(()),
        Reactivity::Fissible => reshape::split_child(tree, node, childnum),
        Reactivity::Fusible => reshape::merge_child(tree, node, childnum, ancestors, bounds),
    }
}
