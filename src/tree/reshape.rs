//! # Split and Merge
//!
//! Reshaping reacts to node size, never to individual keys:
//!
//! - **Leaf fission** walks the partitions to the entry where the
//!   serialized prefix first reaches half the total, keeps everything up
//!   to and including it, and moves the rest into a new right sibling.
//!   The pivot between the halves is the last key of the left half.
//! - **Leaf fusion** concatenates two adjacent leaves - unless together
//!   they would exceed three quarters of a node, in which case the pair is
//!   rebalanced (merged, then split evenly) or left alone when both sides
//!   are already substantial.
//! - **Nonleaf fission** halves the child array; the pivot between the
//!   halves is promoted into the parent. **Nonleaf fusion** concatenates
//!   child arrays around the parent's pivot.
//!
//! A split allocates a fresh blocknum for the new sibling; a merge removes
//! the spent sibling from the cache and returns its blocknum to the block
//! table. Both mark every touched node dirty, and both leave MSN
//! watermarks so that no message can be mistaken for already-applied:
//! split halves inherit the original node's watermark, merged nodes take
//! the max of the pair.

use eyre::{ensure, Result};
use tracing::debug;

use super::ancestors::{Ancestors, PivotBounds};
use super::{flush, Brt};
use crate::cache::FetchPlan;
use crate::msg::MIN_MSN;
use crate::node::{Node, Partition, Reactivity};

/// Right-hand content extracted from a leaf at its size midpoint: the
/// partitions, the pivots between them, and the boundary key left behind.
struct LeafSplitOff {
    partitions: Vec<Partition>,
    pivots: Vec<Vec<u8>>,
    pivot_bytes: usize,
    splitk: Vec<u8>,
}

/// Detach the right half of `node`'s entries. The split point is the
/// entry where the serialized prefix reaches half the total, clamped so
/// both sides keep at least one entry.
fn detach_leaf_right_half(node: &mut Node) -> LeafSplitOff {
    debug_assert!(node.is_leaf());
    node.assert_entirely_in_memory();

    let total_bytes: usize = (0..node.n_children())
        .map(|i| node.basement(i).n_bytes())
        .sum();
    let total_entries = node.leaf_num_entries();
    debug_assert!(total_entries >= 2, "cannot split {} entries", total_entries);

    // Global index of the last entry kept on the left.
    let mut split_global = None;
    let mut acc = 0usize;
    let mut seen = 0usize;
    'outer: for i in 0..node.n_children() {
        for j in 0..node.basement(i).len() {
            acc += node.basement(i).fetch(j).expect("in range").disksize();
            if acc * 2 >= total_bytes {
                split_global = Some(seen + j);
                break 'outer;
            }
        }
        seen += node.basement(i).len();
    }
    let split_global = split_global
        .unwrap_or_default()
        .min(total_entries.saturating_sub(2));

    // Map the global index back to (basement, entry).
    let mut remaining = split_global;
    let mut split_node = 0;
    for i in 0..node.n_children() {
        let len = node.basement(i).len();
        if remaining < len {
            split_node = i;
            break;
        }
        remaining -= len;
    }
    let split_at = remaining;

    let tail = node.basement_mut(split_node).split_off(split_at + 1);
    let mut partitions = vec![Partition::leaf(tail)];
    partitions.extend(node.partitions.drain(split_node + 1..));
    let pivots: Vec<Vec<u8>> = node.pivots.drain(split_node..).collect();
    let pivot_bytes: usize = pivots.iter().map(|p| p.len()).sum();
    node.total_pivot_bytes -= pivot_bytes;

    let left_tail = node.basement(split_node);
    let splitk = left_tail
        .fetch(left_tail.len() - 1)
        .expect("left half keeps at least one entry")
        .key()
        .to_vec();

    for i in 0..node.n_children() {
        node.refresh_leaf_estimates(i);
    }
    node.dirty = true;

    LeafSplitOff {
        partitions,
        pivots,
        pivot_bytes,
        splitk,
    }
}

/// Split a leaf, producing the new right sibling and the pivot key.
fn split_leaf(node: &mut Node, new_blocknum: u64) -> (Node, Vec<u8>) {
    let right = detach_leaf_right_half(node);

    let mut b = Node::new_empty(new_blocknum, 0, 0, node.nodesize, node.flags);
    b.partitions = right.partitions;
    b.pivots = right.pivots;
    b.total_pivot_bytes = right.pivot_bytes;
    b.max_msn_applied_in_memory = node.max_msn_applied_in_memory;
    b.max_msn_applied_on_disk = MIN_MSN;
    for i in 0..b.n_children() {
        b.refresh_leaf_estimates(i);
    }
    (b, right.splitk)
}

/// Split an internal node's fanout in half; the pivot between the halves
/// moves up to the caller.
fn split_nonleaf(node: &mut Node, new_blocknum: u64) -> (Node, Vec<u8>) {
    debug_assert!(node.height > 0);
    debug_assert!(node.n_children() >= 2);
    node.assert_entirely_in_memory();

    let n_a = node.n_children() / 2;
    let splitk = node.pivots.remove(n_a - 1);
    node.total_pivot_bytes -= splitk.len();

    let b_pivots: Vec<Vec<u8>> = node.pivots.drain(n_a - 1..).collect();
    let b_pivot_bytes: usize = b_pivots.iter().map(|p| p.len()).sum();
    node.total_pivot_bytes -= b_pivot_bytes;
    let b_partitions: Vec<Partition> = node.partitions.drain(n_a..).collect();

    let mut b = Node::new_empty(new_blocknum, node.height, 0, node.nodesize, node.flags);
    b.partitions = b_partitions;
    b.pivots = b_pivots;
    b.total_pivot_bytes = b_pivot_bytes;
    b.max_msn_applied_in_memory = node.max_msn_applied_in_memory;
    node.dirty = true;
    (b, splitk)
}

/// Split child `childnum` of `parent` in two, wiring the new sibling and
/// pivot into the parent. The child's buffer must already be empty.
pub(crate) fn split_child(tree: &Brt, parent: &mut Node, childnum: usize) -> Result<()> {
    debug_assert!(parent.height > 0);
    ensure!(
        parent.buffer(childnum).is_empty(),
        "splitting child {childnum} with a nonempty buffer"
    );

    let child_blocknum = parent.partitions[childnum].child_blocknum;
    let child_guard = tree.cache.pin(child_blocknum, &FetchPlan::All)?;
    let mut child = child_guard.write();

    let new_blocknum = tree.node_store.new_blocknum();
    let (b_node, splitk) = if child.is_leaf() {
        split_leaf(&mut child, new_blocknum)
    } else {
        split_nonleaf(&mut child, new_blocknum)
    };
    debug!(
        parent = parent.blocknum,
        child = child_blocknum,
        sibling = new_blocknum,
        height = child.height,
        "split child"
    );

    let a_est = child.aggregate_estimates();
    let b_est = b_node.aggregate_estimates();
    let b_guard = tree.cache.insert_new(b_node);

    parent.partitions.insert(childnum + 1, Partition::internal(new_blocknum));
    parent.total_pivot_bytes += splitk.len();
    parent.pivots.insert(childnum, splitk);
    parent.partitions[childnum].estimates = a_est;
    parent.partitions[childnum + 1].estimates = b_est;
    parent.dirty = true;

    drop(child);
    drop(child_guard);
    drop(b_guard);
    Ok(())
}

/// Concatenate leaf `b` onto leaf `a`, dropping `a`'s trailing basement if
/// it is empty (there is no key to pivot on) and synthesizing the boundary
/// pivot from `a`'s rightmost entry otherwise.
fn merge_leaf_nodes(a: &mut Node, b: &mut Node) {
    debug_assert!(a.is_leaf() && b.is_leaf());
    a.assert_entirely_in_memory();
    b.assert_entirely_in_memory();

    let a_tail = a.n_children() - 1;
    let a_has_tail = !a.basement(a_tail).is_empty();
    if a_has_tail {
        let tail = a.basement(a_tail);
        let boundary = tail.fetch(tail.len() - 1).expect("tail nonempty").key().to_vec();
        a.total_pivot_bytes += boundary.len();
        a.pivots.push(boundary);
    } else {
        // No entries means no pivot key; the basement vanishes and a's
        // last existing pivot becomes the boundary.
        a.partitions.pop();
    }

    a.total_pivot_bytes += b.total_pivot_bytes;
    a.pivots.append(&mut b.pivots);
    a.partitions.append(&mut b.partitions);

    b.total_pivot_bytes = 0;
    a.dirty = true;
    b.dirty = true;
}

/// Merge then re-split evenly, refilling `b` in place. Returns the new
/// boundary pivot.
fn rebalance_leaf_nodes(a: &mut Node, b: &mut Node) -> Vec<u8> {
    merge_leaf_nodes(a, b);
    let right = detach_leaf_right_half(a);
    b.partitions = right.partitions;
    b.pivots = right.pivots;
    b.total_pivot_bytes = right.pivot_bytes;
    for i in 0..b.n_children() {
        b.refresh_leaf_estimates(i);
    }
    b.dirty = true;
    right.splitk
}

enum MergeOutcome {
    Merged,
    Rebalanced(Vec<u8>),
    LeftAlone,
}

fn maybe_merge_leaves(a: &mut Node, b: &mut Node) -> MergeOutcome {
    let nodesize = a.nodesize as usize;
    let sizea = a.serialized_size_estimate();
    let sizeb = b.serialized_size_estimate();
    if (sizea + sizeb) * 4 > nodesize * 3 {
        // Together too big to merge.
        if sizea * 4 > nodesize && sizeb * 4 > nodesize {
            // Both substantial: nothing to fix.
            MergeOutcome::LeftAlone
        } else if a.leaf_num_entries() + b.leaf_num_entries() < 2 {
            // A single oversized entry cannot be redistributed.
            merge_leaf_nodes(a, b);
            MergeOutcome::Merged
        } else {
            MergeOutcome::Rebalanced(rebalance_leaf_nodes(a, b))
        }
    } else {
        merge_leaf_nodes(a, b);
        MergeOutcome::Merged
    }
}

fn merge_nonleaf_nodes(a: &mut Node, b: &mut Node, parent_splitk: Vec<u8>) {
    debug_assert!(a.height > 0 && b.height > 0);
    a.assert_entirely_in_memory();
    b.assert_entirely_in_memory();

    a.total_pivot_bytes += parent_splitk.len() + b.total_pivot_bytes;
    a.pivots.push(parent_splitk);
    a.pivots.append(&mut b.pivots);
    a.partitions.append(&mut b.partitions);
    b.total_pivot_bytes = 0;
    a.dirty = true;
    b.dirty = true;
}

/// Try to fuse child `childnum` of `parent` with a neighbor. Both buffers
/// are flushed first so no message is stranded above the fusion.
pub(crate) fn merge_child(
    tree: &Brt,
    parent: &mut Node,
    childnum: usize,
    ancestors: Option<&Ancestors<'_>>,
    bounds: &PivotBounds,
) -> Result<()> {
    if parent.n_children() < 2 {
        return Ok(()); // no sibling; merged as well as it can be
    }
    debug_assert!(parent.height > 0);

    let (cn_a, cn_b) = if childnum > 0 {
        (childnum - 1, childnum)
    } else {
        (childnum, childnum + 1)
    };

    if !parent.buffer(cn_a).is_empty() {
        let next_bounds = bounds.next(parent, cn_a);
        flush::flush_this_child(tree, parent, cn_a, false, false, ancestors, &next_bounds)?;
    }
    if !parent.buffer(cn_b).is_empty() {
        let next_bounds = bounds.next(parent, cn_b);
        flush::flush_this_child(tree, parent, cn_b, false, false, ancestors, &next_bounds)?;
    }

    let a_blocknum = parent.partitions[cn_a].child_blocknum;
    let b_blocknum = parent.partitions[cn_b].child_blocknum;
    let a_guard = tree.cache.pin(a_blocknum, &FetchPlan::All)?;
    let b_guard = tree.cache.pin(b_blocknum, &FetchPlan::All)?;
    let mut a = a_guard.write();
    let mut b = b_guard.write();
    ensure!(
        a.height == b.height,
        "merging nodes of different heights ({} vs {})",
        a.height,
        b.height
    );

    let msn_max = a
        .max_msn_applied_in_memory
        .max(b.max_msn_applied_in_memory);
    let parent_splitk = parent.pivots[cn_a].clone();

    let outcome = if a.is_leaf() {
        maybe_merge_leaves(&mut a, &mut b)
    } else {
        merge_nonleaf_nodes(&mut a, &mut b, parent_splitk);
        MergeOutcome::Merged
    };

    match outcome {
        MergeOutcome::Merged => {
            a.max_msn_applied_in_memory = msn_max;
            debug!(
                parent = parent.blocknum,
                survivor = a_blocknum,
                spent = b_blocknum,
                "merged children"
            );
            let removed_pivot = parent.pivots.remove(cn_a);
            parent.total_pivot_bytes -= removed_pivot.len();
            let spent = parent.partitions.remove(cn_b);
            debug_assert!(matches!(
                &spent.state,
                crate::node::PartitionState::Internal(buf) if buf.is_empty()
            ));
            parent.dirty = true;
            flush::fixup_child_estimates(parent, cn_a, &a, true);

            drop(b);
            b_guard.unpin_and_remove();
            tree.node_store.blocks.lock().free_blocknum(b_blocknum);
        }
        MergeOutcome::Rebalanced(new_splitk) => {
            a.max_msn_applied_in_memory = msn_max;
            b.max_msn_applied_in_memory = msn_max;
            let old = std::mem::replace(&mut parent.pivots[cn_a], new_splitk);
            parent.total_pivot_bytes -= old.len();
            parent.total_pivot_bytes += parent.pivots[cn_a].len();
            parent.dirty = true;
            flush::fixup_child_estimates(parent, cn_a, &a, true);
            flush::fixup_child_estimates(parent, cn_b, &b, true);
        }
        MergeOutcome::LeftAlone => {}
    }
    Ok(())
}

/// Handle root reactivity after an ingress: a fissible root splits beneath
/// a brand-new root one level up; a fusible root has no sibling and stays.
pub(crate) fn maybe_reactive_root(tree: &Brt, root: &mut Node) -> Result<()> {
    match root.reactivity() {
        Reactivity::Stable | Reactivity::Fusible => Ok(()),
        Reactivity::Fissible => {
            let sibling_blocknum = tree.node_store.new_blocknum();
            let (b_node, splitk) = if root.is_leaf() {
                split_leaf(root, sibling_blocknum)
            } else {
                split_nonleaf(root, sibling_blocknum)
            };

            let a_est = root.aggregate_estimates();
            let b_est = b_node.aggregate_estimates();
            let old_root_blocknum = root.blocknum;
            let height = root.height;
            let msn = root.max_msn_applied_in_memory;
            let b_guard = tree.cache.insert_new(b_node);

            let new_root_blocknum = tree.node_store.new_blocknum();
            let mut new_root =
                Node::new_empty(new_root_blocknum, height + 1, 0, root.nodesize, root.flags);
            new_root.partitions.push(Partition::internal(old_root_blocknum));
            new_root.append_child(Partition::internal(sibling_blocknum), Some(splitk));
            new_root.partitions[0].estimates = a_est;
            new_root.partitions[1].estimates = b_est;
            new_root.max_msn_applied_in_memory = msn;
            let root_guard = tree.cache.insert_new(new_root);

            {
                let mut header = tree.header.write();
                header.root_blocknum = new_root_blocknum;
                header.dirty = true;
            }
            debug!(
                old_root = old_root_blocknum,
                new_root = new_root_blocknum,
                sibling = sibling_blocknum,
                height = height + 1,
                "root split"
            );
            drop(b_guard);
            drop(root_guard);
            Ok(())
        }
    }
}
