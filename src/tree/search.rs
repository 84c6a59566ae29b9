//! # Bounded Descent
//!
//! All reads go through one search routine: a root-to-leaf descent with
//! non-blocking pins. Any pin that would need I/O stages the work and
//! answers try-again; the whole descent unwinds (RAII pin guards drop in
//! LIFO order) and restarts from the root.
//!
//! ## Forward progress
//!
//! Before moving from a child that answered "not found" to its sibling,
//! the search saves the pivot separating them. A retried descent skips
//! children on the already-searched side of that bound, so every retry
//! strictly shrinks the unsearched region and the loop terminates.
//!
//! ## Plan/search agreement
//!
//! The fetch plan handed to each pin carries the same bound, direction,
//! and pivot bound the search itself uses, and both sides resolve the
//! target child with [`which_child_to_search`]. The partition a pin
//! materializes is therefore exactly the partition the search reads.

use eyre::Result;
use tracing::trace;

use super::ancestors::{apply_ancestors, Ancestors, PivotBounds};
use super::{Brt, TxnView};
use crate::cache::{FetchPlan, PinOutcome, ScanDirection, SubsetHint};
use crate::leaf::KeyCmp;
use crate::node::{Blocknum, Node};

/// What the search is looking for along its scan direction.
#[derive(Debug, Clone)]
pub(crate) enum SearchBound {
    /// No bound: the first (or last) visible entry.
    Edge,
    /// The first entry `>= key` (left scans) or last `<= key` (right
    /// scans); exclusive when `inclusive` is false.
    Key { key: Vec<u8>, inclusive: bool },
}

#[derive(Debug)]
pub(crate) struct Search {
    pub dir: ScanDirection,
    pub bound: SearchBound,
    /// Grows monotonically across try-again retries; see module docs.
    pub pivot_bound: Option<Vec<u8>>,
    /// When set, a candidate whose key differs is rejected (point
    /// lookups): the search stops instead of scanning onward.
    pub reject_unless_eq: Option<Vec<u8>>,
}

impl Search {
    pub fn new(dir: ScanDirection, bound: SearchBound) -> Self {
        Self {
            dir,
            bound,
            pivot_bound: None,
            reject_unless_eq: None,
        }
    }

    pub fn point_lookup(key: &[u8]) -> Self {
        Self {
            dir: ScanDirection::Left,
            bound: SearchBound::Key {
                key: key.to_vec(),
                inclusive: true,
            },
            pivot_bound: None,
            reject_unless_eq: Some(key.to_vec()),
        }
    }

    fn fetch_plan(&self) -> FetchPlan {
        let (bound, inclusive) = match &self.bound {
            SearchBound::Edge => (None, true),
            SearchBound::Key { key, inclusive } => (Some(key.clone()), *inclusive),
        };
        FetchPlan::Subset(SubsetHint {
            bound,
            bound_inclusive: inclusive,
            dir: self.dir,
            pivot_bound: self.pivot_bound.clone(),
        })
    }

    /// Could the subtree whose upper (left scans) or lower (right scans)
    /// pivot is `pivot` contain a match?
    fn pivot_satisfies(&self, pivot: &[u8], cmp: KeyCmp) -> bool {
        use std::cmp::Ordering::*;
        match (&self.bound, self.dir) {
            (SearchBound::Edge, _) => true,
            (SearchBound::Key { key, inclusive }, ScanDirection::Left) => {
                match cmp(pivot, key) {
                    Greater => true,
                    Equal => *inclusive,
                    Less => false,
                }
            }
            (SearchBound::Key { key, .. }, ScanDirection::Right) => {
                // Child covers keys strictly above its lower pivot.
                cmp(pivot, key) == Less
            }
        }
    }

    /// Has the region guarded by `pivot` already been searched by an
    /// earlier attempt?
    fn pivot_is_unsearched(&self, pivot: &[u8], cmp: KeyCmp) -> bool {
        use std::cmp::Ordering::*;
        match &self.pivot_bound {
            None => true,
            Some(bound) => match self.dir {
                ScanDirection::Left => cmp(pivot, bound) == Greater,
                ScanDirection::Right => cmp(pivot, bound) == Less,
            },
        }
    }

    /// Remember that everything up to (or from) `pivot` has been covered.
    fn save_bound(&mut self, node: &Node, child_searched: usize) {
        let p = match self.dir {
            ScanDirection::Left => child_searched as isize,
            ScanDirection::Right => child_searched as isize - 1,
        };
        if p >= 0 && (p as usize) < node.n_children() - 1 {
            self.pivot_bound = Some(node.pivots[p as usize].clone());
        }
    }
}

/// Resolve which child (or leaf basement) a search reads next. Shared by
/// the fetch-plan side so pins and searches always agree.
pub(crate) fn which_child_to_search(
    node: &Node,
    dir: ScanDirection,
    bound: Option<&[u8]>,
    inclusive: bool,
    pivot_bound: Option<&[u8]>,
    cmp: KeyCmp,
) -> usize {
    let probe = Search {
        dir,
        bound: match bound {
            None => SearchBound::Edge,
            Some(key) => SearchBound::Key {
                key: key.to_vec(),
                inclusive,
            },
        },
        pivot_bound: pivot_bound.map(|p| p.to_vec()),
        reject_unless_eq: None,
    };
    resolve_child(node, &probe, cmp)
}

fn resolve_child(node: &Node, search: &Search, cmp: KeyCmp) -> usize {
    let n = node.n_children();
    for c in 0..n - 1 {
        let child = match search.dir {
            ScanDirection::Left => c,
            ScanDirection::Right => n - 1 - c,
        };
        let p = match search.dir {
            ScanDirection::Left => child,
            ScanDirection::Right => child - 1,
        };
        let pivot = &node.pivots[p];
        if search.pivot_is_unsearched(pivot, cmp) && search.pivot_satisfies(pivot, cmp) {
            return child;
        }
    }
    match search.dir {
        ScanDirection::Left => n - 1,
        ScanDirection::Right => 0,
    }
}

/// Where a successful search landed; feeds the cursor's shortcut.
#[derive(Debug, Clone)]
pub(crate) struct SearchHit {
    pub key: Vec<u8>,
    pub val: Vec<u8>,
    pub leaf_blocknum: Blocknum,
    pub basement_idx: usize,
    pub entry_idx: usize,
}

pub(crate) enum SearchOutcome {
    Found(SearchHit),
    NotFound,
    Rejected,
    Retry,
}

impl Brt {
    /// Run a search to completion, retrying try-again descents. Rejected
    /// lookups surface as `None` like the end of a scan.
    pub(crate) fn search_full(
        &self,
        search: &mut Search,
        view: &TxnView,
    ) -> Result<Option<SearchHit>> {
        loop {
            let root_blocknum = self.header.read().root_blocknum;
            let plan = search.fetch_plan();
            let guard = match self.cache.pin_nonblocking(root_blocknum, &plan)? {
                PinOutcome::TryAgain => continue,
                PinOutcome::Pinned(g) => g,
            };
            let outcome = self.search_node(&guard, search, view, None, &PivotBounds::infinite())?;
            match outcome {
                SearchOutcome::Retry => {
                    trace!("descent lost a pin race; retrying from the root");
                    continue;
                }
                SearchOutcome::Found(hit) => return Ok(Some(hit)),
                SearchOutcome::NotFound | SearchOutcome::Rejected => return Ok(None),
            }
        }
    }

    fn search_node(
        &self,
        guard: &super::TreeNodeGuard<'_>,
        search: &mut Search,
        view: &TxnView,
        ancestors: Option<&Ancestors<'_>>,
        bounds: &PivotBounds,
    ) -> Result<SearchOutcome> {
        if guard.read().is_leaf() {
            return self.search_leaf(guard, search, view, ancestors, bounds);
        }

        let cmp = self.opts.cmp;
        let node = guard.read();
        let mut child = resolve_child(&node, search, cmp);
        loop {
            if !node.partitions[child].state.is_available() {
                // The retry's fetch plan resolves to this child and
                // materializes its buffer.
                return Ok(SearchOutcome::Retry);
            }
            let next_bounds = bounds.next(&node, child);
            let frame = Ancestors {
                node: &*node,
                childnum: child,
                next: ancestors,
            };
            let outcome = self.search_child(&node, child, search, view, &frame, &next_bounds)?;
            match outcome {
                SearchOutcome::NotFound => {
                    search.save_bound(&node, child);
                    match search.dir {
                        ScanDirection::Left => {
                            child += 1;
                            if child >= node.n_children() {
                                return Ok(SearchOutcome::NotFound);
                            }
                        }
                        ScanDirection::Right => {
                            if child == 0 {
                                return Ok(SearchOutcome::NotFound);
                            }
                            child -= 1;
                        }
                    }
                }
                SearchOutcome::Found(hit) => {
                    // A scan will want the next sibling soon; warm its
                    // structure without blocking on it.
                    let next = match search.dir {
                        ScanDirection::Left => child + 1,
                        ScanDirection::Right => child.wrapping_sub(1),
                    };
                    if next < node.n_children() {
                        let _ = self
                            .cache
                            .prefetch(node.partitions[next].child_blocknum, &FetchPlan::Min);
                    }
                    return Ok(SearchOutcome::Found(hit));
                }
                other => return Ok(other),
            }
        }
    }

    fn search_child(
        &self,
        parent: &Node,
        childnum: usize,
        search: &mut Search,
        view: &TxnView,
        frame: &Ancestors<'_>,
        bounds: &PivotBounds,
    ) -> Result<SearchOutcome> {
        let blocknum = parent.partitions[childnum].child_blocknum;
        let plan = search.fetch_plan();
        match self.cache.pin_nonblocking(blocknum, &plan)? {
            PinOutcome::TryAgain => Ok(SearchOutcome::Retry),
            PinOutcome::Pinned(guard) => {
                self.search_node(&guard, search, view, Some(frame), bounds)
            }
        }
    }

    fn search_leaf(
        &self,
        guard: &super::TreeNodeGuard<'_>,
        search: &mut Search,
        view: &TxnView,
        ancestors: Option<&Ancestors<'_>>,
        bounds: &PivotBounds,
    ) -> Result<SearchOutcome> {
        let cmp = self.opts.cmp;
        let mut node = guard.write();
        apply_ancestors(&mut node, ancestors, bounds, cmp, self.opts.update_cb);

        let mut basement_idx = resolve_child(&node, search, cmp);
        loop {
            if !node.partitions[basement_idx].state.is_available() {
                return Ok(SearchOutcome::Retry);
            }
            match search_basement(&node, basement_idx, search, view, cmp) {
                BasementOutcome::Found { entry_idx, key, val } => {
                    return Ok(SearchOutcome::Found(SearchHit {
                        key,
                        val,
                        leaf_blocknum: node.blocknum,
                        basement_idx,
                        entry_idx,
                    }));
                }
                BasementOutcome::Rejected => return Ok(SearchOutcome::Rejected),
                BasementOutcome::NotFound => {
                    search.save_bound(&node, basement_idx);
                    match search.dir {
                        ScanDirection::Left => {
                            basement_idx += 1;
                            if basement_idx >= node.n_children() {
                                return Ok(SearchOutcome::NotFound);
                            }
                        }
                        ScanDirection::Right => {
                            if basement_idx == 0 {
                                return Ok(SearchOutcome::NotFound);
                            }
                            basement_idx -= 1;
                        }
                    }
                }
            }
        }
    }
}

enum BasementOutcome {
    Found {
        entry_idx: usize,
        key: Vec<u8>,
        val: Vec<u8>,
    },
    NotFound,
    Rejected,
}

/// Heaviside search within one basement, skipping entries the reader's
/// view cannot see (provisional deletes, other transactions' writes).
fn search_basement(
    node: &Node,
    basement_idx: usize,
    search: &Search,
    view: &TxnView,
    cmp: KeyCmp,
) -> BasementOutcome {
    let bn = node.basement(basement_idx);
    if bn.is_empty() {
        return BasementOutcome::NotFound;
    }

    let start = match (&search.bound, search.dir) {
        (SearchBound::Edge, ScanDirection::Left) => 0,
        (SearchBound::Edge, ScanDirection::Right) => bn.len() - 1,
        (SearchBound::Key { key, inclusive }, ScanDirection::Left) => {
            let idx = bn.lower_bound(key, cmp, *inclusive);
            if idx >= bn.len() {
                return BasementOutcome::NotFound;
            }
            idx
        }
        (SearchBound::Key { key, inclusive }, ScanDirection::Right) => {
            match bn.upper_bound(key, cmp, *inclusive) {
                Some(idx) => idx,
                None => return BasementOutcome::NotFound,
            }
        }
    };

    let mut idx = start as isize;
    while idx >= 0 && (idx as usize) < bn.len() {
        let le = bn.fetch(idx as usize).expect("index in range");
        if let Some(val) = le.visible_value(view) {
            if let Some(expected) = &search.reject_unless_eq {
                if cmp(le.key(), expected) != std::cmp::Ordering::Equal {
                    return BasementOutcome::Rejected;
                }
            }
            return BasementOutcome::Found {
                entry_idx: idx as usize,
                key: le.key().to_vec(),
                val: val.to_vec(),
            };
        }
        match search.dir {
            ScanDirection::Left => idx += 1,
            ScanDirection::Right => idx -= 1,
        }
    }
    BasementOutcome::NotFound
}
