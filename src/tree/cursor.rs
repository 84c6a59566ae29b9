//! # Cursors
//!
//! A cursor is a positioned reader with a fixed transaction view. Every
//! positioning operation is a bounded search from the root - except the
//! **shortcut**: after a successful read the cursor remembers which leaf
//! basement and entry it landed on, and as long as no write has entered
//! the tree since (the global root-put counter is unchanged), `next` and
//! `prev` advance within that basement directly, skipping the descent.
//!
//! Any write, eviction of the remembered leaf, or basement exhaustion
//! invalidates the shortcut and the cursor falls back to a full search
//! keyed off its current position.

use eyre::Result;

use super::search::{Search, SearchBound, SearchHit};
use super::{Brt, TxnView};
use crate::cache::ScanDirection;
use crate::node::Blocknum;

/// `Some((key, val))` or `None` for "no entry in that direction".
pub type CursorOutcome = Option<(Vec<u8>, Vec<u8>)>;

struct Shortcut {
    leaf_blocknum: Blocknum,
    basement_idx: usize,
    entry_idx: usize,
    root_put_counter: u64,
}

pub struct Cursor<'a> {
    tree: &'a Brt,
    view: TxnView,
    current: Option<(Vec<u8>, Vec<u8>)>,
    shortcut: Option<Shortcut>,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("view", &self.view)
            .field("current", &self.current)
            .field("shortcut", &self.shortcut.is_some())
            .finish()
    }
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(tree: &'a Brt, view: TxnView) -> Self {
        Self {
            tree,
            view,
            current: None,
            shortcut: None,
        }
    }

    pub fn view(&self) -> &TxnView {
        &self.view
    }

    /// The pair the cursor is positioned on, if any.
    pub fn current(&self) -> CursorOutcome {
        self.current.clone()
    }

    pub fn first(&mut self) -> Result<CursorOutcome> {
        self.run(Search::new(ScanDirection::Left, SearchBound::Edge))
    }

    pub fn last(&mut self) -> Result<CursorOutcome> {
        self.run(Search::new(ScanDirection::Right, SearchBound::Edge))
    }

    /// Exact-match positioning; `None` when the key is absent (even if
    /// neighbors exist).
    pub fn set(&mut self, key: &[u8]) -> Result<CursorOutcome> {
        self.run(Search::point_lookup(key))
    }

    /// Position on the first entry `>= key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<CursorOutcome> {
        self.run(Search::new(
            ScanDirection::Left,
            SearchBound::Key {
                key: key.to_vec(),
                inclusive: true,
            },
        ))
    }

    /// Position on the last entry `<= key`.
    pub fn set_range_reverse(&mut self, key: &[u8]) -> Result<CursorOutcome> {
        self.run(Search::new(
            ScanDirection::Right,
            SearchBound::Key {
                key: key.to_vec(),
                inclusive: true,
            },
        ))
    }

    pub fn next(&mut self) -> Result<CursorOutcome> {
        let Some((key, _)) = self.current.clone() else {
            return self.first();
        };
        if let Some(outcome) = self.shortcut_step(ScanDirection::Left) {
            return Ok(outcome);
        }
        self.run(Search::new(
            ScanDirection::Left,
            SearchBound::Key {
                key,
                inclusive: false,
            },
        ))
    }

    pub fn prev(&mut self) -> Result<CursorOutcome> {
        let Some((key, _)) = self.current.clone() else {
            return self.last();
        };
        if let Some(outcome) = self.shortcut_step(ScanDirection::Right) {
            return Ok(outcome);
        }
        self.run(Search::new(
            ScanDirection::Right,
            SearchBound::Key {
                key,
                inclusive: false,
            },
        ))
    }

    /// Delete the entry the cursor is positioned on, under the cursor's
    /// transaction stack.
    pub fn delete_current(&mut self) -> Result<()> {
        let Some((key, _)) = self.current.clone() else {
            return Ok(());
        };
        self.tree.delete(&key, self.view.xids.clone())
    }

    fn run(&mut self, mut search: Search) -> Result<CursorOutcome> {
        let hit = self.tree.search_full(&mut search, &self.view)?;
        Ok(self.remember(hit))
    }

    fn remember(&mut self, hit: Option<SearchHit>) -> CursorOutcome {
        match hit {
            Some(hit) => {
                self.shortcut = Some(Shortcut {
                    leaf_blocknum: hit.leaf_blocknum,
                    basement_idx: hit.basement_idx,
                    entry_idx: hit.entry_idx,
                    root_put_counter: self.tree.header.read().root_put_counter,
                });
                self.current = Some((hit.key.clone(), hit.val.clone()));
                Some((hit.key, hit.val))
            }
            None => {
                self.shortcut = None;
                self.current = None;
                None
            }
        }
    }

    /// Advance within the remembered basement without descending. `None`
    /// means the shortcut does not apply and the caller must search.
    fn shortcut_step(&mut self, dir: ScanDirection) -> Option<CursorOutcome> {
        let cmp = self.tree.opts.cmp;
        let (cur_key, _) = self.current.as_ref()?;
        let sc = self.shortcut.as_ref()?;
        if self.tree.header.read().root_put_counter != sc.root_put_counter {
            return None;
        }
        let guard = self.tree.cache.pin_if_cached(sc.leaf_blocknum)?;
        let node = guard.read();
        if !node.is_leaf()
            || sc.basement_idx >= node.n_children()
            || !node.partitions[sc.basement_idx].state.is_available()
        {
            return None;
        }
        let bn = node.basement(sc.basement_idx);
        let le = bn.fetch(sc.entry_idx)?;
        if cmp(le.key(), cur_key) != std::cmp::Ordering::Equal {
            return None;
        }

        let mut idx = sc.entry_idx as isize;
        loop {
            idx += match dir {
                ScanDirection::Left => 1,
                ScanDirection::Right => -1,
            };
            if idx < 0 || idx as usize >= bn.len() {
                // End of this basement; the answer may live in a sibling.
                return None;
            }
            let le = bn.fetch(idx as usize).expect("index in range");
            if let Some(val) = le.visible_value(&self.view) {
                let key = le.key().to_vec();
                let val = val.to_vec();
                let counter = sc.root_put_counter;
                let (leaf_blocknum, basement_idx) = (sc.leaf_blocknum, sc.basement_idx);
                drop(node);
                drop(guard);
                self.shortcut = Some(Shortcut {
                    leaf_blocknum,
                    basement_idx,
                    entry_idx: idx as usize,
                    root_put_counter: counter,
                });
                self.current = Some((key.clone(), val.clone()));
                return Some(Some((key, val)));
            }
        }
    }
}
