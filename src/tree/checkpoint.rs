//! # Fuzzy Checkpoints
//!
//! A checkpoint makes the current tree durable without stopping writes
//! for long:
//!
//! 1. **Begin**: the header clones itself into an in-progress twin, its
//!    dirty bit clears (later writes set it again), and the block table
//!    starts deferring frees - locations the previous checkpoint still
//!    references must survive until the new header is durable.
//! 2. **Fuzzy phase**: every dirty node is serialized and written to a
//!    *shadow* location (copy-on-write reallocation), then marked clean.
//!    The old locations stay readable the whole time.
//! 3. **End**: the block translation is written as its own block, the
//!    alternate header slot is published pointing at it, the file is
//!    synced, and only then are the superseded locations recycled.
//!
//! A crash anywhere before the final sync leaves the previous header slot
//! intact and every location it references untouched; recovery simply
//! reads the old checkpoint.

use eyre::{ensure, Result};
use tracing::{debug, info};

use super::Brt;
use crate::storage::write_header_slot;

pub(crate) fn run_checkpoint(tree: &Brt) -> Result<()> {
    // Begin: snapshot the header, start deferring block frees.
    {
        let mut header = tree.header.write();
        ensure!(header.panic.is_none(), "checkpoint refused: engine poisoned");
        let mut twin = tree.checkpoint_twin.lock();
        ensure!(twin.is_none(), "checkpoint already in progress");
        *twin = Some(header.clone());
        header.dirty = false;
        tree.node_store.blocks.lock().begin_checkpoint();
        debug!(count = header.checkpoint_count, "checkpoint begin");
    }

    // Fuzzy phase: shadow-write every dirty node.
    let flushed = match tree.cache.flush_dirty(true) {
        Ok(n) => n,
        Err(err) => {
            tree.node_store.blocks.lock().end_checkpoint();
            *tree.checkpoint_twin.lock() = None;
            return Err(err);
        }
    };

    // End: persist the translation, publish the header, release shadows.
    let translation_loc = {
        let mut blocks = tree.node_store.blocks.lock();
        let size = blocks.serialized_size();
        let loc = blocks.alloc_region(size);
        let bytes = blocks.serialize();
        debug_assert_eq!(bytes.len() as u32, size);
        tree.node_store.store.write_at(loc.offset, &bytes)?;
        loc
    };
    {
        let mut header = tree.header.write();
        header.checkpoint_count += 1;
        header.checkpoint_lsn += 1;
        write_header_slot(
            &tree.node_store.store,
            &header,
            translation_loc.offset,
            translation_loc.size,
        )?;
        tree.node_store.store.sync()?;
        info!(
            count = header.checkpoint_count,
            lsn = header.checkpoint_lsn,
            flushed,
            "checkpoint complete"
        );
    }
    {
        let mut blocks = tree.node_store.blocks.lock();
        blocks.end_checkpoint();
        let mut prev = tree.prev_translation.lock();
        if let Some(old) = prev.take() {
            blocks.release(old);
        }
        *prev = Some(translation_loc);
    }
    *tree.checkpoint_twin.lock() = None;
    Ok(())
}
