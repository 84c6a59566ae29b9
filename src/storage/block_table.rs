//! # Block Table
//!
//! Maps logical block numbers to file locations. Node writes are
//! copy-on-write: a rewrite allocates a fresh location and releases the old
//! one, so a crash mid-write never damages the previous image.
//!
//! ## Checkpoint interaction
//!
//! While a checkpoint is in progress every released location is deferred
//! instead of recycled: the checkpoint began from a translation that may
//! still reference it, and the old header slot keeps that translation
//! reachable until the new slot is published. `end_checkpoint` moves the
//! deferred locations onto the free list.
//!
//! ## Allocation
//!
//! First-fit over the free list, falling back to bumping the end of the
//! data area. Locations are aligned to [`BLOCK_ALIGN`]. Reclaiming the file
//! tail (the shrinker) is a separate concern handled outside this crate.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::config::BLOCK_ALIGN;
use crate::node::Blocknum;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

fn aligned_capacity(size: u32) -> u32 {
    size.max(1).next_multiple_of(BLOCK_ALIGN as u32)
}

/// One allocated region of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLoc {
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Default)]
struct CheckpointState {
    deferred_free: Vec<BlockLoc>,
}

#[derive(Debug)]
pub struct BlockTable {
    next_blocknum: Blocknum,
    translation: HashMap<Blocknum, BlockLoc>,
    free_list: Vec<BlockLoc>,
    /// Offsets the last *durable* checkpoint's translation references.
    /// Releasing one of these parks it in `pending_free` until the next
    /// checkpoint lands; recycling it earlier would let a new write
    /// destroy a block that crash recovery still needs.
    checkpointed_offsets: hashbrown::HashSet<u64>,
    pending_free: Vec<BlockLoc>,
    next_offset: u64,
    checkpoint: Option<CheckpointState>,
}

impl BlockTable {
    pub fn new(data_start: u64) -> Self {
        Self {
            next_blocknum: 1,
            translation: HashMap::new(),
            free_list: Vec::new(),
            checkpointed_offsets: hashbrown::HashSet::new(),
            pending_free: Vec::new(),
            next_offset: data_start,
            checkpoint: None,
        }
    }

    pub fn allocate_blocknum(&mut self) -> Blocknum {
        let bn = self.next_blocknum;
        self.next_blocknum += 1;
        bn
    }

    pub fn translate(&self, bn: Blocknum) -> Option<BlockLoc> {
        self.translation.get(&bn).copied()
    }

    pub fn is_allocated(&self, bn: Blocknum) -> bool {
        bn != 0 && bn < self.next_blocknum
    }

    /// Point `bn` at a fresh location big enough for `size` bytes,
    /// releasing whatever it pointed at before.
    pub fn realloc(&mut self, bn: Blocknum, size: u32) -> BlockLoc {
        debug_assert!(self.is_allocated(bn));
        if let Some(old) = self.translation.remove(&bn) {
            self.release(old);
        }
        let loc = self.alloc_region(size);
        self.translation.insert(bn, loc);
        loc
    }

    /// Drop `bn` entirely (a merged-away node).
    pub fn free_blocknum(&mut self, bn: Blocknum) {
        if let Some(old) = self.translation.remove(&bn) {
            self.release(old);
        }
    }

    /// Allocate an anonymous region (the checkpoint's translation block).
    /// The returned size is the exact request; capacity is tracked in
    /// aligned units. No splitting - a larger free region absorbed by a
    /// smaller request keeps its surplus until the file is rebuilt.
    pub fn alloc_region(&mut self, size: u32) -> BlockLoc {
        let needed = aligned_capacity(size);
        if let Some(idx) = self.free_list.iter().position(|l| l.size >= needed) {
            let region = self.free_list.swap_remove(idx);
            return BlockLoc {
                offset: region.offset,
                size,
            };
        }
        let offset = self.next_offset;
        self.next_offset += needed as u64;
        BlockLoc { offset, size }
    }

    /// Release a region allocated with [`alloc_region`] or
    /// [`realloc`](Self::realloc).
    pub fn release(&mut self, loc: BlockLoc) {
        let freed = BlockLoc {
            offset: loc.offset,
            size: aligned_capacity(loc.size),
        };
        if let Some(cp) = &mut self.checkpoint {
            cp.deferred_free.push(freed);
        } else if self.checkpointed_offsets.contains(&freed.offset) {
            self.pending_free.push(freed);
        } else {
            self.free_list.push(freed);
        }
    }

    /// End of the data the table currently addresses.
    pub fn data_end(&self) -> u64 {
        self.next_offset
    }

    pub fn checkpoint_in_progress(&self) -> bool {
        self.checkpoint.is_some()
    }

    /// Start deferring releases: the in-flight checkpoint may still read
    /// locations the live translation has moved away from.
    pub fn begin_checkpoint(&mut self) {
        debug_assert!(self.checkpoint.is_none());
        self.checkpoint = Some(CheckpointState::default());
    }

    /// The new header slot is durable: everything the superseded
    /// checkpoint was protecting becomes recyclable, and the protected
    /// set resets to what the new translation references.
    pub fn end_checkpoint(&mut self) {
        if let Some(cp) = self.checkpoint.take() {
            self.free_list.extend(cp.deferred_free);
        }
        self.free_list.append(&mut self.pending_free);
        self.checkpointed_offsets = self.translation.values().map(|l| l.offset).collect();
    }

    /// Exact size [`serialize`](Self::serialize) will produce. The
    /// checkpoint allocates the translation block *before* serializing so
    /// the serialized `next_offset` covers the block's own region.
    pub fn serialized_size(&self) -> u32 {
        (20 + self.translation.len() * 20 + 8) as u32
    }

    /// Serialized form written as a block at checkpoint time.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.next_blocknum.to_le_bytes());
        out.extend_from_slice(&self.next_offset.to_le_bytes());
        out.extend_from_slice(&(self.translation.len() as u32).to_le_bytes());
        let mut entries: Vec<_> = self.translation.iter().collect();
        entries.sort_by_key(|(bn, _)| **bn);
        for (bn, loc) in entries {
            out.extend_from_slice(&bn.to_le_bytes());
            out.extend_from_slice(&loc.offset.to_le_bytes());
            out.extend_from_slice(&loc.size.to_le_bytes());
        }
        let crc = CRC64.checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 28, "translation block too small");
        let (body, trailer) = bytes.split_at(bytes.len() - 8);
        let stored = u64::from_le_bytes(trailer.try_into().unwrap());
        ensure!(
            CRC64.checksum(body) == stored,
            "translation block checksum mismatch"
        );

        let next_blocknum = u64::from_le_bytes(body[0..8].try_into().unwrap());
        let next_offset = u64::from_le_bytes(body[8..16].try_into().unwrap());
        let count = u32::from_le_bytes(body[16..20].try_into().unwrap()) as usize;
        ensure!(
            body.len() == 20 + count * 20,
            "translation block length mismatch"
        );

        let mut translation = HashMap::with_capacity(count);
        for i in 0..count {
            let base = 20 + i * 20;
            let bn = u64::from_le_bytes(body[base..base + 8].try_into().unwrap());
            let offset = u64::from_le_bytes(body[base + 8..base + 16].try_into().unwrap());
            let size = u32::from_le_bytes(body[base + 16..base + 20].try_into().unwrap());
            translation.insert(bn, BlockLoc { offset, size });
        }

        let checkpointed_offsets = translation.values().map(|l| l.offset).collect();
        Ok(Self {
            next_blocknum,
            translation,
            free_list: Vec::new(),
            checkpointed_offsets,
            pending_free: Vec::new(),
            next_offset,
            checkpoint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DATA_START;

    #[test]
    fn realloc_moves_blocks() {
        let mut bt = BlockTable::new(DATA_START);
        let bn = bt.allocate_blocknum();
        let first = bt.realloc(bn, 1000);
        let second = bt.realloc(bn, 1000);
        assert_ne!(first.offset, second.offset, "copy-on-write never reuses the live location");
        assert_eq!(bt.translate(bn), Some(second));

        // The first location is free again and gets recycled.
        let other = bt.allocate_blocknum();
        let third = bt.realloc(other, 900);
        assert_eq!(third.offset, first.offset);
    }

    #[test]
    fn checkpoint_defers_reuse() {
        let mut bt = BlockTable::new(DATA_START);
        let bn = bt.allocate_blocknum();
        let first = bt.realloc(bn, 512);

        bt.begin_checkpoint();
        let shadow = bt.realloc(bn, 512);
        assert_ne!(shadow.offset, first.offset);

        // While the checkpoint holds the old translation, the old location
        // must not be handed out.
        let other = bt.allocate_blocknum();
        let fresh = bt.realloc(other, 512);
        assert_ne!(fresh.offset, first.offset);

        bt.end_checkpoint();
        let recycled = bt.alloc_region(512);
        assert_eq!(recycled.offset, first.offset);
    }

    #[test]
    fn checkpointed_locations_survive_until_next_checkpoint() {
        let mut bt = BlockTable::new(DATA_START);
        let bn = bt.allocate_blocknum();
        let durable = bt.realloc(bn, 512);

        // Make `durable` part of a completed checkpoint.
        bt.begin_checkpoint();
        bt.end_checkpoint();

        // Rewriting the block between checkpoints releases the durable
        // location, but it must not be recycled: crash recovery reads it.
        let shadow = bt.realloc(bn, 512);
        assert_ne!(shadow.offset, durable.offset);
        let other = bt.allocate_blocknum();
        let fresh = bt.realloc(other, 512);
        assert_ne!(fresh.offset, durable.offset);

        // Once the next checkpoint lands, the old location recycles.
        bt.begin_checkpoint();
        bt.end_checkpoint();
        let recycled = bt.alloc_region(512);
        assert_eq!(recycled.offset, durable.offset);
    }

    #[test]
    fn serialize_roundtrip() {
        let mut bt = BlockTable::new(DATA_START);
        for _ in 0..5 {
            let bn = bt.allocate_blocknum();
            bt.realloc(bn, 700);
        }
        let bytes = bt.serialize();
        let loaded = BlockTable::deserialize(&bytes).unwrap();
        assert_eq!(loaded.next_blocknum, bt.next_blocknum);
        assert_eq!(loaded.next_offset, bt.next_offset);
        for bn in 1..6 {
            assert_eq!(loaded.translate(bn), bt.translate(bn));
        }

        let mut corrupted = bt.serialize();
        let n = corrupted.len();
        corrupted[n / 2] ^= 1;
        assert!(BlockTable::deserialize(&corrupted).is_err());
    }
}
