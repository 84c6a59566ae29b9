//! # Engine Configuration Constants
//!
//! All numeric configuration values for the storage engine, grouped by
//! functional area. Constants that depend on each other are co-located and
//! the relationship documented, with compile-time assertions where a
//! mismatch would be a correctness bug rather than a tuning mistake.
//!
//! ```text
//! TREE_FANOUT (16)
//!       │
//!       ├─> nonleaf FISSIBLE at n_children > TREE_FANOUT
//!       └─> nonleaf FUSIBLE  at n_children * 4 < TREE_FANOUT
//!
//! DEFAULT_NODESIZE (4 MiB)
//!       │
//!       ├─> leaf FISSIBLE when serialized size exceeds it
//!       ├─> leaf FUSIBLE  when serialized size * 4 is below it
//!       ├─> "gorged" nonleaf threshold for triggering a flush
//!       └─> DEFAULT_BASEMENT_NODESIZE (must divide the node into several
//!           partitions, or partial fetch degenerates to full fetch)
//!
//! HEADER_SLOT_SIZE (4096)
//!       │
//!       └─> two alternating slots occupy the first 2 * HEADER_SLOT_SIZE
//!           bytes of the file; block allocation starts after them
//! ```

// ============================================================================
// TREE SHAPE
// ============================================================================

/// Maximum number of children an internal node may carry before it is
/// classified FISSIBLE. The fusion threshold is a quarter of this.
pub const TREE_FANOUT: usize = 16;

/// Target serialized size of a node. Leaves split past this; an internal
/// node over this size with nonempty buffers is "gorged" and gets flushed.
pub const DEFAULT_NODESIZE: u32 = 4 << 20;

/// Target serialized size of one leaf partition (basement). Leaves are
/// rebalanced into partitions of roughly this size when written out, so a
/// point query can fault in one partition instead of the whole leaf.
pub const DEFAULT_BASEMENT_NODESIZE: u32 = 128 << 10;

const _: () = assert!(
    DEFAULT_BASEMENT_NODESIZE < DEFAULT_NODESIZE,
    "a node must hold several basements or partial fetch is pointless"
);

// ============================================================================
// MESSAGE ACCOUNTING
// These mirror the serialized framing so in-memory buffer byte counts track
// the on-disk size they will occupy.
// ============================================================================

/// Fixed per-message overhead in a child buffer: type tag plus MSN plus the
/// two length prefixes.
pub const MSG_OVERHEAD: usize = 1 + 8 + 4 + 4;

// ============================================================================
// ON-DISK LAYOUT
// ============================================================================

/// Version stamp written into every node and header. Bumped on any change
/// to the serialized layout.
pub const LAYOUT_VERSION: u32 = 1;

/// Identifies the build that wrote a node; reserved for upgrade tooling.
pub const BUILD_ID: u32 = 0;

/// Size of one header slot. Two slots alternate by checkpoint parity.
pub const HEADER_SLOT_SIZE: u64 = 4096;

/// Block allocations are rounded up to this alignment.
pub const BLOCK_ALIGN: u64 = 512;

const _: () = assert!(HEADER_SLOT_SIZE % BLOCK_ALIGN == 0);

/// zstd level for partition sub-blocks. Level 3 is the speed/ratio knee for
/// small blocks.
pub const COMPRESSION_LEVEL: i32 = 3;

// ============================================================================
// CACHE
// ============================================================================

/// Default memory budget for the node cache.
pub const DEFAULT_CACHE_BYTES: usize = 64 << 20;

// ============================================================================
// SEQUENTIAL INSERT DETECTION
// ============================================================================

/// Upper bound of the right-edge window used to detect sequential inserts
/// into a basement. The window is `max(1, min(SEQINSERT_WINDOW_MAX,
/// n_entries / SEQINSERT_WINDOW_DIVISOR))` entries from the right edge.
pub const SEQINSERT_WINDOW_MAX: u32 = 32;

/// See [`SEQINSERT_WINDOW_MAX`].
pub const SEQINSERT_WINDOW_DIVISOR: u32 = 16;
