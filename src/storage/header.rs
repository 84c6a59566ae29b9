//! # Dictionary Header
//!
//! The header is the root of everything durable: it names the root node's
//! blocknum and the location of the block translation table, and carries
//! the checkpoint counters that decide which of the two on-disk slots is
//! authoritative.
//!
//! ## Dual slots
//!
//! Slot A lives at offset 0, slot B at [`HEADER_SLOT_SIZE`]. A checkpoint
//! writes the slot selected by `checkpoint_count` parity, so the previous
//! header is intact until the new one is fully durable. Open-time recovery
//! reads both, discards any with a bad checksum, and takes the survivor
//! with the higher count.
//!
//! ## Panic poisoning
//!
//! A non-recoverable error records its code and message here; every
//! subsequent operation fails with them and checkpoints refuse to write.
//! Only the code is persisted - the message is advisory.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, eyre, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::FileStore;
use crate::config::{HEADER_SLOT_SIZE, LAYOUT_VERSION};
use crate::msg::{Msn, TxnId};
use crate::node::Blocknum;

const HEADER_MAGIC: &[u8; 8] = b"BrwHead1";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeaderDisk {
    magic: [u8; 8],
    layout_version: U32,
    build_id: U32,
    nodesize: U32,
    basement_nodesize: U32,
    flags: U32,
    _pad: [u8; 4],
    checkpoint_count: U64,
    checkpoint_lsn: U64,
    root_blocknum: U64,
    create_txnid: U64,
    dict_id: U64,
    highest_msn: U64,
    translation_offset: U64,
    translation_size: U32,
    panic_code: U32,
    _reserved: [u8; 24],
    crc: U64,
}

const HEADER_DISK_SIZE: usize = std::mem::size_of::<HeaderDisk>();
const _: () = assert!(HEADER_DISK_SIZE == 128);
const _: () = assert!(HEADER_DISK_SIZE as u64 <= HEADER_SLOT_SIZE);

/// In-memory header state for one dictionary.
#[derive(Debug, Clone)]
pub struct Header {
    pub layout_version: u32,
    pub nodesize: u32,
    pub basement_nodesize: u32,
    pub flags: u32,
    pub checkpoint_count: u64,
    pub checkpoint_lsn: u64,
    pub root_blocknum: Blocknum,
    pub create_txnid: TxnId,
    pub dict_id: u64,
    pub highest_msn: Msn,
    /// Set by any write since the last checkpoint.
    pub dirty: bool,
    /// Fatal-error poisoning; see the module docs.
    pub panic: Option<(i32, String)>,
    /// Bumped on every root ingress; invalidates cursor shortcuts. Not
    /// persisted.
    pub root_put_counter: u64,
}

impl Header {
    pub fn new(nodesize: u32, basement_nodesize: u32, flags: u32, dict_id: u64) -> Self {
        Self {
            layout_version: LAYOUT_VERSION,
            nodesize,
            basement_nodesize,
            flags,
            checkpoint_count: 0,
            checkpoint_lsn: 0,
            root_blocknum: 0,
            create_txnid: 0,
            dict_id,
            highest_msn: 0,
            dirty: true,
            panic: None,
            root_put_counter: 0,
        }
    }

    /// The slot the next checkpoint writes to.
    pub fn next_slot_offset(&self) -> u64 {
        (self.checkpoint_count % 2) * HEADER_SLOT_SIZE
    }
}

/// Serialize and write `header` into its parity slot. Does not sync.
pub fn write_header_slot(
    store: &FileStore,
    header: &Header,
    translation_offset: u64,
    translation_size: u32,
) -> Result<()> {
    let mut disk = HeaderDisk {
        magic: *HEADER_MAGIC,
        layout_version: U32::new(header.layout_version),
        build_id: U32::new(crate::config::BUILD_ID),
        nodesize: U32::new(header.nodesize),
        basement_nodesize: U32::new(header.basement_nodesize),
        flags: U32::new(header.flags),
        _pad: [0; 4],
        checkpoint_count: U64::new(header.checkpoint_count),
        checkpoint_lsn: U64::new(header.checkpoint_lsn),
        root_blocknum: U64::new(header.root_blocknum),
        create_txnid: U64::new(header.create_txnid),
        dict_id: U64::new(header.dict_id),
        highest_msn: U64::new(header.highest_msn),
        translation_offset: U64::new(translation_offset),
        translation_size: U32::new(translation_size),
        panic_code: U32::new(header.panic.as_ref().map(|(c, _)| *c as u32).unwrap_or(0)),
        _reserved: [0; 24],
        crc: U64::new(0),
    };
    let crc = CRC64.checksum(&disk.as_bytes()[..HEADER_DISK_SIZE - 8]);
    disk.crc = U64::new(crc);
    store.write_at(header.next_slot_offset(), disk.as_bytes())
}

fn parse_slot(bytes: &[u8]) -> Result<(Header, u64, u32)> {
    let disk = HeaderDisk::ref_from_bytes(&bytes[..HEADER_DISK_SIZE])
        .map_err(|e| eyre!("failed to parse header slot: {e:?}"))?;
    if &disk.magic != HEADER_MAGIC {
        bail!("bad header magic");
    }
    if CRC64.checksum(&bytes[..HEADER_DISK_SIZE - 8]) != disk.crc.get() {
        bail!("header slot checksum mismatch");
    }
    if disk.layout_version.get() != LAYOUT_VERSION {
        bail!(
            "unsupported header layout version {} (expected {})",
            disk.layout_version.get(),
            LAYOUT_VERSION
        );
    }
    let panic_code = disk.panic_code.get() as i32;
    let header = Header {
        layout_version: disk.layout_version.get(),
        nodesize: disk.nodesize.get(),
        basement_nodesize: disk.basement_nodesize.get(),
        flags: disk.flags.get(),
        checkpoint_count: disk.checkpoint_count.get(),
        checkpoint_lsn: disk.checkpoint_lsn.get(),
        root_blocknum: disk.root_blocknum.get(),
        create_txnid: disk.create_txnid.get(),
        dict_id: disk.dict_id.get(),
        highest_msn: disk.highest_msn.get(),
        dirty: false,
        panic: (panic_code != 0).then(|| (panic_code, "recorded by a previous run".to_string())),
        root_put_counter: 0,
    };
    Ok((
        header,
        disk.translation_offset.get(),
        disk.translation_size.get(),
    ))
}

/// Read both header slots and return the valid one with the highest
/// checkpoint count, plus the location of its block translation table.
pub fn load_newest_header(store: &FileStore) -> Result<(Header, u64, u32)> {
    let mut best: Option<(Header, u64, u32)> = None;
    for slot in 0..2u64 {
        let bytes = match store.read_at(slot * HEADER_SLOT_SIZE, HEADER_DISK_SIZE) {
            Ok(b) => b,
            Err(_) => continue,
        };
        match parse_slot(&bytes) {
            Ok(parsed) => {
                let newer = best
                    .as_ref()
                    .map(|(h, _, _)| parsed.0.checkpoint_count > h.checkpoint_count)
                    .unwrap_or(true);
                if newer {
                    best = Some(parsed);
                }
            }
            Err(_) => continue,
        }
    }
    best.ok_or_else(|| eyre!("no valid header slot in {}", store.path().display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(&dir.path().join("h.brw")).unwrap();
        (dir, store)
    }

    #[test]
    fn roundtrip_through_slot() {
        let (_dir, store) = fixture();
        let mut h = Header::new(1 << 20, 1 << 16, 0, 42);
        h.checkpoint_count = 3;
        h.checkpoint_lsn = 77;
        h.root_blocknum = 9;
        h.highest_msn = 123;
        write_header_slot(&store, &h, 8192, 640).unwrap();

        let (loaded, toff, tsize) = load_newest_header(&store).unwrap();
        assert_eq!(loaded.checkpoint_count, 3);
        assert_eq!(loaded.checkpoint_lsn, 77);
        assert_eq!(loaded.root_blocknum, 9);
        assert_eq!(loaded.highest_msn, 123);
        assert_eq!(loaded.dict_id, 42);
        assert_eq!((toff, tsize), (8192, 640));
        assert!(!loaded.dirty);
    }

    #[test]
    fn newest_valid_slot_wins() {
        let (_dir, store) = fixture();
        let mut h = Header::new(4096, 1024, 0, 1);

        h.checkpoint_count = 4; // parity 0 -> slot A
        write_header_slot(&store, &h, 100, 10).unwrap();
        h.checkpoint_count = 5; // parity 1 -> slot B
        write_header_slot(&store, &h, 200, 20).unwrap();

        let (loaded, toff, _) = load_newest_header(&store).unwrap();
        assert_eq!(loaded.checkpoint_count, 5);
        assert_eq!(toff, 200);

        // Corrupt the newer slot: recovery falls back to the older one.
        store.write_at(HEADER_SLOT_SIZE + 16, &[0xFF; 8]).unwrap();
        let (loaded, toff, _) = load_newest_header(&store).unwrap();
        assert_eq!(loaded.checkpoint_count, 4);
        assert_eq!(toff, 100);
    }

    #[test]
    fn missing_header_is_an_error() {
        let (_dir, store) = fixture();
        assert!(load_newest_header(&store).is_err());
    }
}
