//! # Node On-Disk Codec
//!
//! A serialized node is laid out so a short prefix read is enough to locate
//! any single partition:
//!
//! ```text
//! +--------------------------+
//! | NodePrefix (56B)         |  magic, versions, shape, blocknum, MSN
//! +--------------------------+
//! | Pivot block              |  n_children-1 length-prefixed keys
//! +--------------------------+
//! | Partition directory      |  n_children * PartitionDirEntry (52B):
//! |                          |  offset/lengths, child blocknum, estimates
//! +--------------------------+
//! | Partition sub-blocks     |  zstd frame + CRC64 of the frame, each
//! |                          |  independently addressable
//! +--------------------------+
//! | Whole-node CRC64 (8B)    |
//! +--------------------------+
//! ```
//!
//! Partitions compress independently so partial fetch can read and verify
//! one sub-block without touching its siblings.
//!
//! ## Leaf re-partitioning
//!
//! Leaves are re-partitioned at serialization time: all entries are
//! flattened and regrouped into basements of roughly
//! `basement_target` serialized bytes, and the node adopts the new
//! partitioning. In-memory mutation never re-partitions, so a long-lived
//! leaf converges to well-sized basements each time it is written.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian; fixed structs go through
//! zerocopy wrappers, variable-length sections through the manual reader
//! and writer below.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, eyre, Result, WrapErr};
use smallvec::SmallVec;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{CompressedBlock, Node, Partition, PartitionState, SubtreeEstimates};
use crate::config::{COMPRESSION_LEVEL, LAYOUT_VERSION};
use crate::leaf::entry::{Committed, LeafEntry, Provisional, ProvisionalOp};
use crate::leaf::Basement;
use crate::msg::{Message, MessageBuffer, MessageType, Xids};

const NODE_MAGIC: &[u8; 8] = b"BrwNode1";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const PREFIX_SIZE: usize = std::mem::size_of::<NodePrefix>();
pub const DIR_ENTRY_SIZE: usize = std::mem::size_of::<PartitionDirEntry>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodePrefix {
    magic: [u8; 8],
    layout_version: U32,
    layout_version_original: U32,
    build_id: U32,
    flags: U32,
    height: U32,
    n_children: U32,
    nodesize: U32,
    _reserved: [u8; 4],
    blocknum: U64,
    max_msn: U64,
}

const _: () = assert!(PREFIX_SIZE == 56);

impl NodePrefix {
    le_accessors! {
        layout_version: u32,
        layout_version_original: u32,
        build_id: u32,
        flags: u32,
        height: u32,
        n_children: u32,
        nodesize: u32,
        blocknum: u64,
        max_msn: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PartitionDirEntry {
    /// Offset of the sub-block relative to the payload area.
    offset: U32,
    /// Length of the zstd frame (the stored sub-block is this plus the
    /// 8-byte frame checksum).
    compressed_len: U32,
    uncompressed_len: U32,
    child_blocknum: U64,
    est_nkeys: U64,
    est_ndata: U64,
    est_dsize: U64,
    est_exact: u8,
    state_on_disk: u8,
    _reserved: [u8; 6],
}

const _: () = assert!(DIR_ENTRY_SIZE == 52);

impl PartitionDirEntry {
    le_accessors! {
        offset: u32,
        compressed_len: u32,
        uncompressed_len: u32,
        child_blocknum: u64,
        est_nkeys: u64,
        est_ndata: u64,
        est_dsize: u64,
    }
}

/// Location of one partition inside a written node image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLocation {
    pub offset: u32,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
}

/// Everything needed to partial-fetch from a written image: where the
/// payload area starts within the block and where each sub-block lives.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    pub payload_start: u32,
    pub parts: Vec<PartLocation>,
}

impl NodeLayout {
    /// Byte range of partition `i`'s stored sub-block (frame + checksum)
    /// relative to the block start.
    pub fn sub_block_range(&self, i: usize) -> (u64, usize) {
        let part = &self.parts[i];
        (
            self.payload_start as u64 + part.offset as u64,
            part.compressed_len as usize + 8,
        )
    }
}

// ── Manual little-endian framing ─────────────────────────────────────────

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn put_len_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.put_bytes(v);
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.buf.len(),
            "truncated node image: need {} bytes at offset {}, have {}",
            n,
            self.pos,
            self.buf.len()
        );
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_len_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

// ── Partition plaintext ──────────────────────────────────────────────────

fn write_leaf_entry(w: &mut ByteWriter, le: &LeafEntry) {
    w.put_len_bytes(le.key());
    w.put_u8(if le.is_clean() { 0 } else { 1 });
    match le.committed() {
        Committed::Present(v) => {
            w.put_u8(0);
            w.put_len_bytes(v);
        }
        Committed::Tombstone => w.put_u8(1),
    }
    w.put_u32(le.stack().len() as u32);
    for p in le.stack() {
        w.put_u8(p.xids.num_xids() as u8);
        for id in p.xids.iter() {
            w.put_u64(id);
        }
        match &p.op {
            ProvisionalOp::Insert(v) => {
                w.put_u8(0);
                w.put_len_bytes(v);
            }
            ProvisionalOp::Delete => w.put_u8(1),
        }
    }
}

fn read_leaf_entry(r: &mut ByteReader<'_>) -> Result<LeafEntry> {
    let key = r.get_len_bytes()?;
    let _flags = r.get_u8()?;
    let committed = match r.get_u8()? {
        0 => Committed::Present(r.get_len_bytes()?),
        1 => Committed::Tombstone,
        tag => bail!("bad committed tag {tag} in leaf entry"),
    };
    let stack_len = r.get_u32()? as usize;
    let mut stack = SmallVec::new();
    for _ in 0..stack_len {
        let n_xids = r.get_u8()? as usize;
        let mut chain = SmallVec::<[u64; 4]>::new();
        for _ in 0..n_xids {
            chain.push(r.get_u64()?);
        }
        let op = match r.get_u8()? {
            0 => ProvisionalOp::Insert(r.get_len_bytes()?),
            1 => ProvisionalOp::Delete,
            tag => bail!("bad provisional op tag {tag} in leaf entry"),
        };
        stack.push(Provisional {
            xids: Xids::from_chain(&chain),
            op,
        });
    }
    Ok(LeafEntry::from_parts(key, committed, stack))
}

fn write_message(w: &mut ByteWriter, msg: &Message) {
    w.put_u8(msg.mtype as u8);
    w.put_u64(msg.msn);
    w.put_u8(msg.xids.num_xids() as u8);
    for id in msg.xids.iter() {
        w.put_u64(id);
    }
    w.put_len_bytes(&msg.key);
    w.put_len_bytes(&msg.val);
}

fn read_message(r: &mut ByteReader<'_>) -> Result<Message> {
    let mtype = MessageType::from_u8(r.get_u8()?)
        .ok_or_else(|| eyre!("bad message type in buffered message"))?;
    let msn = r.get_u64()?;
    let n_xids = r.get_u8()? as usize;
    let mut chain = SmallVec::<[u64; 4]>::new();
    for _ in 0..n_xids {
        chain.push(r.get_u64()?);
    }
    let key = r.get_len_bytes()?;
    let val = r.get_len_bytes()?;
    Ok(Message {
        mtype,
        msn,
        xids: Xids::from_chain(&chain),
        key,
        val,
    })
}

fn leaf_plaintext(entries: &[LeafEntry]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u32(entries.len() as u32);
    for le in entries {
        write_leaf_entry(&mut w, le);
    }
    w.buf
}

fn buffer_plaintext(buf: &MessageBuffer) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u32(buf.len() as u32);
    for msg in buf.iter() {
        write_message(&mut w, msg);
    }
    w.buf
}

fn parse_leaf_plaintext(plain: &[u8]) -> Result<Vec<LeafEntry>> {
    let mut r = ByteReader::new(plain);
    let count = r.get_u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(read_leaf_entry(&mut r)?);
    }
    Ok(entries)
}

fn parse_buffer_plaintext(plain: &[u8]) -> Result<MessageBuffer> {
    let mut r = ByteReader::new(plain);
    let count = r.get_u32()? as usize;
    let mut buf = MessageBuffer::new();
    for _ in 0..count {
        buf.enqueue(read_message(&mut r)?);
    }
    Ok(buf)
}

// ── Whole-node serialize / deserialize ───────────────────────────────────

/// Serialize a fully resident node. Leaves are re-partitioned into
/// basements of roughly `basement_target` bytes and the node adopts the
/// new partitioning so the written layout matches the live object.
pub fn serialize_node(node: &mut Node, basement_target: u32) -> Result<(Vec<u8>, NodeLayout)> {
    node.assert_entirely_in_memory();
    if node.is_leaf() {
        rebalance_leaf(node, basement_target);
    }

    let n_children = node.n_children();

    // Compress every partition up front so directory lengths are known.
    let mut sub_blocks: Vec<(Vec<u8>, u32)> = Vec::with_capacity(n_children);
    for i in 0..n_children {
        let plain = match &node.partitions[i].state {
            PartitionState::Leaf(bn) => {
                let entries: Vec<LeafEntry> = bn.iter().cloned().collect();
                leaf_plaintext(&entries)
            }
            PartitionState::Internal(buf) => buffer_plaintext(buf),
            _ => unreachable!(),
        };
        let frame = zstd::bulk::compress(&plain, COMPRESSION_LEVEL)
            .wrap_err("compressing partition sub-block")?;
        sub_blocks.push((frame, plain.len() as u32));
    }

    let prefix = NodePrefix {
        magic: *NODE_MAGIC,
        layout_version: U32::new(node.layout_version),
        layout_version_original: U32::new(node.layout_version_original),
        build_id: U32::new(node.build_id),
        flags: U32::new(node.flags),
        height: U32::new(node.height),
        n_children: U32::new(n_children as u32),
        nodesize: U32::new(node.nodesize),
        _reserved: [0; 4],
        blocknum: U64::new(node.blocknum),
        max_msn: U64::new(node.max_msn_applied_in_memory),
    };

    let mut out = Vec::new();
    out.extend_from_slice(prefix.as_bytes());
    for pivot in &node.pivots {
        out.extend_from_slice(&(pivot.len() as u32).to_le_bytes());
        out.extend_from_slice(pivot);
    }

    let mut parts = Vec::with_capacity(n_children);
    let mut offset = 0u32;
    for (i, (frame, uncompressed_len)) in sub_blocks.iter().enumerate() {
        let est = node.partitions[i].estimates;
        let dir = PartitionDirEntry {
            offset: U32::new(offset),
            compressed_len: U32::new(frame.len() as u32),
            uncompressed_len: U32::new(*uncompressed_len),
            child_blocknum: U64::new(node.partitions[i].child_blocknum),
            est_nkeys: U64::new(est.nkeys),
            est_ndata: U64::new(est.ndata),
            est_dsize: U64::new(est.dsize),
            est_exact: est.exact as u8,
            state_on_disk: 1,
            _reserved: [0; 6],
        };
        out.extend_from_slice(dir.as_bytes());

        parts.push(PartLocation {
            offset,
            compressed_len: frame.len() as u32,
            uncompressed_len: *uncompressed_len,
        });
        offset += frame.len() as u32 + 8;
    }

    let payload_start = out.len() as u32;
    for (frame, _) in &sub_blocks {
        out.extend_from_slice(frame);
        out.extend_from_slice(&CRC64.checksum(frame).to_le_bytes());
    }

    let whole = CRC64.checksum(&out);
    out.extend_from_slice(&whole.to_le_bytes());

    Ok((
        out,
        NodeLayout {
            payload_start,
            parts,
        },
    ))
}

/// Parse a node image. Every partition comes back `Compressed`; the caller
/// decompresses the ones its fetch plan needs.
pub fn deserialize_node(bytes: &[u8]) -> Result<Node> {
    ensure!(bytes.len() > PREFIX_SIZE + 8, "node image too small");
    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let stored = u64::from_le_bytes(trailer.try_into().unwrap());
    ensure!(
        CRC64.checksum(body) == stored,
        "node image checksum mismatch"
    );

    let prefix = NodePrefix::ref_from_bytes(&body[..PREFIX_SIZE])
        .map_err(|e| eyre!("failed to parse node prefix: {e:?}"))?;
    ensure!(&prefix.magic == NODE_MAGIC, "bad node magic");
    ensure!(
        prefix.layout_version() == LAYOUT_VERSION,
        "unsupported node layout version {} (expected {})",
        prefix.layout_version(),
        LAYOUT_VERSION
    );

    let n_children = prefix.n_children() as usize;
    ensure!(n_children > 0, "node image with zero children");

    let mut r = ByteReader::new(&body[PREFIX_SIZE..]);
    let mut pivots = Vec::with_capacity(n_children - 1);
    let mut total_pivot_bytes = 0usize;
    for _ in 0..n_children - 1 {
        let pivot = r.get_len_bytes()?;
        total_pivot_bytes += pivot.len();
        pivots.push(pivot);
    }

    let mut partitions = Vec::with_capacity(n_children);
    let mut parts = Vec::with_capacity(n_children);
    for _ in 0..n_children {
        let dir_bytes = r.take(DIR_ENTRY_SIZE)?;
        let dir = PartitionDirEntry::ref_from_bytes(dir_bytes)
            .map_err(|e| eyre!("failed to parse partition directory entry: {e:?}"))?;
        parts.push(PartLocation {
            offset: dir.offset(),
            compressed_len: dir.compressed_len(),
            uncompressed_len: dir.uncompressed_len(),
        });
        partitions.push(Partition {
            child_blocknum: dir.child_blocknum(),
            state: PartitionState::OnDisk,
            clock: false,
            estimates: SubtreeEstimates {
                nkeys: dir.est_nkeys(),
                ndata: dir.est_ndata(),
                dsize: dir.est_dsize(),
                exact: dir.est_exact != 0,
            },
        });
    }

    let payload_start = PREFIX_SIZE + r.pos;
    for (i, part) in parts.iter().enumerate() {
        let lo = payload_start + part.offset as usize;
        let hi = lo + part.compressed_len as usize + 8;
        ensure!(hi <= body.len(), "partition {i} extends past node image");
        let (frame, sum) = body[lo..hi].split_at(part.compressed_len as usize);
        let stored = u64::from_le_bytes(sum.try_into().unwrap());
        ensure!(
            CRC64.checksum(frame) == stored,
            "sub-block checksum mismatch in partition {i}"
        );
        partitions[i].state = PartitionState::Compressed(CompressedBlock {
            bytes: frame.to_vec(),
            uncompressed_len: part.uncompressed_len,
        });
    }

    let msn = prefix.max_msn();
    Ok(Node {
        blocknum: prefix.blocknum(),
        fullhash: super::fullhash(prefix.blocknum()),
        height: prefix.height(),
        nodesize: prefix.nodesize(),
        flags: prefix.flags(),
        layout_version: prefix.layout_version(),
        layout_version_original: prefix.layout_version_original(),
        build_id: prefix.build_id(),
        dirty: false,
        max_msn_applied_on_disk: msn,
        max_msn_applied_in_memory: msn,
        pivots,
        total_pivot_bytes,
        partitions,
        layout: Some(NodeLayout {
            payload_start: payload_start as u32,
            parts,
        }),
    })
}

/// Verify and attach a sub-block read straight from disk (partial fetch of
/// an `OnDisk` partition). `raw` is the stored sub-block: frame + checksum.
pub fn attach_fetched_partition(node: &mut Node, i: usize, raw: Vec<u8>) -> Result<()> {
    ensure!(raw.len() >= 8, "sub-block too small");
    let frame_len = raw.len() - 8;
    let stored = u64::from_le_bytes(raw[frame_len..].try_into().unwrap());
    ensure!(
        CRC64.checksum(&raw[..frame_len]) == stored,
        "sub-block checksum mismatch in partition {i}"
    );
    let uncompressed_len = node
        .layout
        .as_ref()
        .ok_or_else(|| eyre!("no layout for partial fetch"))?
        .parts[i]
        .uncompressed_len;
    let mut bytes = raw;
    bytes.truncate(frame_len);
    node.partitions[i].state = PartitionState::Compressed(CompressedBlock {
        bytes,
        uncompressed_len,
    });
    Ok(())
}

/// Move one partition from `Compressed` to `Available`.
pub fn decompress_partition(node: &mut Node, i: usize) -> Result<()> {
    let cb = match &node.partitions[i].state {
        PartitionState::Compressed(cb) => cb,
        PartitionState::Leaf(_) | PartitionState::Internal(_) => return Ok(()),
        other => bail!("cannot decompress partition {i} in state {other:?}"),
    };
    let plain = zstd::bulk::decompress(&cb.bytes, cb.uncompressed_len as usize)
        .wrap_err("decompressing partition sub-block")?;
    ensure!(
        plain.len() == cb.uncompressed_len as usize,
        "partition {i} decompressed to unexpected length"
    );
    let state = if node.height == 0 {
        let entries = parse_leaf_plaintext(&plain)?;
        let mut bn = Basement::from_sorted_entries(entries, node.max_msn_applied_on_disk);
        bn.set_soft_copy_up_to_date(false);
        PartitionState::Leaf(bn)
    } else {
        PartitionState::Internal(parse_buffer_plaintext(&plain)?)
    };
    node.partitions[i].state = state;
    Ok(())
}

/// Flatten a leaf's entries and regroup them into basements of roughly
/// `basement_target` serialized bytes. The node adopts the new layout:
/// fresh pivots at run boundaries, per-run exact estimates, and the MSN
/// watermark of the whole node.
fn rebalance_leaf(node: &mut Node, basement_target: u32) {
    debug_assert!(node.is_leaf());
    let seqinsert = node.basement(node.n_children() - 1).seqinsert();

    let mut entries: Vec<LeafEntry> = Vec::with_capacity(node.leaf_num_entries());
    for i in 0..node.n_children() {
        entries.extend(node.basement(i).iter().cloned());
    }

    let mut runs: Vec<Vec<LeafEntry>> = Vec::new();
    let mut run: Vec<LeafEntry> = Vec::new();
    let mut run_bytes = 0usize;
    for le in entries {
        if run_bytes >= basement_target as usize && !run.is_empty() {
            runs.push(std::mem::take(&mut run));
            run_bytes = 0;
        }
        run_bytes += le.disksize();
        run.push(le);
    }
    runs.push(run);

    let msn = node.max_msn_applied_in_memory;
    let mut pivots = Vec::with_capacity(runs.len() - 1);
    let mut total_pivot_bytes = 0;
    for r in &runs[..runs.len() - 1] {
        let pivot = r.last().expect("non-final runs are nonempty").key().to_vec();
        total_pivot_bytes += pivot.len();
        pivots.push(pivot);
    }

    let mut partitions = Vec::with_capacity(runs.len());
    for r in runs {
        let mut bn = Basement::from_sorted_entries(r, msn);
        bn.set_soft_copy_up_to_date(true);
        let mut p = Partition::leaf(bn);
        p.estimates = SubtreeEstimates::zero();
        partitions.push(p);
    }
    node.pivots = pivots;
    node.total_pivot_bytes = total_pivot_bytes;
    node.partitions = partitions;
    // The hint belongs to the right edge regardless of partitioning.
    let last = node.n_children() - 1;
    node.basement_mut(last).force_seqinsert(seqinsert);
    for i in 0..node.n_children() {
        node.refresh_leaf_estimates(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::default_key_cmp;
    use crate::msg::Msn;

    fn build_leaf(n: usize, nodesize: u32) -> Node {
        let mut node = Node::new_leaf(7, nodesize, 0);
        for i in 0..n {
            let key = format!("key{i:06}");
            let mut m = Message::new(
                MessageType::Insert,
                Xids::root(),
                key.into_bytes(),
                format!("value{i}").into_bytes(),
            );
            m.msn = i as Msn + 1;
            node.basement_mut(0).apply_message(&m, default_key_cmp, None);
            node.max_msn_applied_in_memory = m.msn;
        }
        node
    }

    #[test]
    fn leaf_roundtrip_preserves_entries() {
        let mut node = build_leaf(100, 1 << 20);
        let (bytes, layout) = serialize_node(&mut node, 512).unwrap();
        assert_eq!(layout.parts.len(), node.n_children());
        assert!(node.n_children() > 1, "rebalance should produce several basements");

        let mut loaded = deserialize_node(&bytes).unwrap();
        assert_eq!(loaded.blocknum, 7);
        assert_eq!(loaded.height, 0);
        assert_eq!(loaded.n_children(), node.n_children());
        assert_eq!(loaded.max_msn_applied_on_disk, 100);
        assert!(!loaded.dirty);

        for i in 0..loaded.n_children() {
            decompress_partition(&mut loaded, i).unwrap();
        }
        let mut keys = Vec::new();
        for i in 0..loaded.n_children() {
            for le in loaded.basement(i).iter() {
                keys.push(le.key().to_vec());
            }
        }
        assert_eq!(keys.len(), 100);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(loaded.basement(0).max_msn_applied(), 100);
    }

    #[test]
    fn internal_roundtrip_preserves_buffers() {
        let mut node = Node::new_empty(9, 1, 0, 1 << 20, 0);
        node.partitions.push(Partition::internal(20));
        node.append_child(Partition::internal(21), Some(b"m".to_vec()));
        for i in 0..10u64 {
            let mut m = Message::new(
                MessageType::Insert,
                Xids::from_chain(&[5]),
                format!("k{i}").into_bytes(),
                b"v".to_vec(),
            );
            m.msn = i + 1;
            let child = node.which_child(&m.key, default_key_cmp);
            node.buffer_mut(child).enqueue(m);
        }
        node.max_msn_applied_in_memory = 10;

        let (bytes, _layout) = serialize_node(&mut node, 4096).unwrap();
        let mut loaded = deserialize_node(&bytes).unwrap();
        assert_eq!(loaded.height, 1);
        assert_eq!(loaded.n_children(), 2);
        assert_eq!(loaded.partitions[0].child_blocknum, 20);
        assert_eq!(loaded.partitions[1].child_blocknum, 21);
        assert_eq!(loaded.pivots, vec![b"m".to_vec()]);

        decompress_partition(&mut loaded, 0).unwrap();
        decompress_partition(&mut loaded, 1).unwrap();
        let total = loaded.buffer(0).len() + loaded.buffer(1).len();
        assert_eq!(total, 10);
        let original_total = node.buffer(0).n_bytes() + node.buffer(1).n_bytes();
        let loaded_total = loaded.buffer(0).n_bytes() + loaded.buffer(1).n_bytes();
        assert_eq!(loaded_total, original_total);
        assert_eq!(loaded.buffer(0).iter().next().unwrap().xids, Xids::from_chain(&[5]));
    }

    #[test]
    fn corruption_is_detected() {
        let mut node = build_leaf(10, 1 << 20);
        let (mut bytes, _) = serialize_node(&mut node, 4096).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(deserialize_node(&bytes).is_err());
    }

    #[test]
    fn partial_fetch_from_raw_sub_block() {
        let mut node = build_leaf(50, 1 << 20);
        let (bytes, layout) = serialize_node(&mut node, 256).unwrap();
        let mut loaded = deserialize_node(&bytes).unwrap();
        assert!(loaded.n_children() >= 2);

        // Simulate the partition having been evicted to disk, then read its
        // sub-block back out of the image.
        loaded.partitions[1].state = PartitionState::OnDisk;
        let (off, len) = layout.sub_block_range(1);
        let raw = bytes[off as usize..off as usize + len].to_vec();
        attach_fetched_partition(&mut loaded, 1, raw).unwrap();
        decompress_partition(&mut loaded, 1).unwrap();
        assert!(loaded.basement(1).len() > 0);
    }
}
