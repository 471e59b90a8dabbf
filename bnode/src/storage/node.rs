//! Node block layout and the record codec.
//!
//! Every node other than the head (node 0) uses the same block format:
//!
//! ```text
//! +-------+---------+------------+--------------+---------+---------+---------+------+
//! | magic | version | free_space | record_count | node_id | prev_id | next_id | kind |
//! | 4     | 8       | 2          | 2            | 4       | 4       | 4       | 1    |
//! +-------+---------+------------+--------------+---------+---------+---------+------+
//! | records, growing up ->          free space        <- offset table | checksum |
//! +----------------------------------------------------------------------------------+
//! ```
//!
//! Offset table entry `i` lives at `node_size - 4 - 4 * (i + 1)` and holds the
//! absolute byte position of record `i`. Entry `record_count` is a sentinel
//! pointing at the first free byte. Records are kept physically in key order,
//! so `offset[i] < offset[i + 1]` and a record's length is the distance to the
//! next offset.
//!
//! A record is `key_len: u32 | total_len: u32 | key | value`. Index records
//! carry a 4-byte child node id as their value.

// Node sizes are capped at 64KB by configuration, so every in-node position
// fits in u32 and every count fits in u16.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::compare::KeyComparator;

/// Identifier of a node inside one tree (index into the free-node bitmap).
pub type NodeId = u32;

/// Node id of the head-of-tree block.
pub const HEAD_ID: NodeId = 0;

/// Sentinel for "no sibling".
pub const INVALID_ID: NodeId = u32::MAX;

/// Magic number of a generic node block: "BNOD".
pub const NODE_MAGIC: u32 = u32::from_le_bytes(*b"BNOD");

/// Size of the generic node header in bytes.
pub const HEADER_SIZE: usize = 29;

/// Size of one offset table entry.
pub const OFFSET_SIZE: usize = 4;

/// Trailing bytes reserved for the block checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// `key_len` + `total_len` prefix of every record.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Value size of an index record.
pub const CHILD_ID_SIZE: usize = 4;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const FREE_SPACE: usize = 12;
    pub const RECORD_COUNT: usize = 14;
    pub const NODE_ID: usize = 16;
    pub const PREV_ID: usize = 20;
    pub const NEXT_ID: usize = 24;
    pub const KIND: usize = 28;
}

/// Usable record area of a node: everything except the header, the checksum
/// slot and the sentinel offset entry.
#[must_use]
pub const fn capacity_for(node_size: usize) -> usize {
    node_size - HEADER_SIZE - CHECKSUM_SIZE - OFFSET_SIZE
}

/// Encoded length of a record.
#[must_use]
pub const fn record_len(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + value_len
}

/// Encode a key/value pair into the on-disk record format.
#[must_use]
pub fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let total = record_len(key.len(), value.len());
    let mut raw = Vec::with_capacity(total);
    raw.extend_from_slice(&(key.len() as u32).to_le_bytes());
    raw.extend_from_slice(&(total as u32).to_le_bytes());
    raw.extend_from_slice(key);
    raw.extend_from_slice(value);
    raw
}

/// Encode an index record pointing at `child`.
#[must_use]
pub fn encode_index(key: &[u8], child: NodeId) -> Vec<u8> {
    encode_record(key, &child.to_le_bytes())
}

/// Node type stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Head = 0x01,
    Index = 0x02,
    Leaf = 0x03,
}

impl TryFrom<u8> for NodeKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Head),
            0x02 => Ok(Self::Index),
            0x03 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// Outcome of a binary search inside one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A record compares equal to the key.
    Exact(usize),
    /// The largest record below the key.
    Predecessor(usize),
    /// The node is empty or its first record is already above the key.
    BeforeFirst,
}

impl Lookup {
    /// Position of the matched or preceding record.
    #[must_use]
    pub const fn position(self) -> Option<usize> {
        match self {
            Self::Exact(pos) | Self::Predecessor(pos) => Some(pos),
            Self::BeforeFirst => None,
        }
    }

    #[must_use]
    pub const fn is_exact(self) -> bool {
        matches!(self, Self::Exact(_))
    }

    /// Where a new record with the searched key belongs.
    #[must_use]
    pub const fn insert_position(self) -> usize {
        match self {
            Self::Exact(pos) => pos,
            Self::Predecessor(pos) => pos + 1,
            Self::BeforeFirst => 0,
        }
    }

    /// Index record to follow when descending. Keys below the first
    /// separator go to the leftmost child.
    #[must_use]
    pub const fn descend_position(self) -> usize {
        match self {
            Self::Exact(pos) | Self::Predecessor(pos) => pos,
            Self::BeforeFirst => 0,
        }
    }
}

/// A decoded record borrowed from a node buffer.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// The whole encoded record, header included.
    pub raw: &'a [u8],
}

/// A node block held in memory.
#[derive(Clone)]
pub struct Node {
    data: Box<[u8]>,
}

impl Node {
    /// Create a zero-filled block.
    #[must_use]
    pub fn zeroed(node_size: usize) -> Self {
        Self {
            data: vec![0u8; node_size].into_boxed_slice(),
        }
    }

    /// Wrap bytes read from the node store.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: bytes.into_boxed_slice(),
        }
    }

    /// Initialize an empty node of the given kind.
    pub fn init(&mut self, id: NodeId, kind: NodeKind) {
        self.data.fill(0);
        self.write_u32(offsets::MAGIC, NODE_MAGIC);
        self.write_u32(offsets::NODE_ID, id);
        self.write_u32(offsets::PREV_ID, INVALID_ID);
        self.write_u32(offsets::NEXT_ID, INVALID_ID);
        self.data[offsets::KIND] = kind as u8;
        self.reset();
    }

    /// Drop every record, keeping identity, kind and sibling links.
    pub fn reset(&mut self) {
        let end = self.data.len() - CHECKSUM_SIZE;
        self.data[HEADER_SIZE..end].fill(0);
        self.write_u16(offsets::FREE_SPACE, self.capacity() as u16);
        self.write_u16(offsets::RECORD_COUNT, 0);
        let slot = self.offset_slot(0);
        self.write_u32(slot, HEADER_SIZE as u32);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes available for records and their offset entries when empty.
    #[must_use]
    pub fn capacity(&self) -> usize {
        capacity_for(self.data.len())
    }

    // ========== Header ==========

    #[must_use]
    pub fn magic(&self) -> u32 {
        self.read_u32(offsets::MAGIC)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.read_u64(offsets::VERSION)
    }

    pub fn set_version(&mut self, version: u64) {
        self.write_u64(offsets::VERSION, version);
    }

    #[must_use]
    pub fn free_space(&self) -> usize {
        usize::from(self.read_u16(offsets::FREE_SPACE))
    }

    fn set_free_space(&mut self, free: usize) {
        self.write_u16(offsets::FREE_SPACE, free as u16);
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        usize::from(self.read_u16(offsets::RECORD_COUNT))
    }

    fn set_record_count(&mut self, count: usize) {
        self.write_u16(offsets::RECORD_COUNT, count as u16);
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.read_u32(offsets::NODE_ID)
    }

    #[must_use]
    pub fn prev(&self) -> NodeId {
        self.read_u32(offsets::PREV_ID)
    }

    pub fn set_prev(&mut self, id: NodeId) {
        self.write_u32(offsets::PREV_ID, id);
    }

    #[must_use]
    pub fn next(&self) -> NodeId {
        self.read_u32(offsets::NEXT_ID)
    }

    pub fn set_next(&mut self, id: NodeId) {
        self.write_u32(offsets::NEXT_ID, id);
    }

    pub fn kind(&self) -> Result<NodeKind, NodeError> {
        NodeKind::try_from(self.data[offsets::KIND]).map_err(NodeError::InvalidKind)
    }

    /// Bytes occupied by records and their offset entries.
    #[must_use]
    pub fn used_space(&self) -> usize {
        self.capacity().saturating_sub(self.free_space())
    }

    /// Check whether a record of `len` bytes can be placed.
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        self.free_space() >= len + OFFSET_SIZE
    }

    // ========== Offset table ==========

    /// Byte position of offset table entry `index`.
    fn offset_slot(&self, index: usize) -> usize {
        self.data.len() - CHECKSUM_SIZE - OFFSET_SIZE * (index + 1)
    }

    /// Read offset entry `index` (`index == record_count` is the sentinel).
    pub fn get_offset(&self, index: usize) -> Result<u32, NodeError> {
        let count = self.record_count();
        if index > count || OFFSET_SIZE * (count + 1) > self.capacity() + OFFSET_SIZE {
            return Err(NodeError::InvalidIndex { index, count });
        }
        let offset = self.read_u32(self.offset_slot(index));
        let limit = self.offset_slot(count);
        if (offset as usize) < HEADER_SIZE || offset as usize > limit {
            return Err(NodeError::InvalidOffset { index, offset });
        }
        Ok(offset)
    }

    /// Write offset entry `index`. Entry `record_count + 1` may be written
    /// while a record is being placed.
    pub fn set_offset(&mut self, index: usize, offset: u32) -> Result<(), NodeError> {
        let count = self.record_count();
        if index > count + 1 || OFFSET_SIZE * (index + 1) > self.capacity() + OFFSET_SIZE {
            return Err(NodeError::InvalidIndex { index, count });
        }
        if (offset as usize) < HEADER_SIZE || offset as usize >= self.data.len() - CHECKSUM_SIZE {
            return Err(NodeError::InvalidOffset { index, offset });
        }
        let slot = self.offset_slot(index);
        self.write_u32(slot, offset);
        Ok(())
    }

    // ========== Records ==========

    /// Decode record `index`.
    pub fn record(&self, index: usize) -> Result<Record<'_>, NodeError> {
        let count = self.record_count();
        if index >= count {
            return Err(NodeError::InvalidIndex { index, count });
        }
        let start = self.get_offset(index)? as usize;
        let end = self.get_offset(index + 1)? as usize;
        if end <= start || end - start < RECORD_HEADER_SIZE {
            return Err(NodeError::InvalidRecord { index });
        }
        let key_len = self.read_u32(start) as usize;
        let total_len = self.read_u32(start + 4) as usize;
        if total_len != end - start || RECORD_HEADER_SIZE + key_len > total_len {
            return Err(NodeError::InvalidRecord { index });
        }
        let key_start = start + RECORD_HEADER_SIZE;
        let value_start = key_start + key_len;
        Ok(Record {
            key: &self.data[key_start..value_start],
            value: &self.data[value_start..end],
            raw: &self.data[start..end],
        })
    }

    /// Child node id carried by index record `index`.
    pub fn index_child(&self, index: usize) -> Result<NodeId, NodeError> {
        let record = self.record(index)?;
        let bytes: [u8; CHILD_ID_SIZE] = record
            .value
            .try_into()
            .map_err(|_| NodeError::InvalidRecord { index })?;
        Ok(NodeId::from_le_bytes(bytes))
    }

    /// Position of the index record pointing at `child`, if any.
    pub fn find_child(&self, child: NodeId) -> Result<Option<usize>, NodeError> {
        for index in 0..self.record_count() {
            if self.index_child(index)? == child {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Copy of the first key, or `None` for an empty node.
    pub fn first_key(&self) -> Result<Option<Vec<u8>>, NodeError> {
        if self.record_count() == 0 {
            return Ok(None);
        }
        Ok(Some(self.record(0)?.key.to_vec()))
    }

    /// Copies of every encoded record, in order.
    pub fn raw_records(&self) -> Result<Vec<Vec<u8>>, NodeError> {
        (0..self.record_count())
            .map(|index| self.record(index).map(|r| r.raw.to_vec()))
            .collect()
    }

    /// Binary search for `key`.
    ///
    /// Returns the exact match if present, otherwise the largest record below
    /// the key. `BeforeFirst` signals that nothing in this node precedes the
    /// key, which callers use to reject a speculative sibling.
    pub fn binary_search(
        &self,
        key: &[u8],
        cmp: &dyn KeyComparator,
    ) -> Result<Lookup, NodeError> {
        let mut low = 0;
        let mut high = self.record_count();
        while low < high {
            let mid = low + (high - low) / 2;
            let record = self.record(mid)?;
            match cmp.compare(record.key, key) {
                std::cmp::Ordering::Equal => return Ok(Lookup::Exact(mid)),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        if low == 0 {
            Ok(Lookup::BeforeFirst)
        } else {
            Ok(Lookup::Predecessor(low - 1))
        }
    }

    /// Encode and insert a record at `position`.
    pub fn place(&mut self, position: usize, key: &[u8], value: &[u8]) -> Result<(), NodeError> {
        self.place_raw(position, &encode_record(key, value))
    }

    /// Insert an already encoded record at `position`, shifting later
    /// records and offset entries right by one.
    pub fn place_raw(&mut self, position: usize, raw: &[u8]) -> Result<(), NodeError> {
        let count = self.record_count();
        if position > count {
            return Err(NodeError::InvalidIndex {
                index: position,
                count,
            });
        }
        let len = raw.len();
        if len < RECORD_HEADER_SIZE {
            return Err(NodeError::EmptyRecord);
        }
        let free = self.free_space();
        if free < len + OFFSET_SIZE {
            return Err(NodeError::NoSpace {
                needed: len + OFFSET_SIZE,
                free,
            });
        }

        let end = self.get_offset(count)? as usize;
        let start = if position == count {
            end
        } else {
            self.get_offset(position)? as usize
        };

        self.data.copy_within(start..end, start + len);
        self.data[start..start + len].copy_from_slice(raw);

        for index in (position..=count).rev() {
            let shifted = self.get_offset(index)? + len as u32;
            self.set_offset(index + 1, shifted)?;
        }
        self.set_offset(position, start as u32)?;
        self.set_record_count(count + 1);
        self.set_free_space(free - len - OFFSET_SIZE);
        Ok(())
    }

    /// Remove record `position`, closing the gap it leaves.
    ///
    /// Returns the number of record bytes released.
    pub fn delete(&mut self, position: usize) -> Result<usize, NodeError> {
        let count = self.record_count();
        if position >= count {
            return Err(NodeError::InvalidIndex {
                index: position,
                count,
            });
        }
        let start = self.get_offset(position)? as usize;
        let next = self.get_offset(position + 1)? as usize;
        let end = self.get_offset(count)? as usize;
        if next <= start {
            return Err(NodeError::InvalidRecord { index: position });
        }
        let len = next - start;

        self.data.copy_within(next..end, start);
        self.data[end - len..end].fill(0);

        for index in position + 1..=count {
            let shifted = self.get_offset(index)? - len as u32;
            self.set_offset(index - 1, shifted)?;
        }
        let stale = self.offset_slot(count);
        self.write_u32(stale, 0);
        self.set_record_count(count - 1);
        self.set_free_space(self.free_space() + len + OFFSET_SIZE);
        Ok(len)
    }

    /// Verify the offset table and byte accounting of the whole node.
    pub fn verify_layout(&self) -> Result<(), NodeError> {
        let count = self.record_count();
        if OFFSET_SIZE * count > self.capacity() {
            return Err(NodeError::InvalidIndex { index: count, count });
        }
        let first = self.get_offset(0)?;
        if first as usize != HEADER_SIZE {
            return Err(NodeError::InvalidOffset {
                index: 0,
                offset: first,
            });
        }
        let mut used = 0;
        for index in 0..count {
            used += self.record(index)?.raw.len();
        }
        let sentinel = self.get_offset(count)?;
        if sentinel as usize != HEADER_SIZE + used {
            return Err(NodeError::InvalidOffset {
                index: count,
                offset: sentinel,
            });
        }
        let accounted = used + OFFSET_SIZE * count + self.free_space();
        if accounted != self.capacity() {
            return Err(NodeError::SpaceMismatch {
                accounted,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    // ========== Integrity ==========

    /// CRC32 of everything but the trailing checksum slot.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let end = self.data.len() - CHECKSUM_SIZE;
        crc32fast::hash(&self.data[..end])
    }

    /// Fill the checksum slot before the block is written back.
    pub fn seal(&mut self, checksums: bool) {
        let slot = self.data.len() - CHECKSUM_SIZE;
        let value = if checksums { self.compute_checksum() } else { 0 };
        self.write_u32(slot, value);
    }

    pub fn verify_checksum(&self) -> Result<(), NodeError> {
        let expected = self.read_u32(self.data.len() - CHECKSUM_SIZE);
        let actual = self.compute_checksum();
        if expected != actual {
            return Err(NodeError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    // ========== Raw access ==========

    pub(crate) fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub(crate) fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    pub(crate) fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("records", &self.record_count())
            .field("free_space", &self.free_space())
            .field("prev", &self.prev())
            .field("next", &self.next())
            .finish_non_exhaustive()
    }
}

/// Errors raised while decoding or editing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// An offset entry points outside the record area.
    InvalidOffset { index: usize, offset: u32 },
    /// A record or offset index beyond the record count.
    InvalidIndex { index: usize, count: usize },
    /// A record whose length fields disagree with the offset table.
    InvalidRecord { index: usize },
    /// Unknown node kind byte.
    InvalidKind(u8),
    /// Block does not start with the expected magic number.
    BadMagic { expected: u32, found: u32 },
    /// Stored checksum does not match the block contents.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Header node id differs from the id the block was read for.
    WrongNodeId { expected: NodeId, found: NodeId },
    /// Record bytes, offset entries and free space do not add up.
    SpaceMismatch { accounted: usize, capacity: usize },
    /// Not enough free space for the record.
    NoSpace { needed: usize, free: usize },
    /// Zero-length (or header-less) record.
    EmptyRecord,
}

impl NodeError {
    /// Whether the error means the block content itself is damaged.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        !matches!(self, Self::NoSpace { .. } | Self::EmptyRecord)
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOffset { index, offset } => {
                write!(f, "invalid offset {offset} in entry {index}")
            }
            Self::InvalidIndex { index, count } => {
                write!(f, "index {index} out of range (record count {count})")
            }
            Self::InvalidRecord { index } => write!(f, "malformed record {index}"),
            Self::InvalidKind(v) => write!(f, "invalid node kind: 0x{v:02x}"),
            Self::BadMagic { expected, found } => {
                write!(f, "bad magic: expected 0x{expected:08x}, found 0x{found:08x}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::WrongNodeId { expected, found } => {
                write!(f, "block holds node {found}, expected node {expected}")
            }
            Self::SpaceMismatch {
                accounted,
                capacity,
            } => write!(
                f,
                "space accounting mismatch: {accounted} bytes accounted, capacity {capacity}"
            ),
            Self::NoSpace { needed, free } => {
                write!(f, "node full: need {needed} bytes, {free} free")
            }
            Self::EmptyRecord => write!(f, "record length must be non-zero"),
        }
    }
}

impl std::error::Error for NodeError {}
