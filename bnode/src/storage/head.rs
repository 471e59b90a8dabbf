//! Head-of-tree block.
//!
//! Node 0 of every tree records where the tree starts and which node ids are
//! in use:
//!
//! ```text
//! +-------+---------+---------+--------+--------------------------+----------+
//! | magic | version | root id | height | free-node bitmap ...     | checksum |
//! | 4     | 8       | 4       | 2      | node_size - 22           | 4        |
//! +-------+---------+---------+--------+--------------------------+----------+
//! ```

use crate::storage::node::{CHECKSUM_SIZE, Node, NodeError, NodeId};

/// Magic number of the head block: "BTHD".
pub const HEAD_MAGIC: u32 = u32::from_le_bytes(*b"BTHD");

/// Bytes before the bitmap.
pub const HEAD_HEADER_SIZE: usize = 18;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const ROOT: usize = 12;
    pub const HEIGHT: usize = 16;
}

/// Number of node ids the head block of a `node_size` tree can track.
#[must_use]
pub const fn bitmap_capacity_bits(node_size: usize) -> usize {
    (node_size - HEAD_HEADER_SIZE - CHECKSUM_SIZE) * 8
}

/// Decoded head fields (the bitmap is accessed in place).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadBlock {
    /// Number of committed mutations.
    pub version: u64,
    pub root: NodeId,
    /// Number of levels; leaves are level 1, the root is level `height`.
    pub height: u16,
}

impl HeadBlock {
    /// Decode the head fields, validating the magic number.
    pub fn read(node: &Node) -> Result<Self, NodeError> {
        let found = node.read_u32(offsets::MAGIC);
        if found != HEAD_MAGIC {
            return Err(NodeError::BadMagic {
                expected: HEAD_MAGIC,
                found,
            });
        }
        Ok(Self {
            version: node.read_u64(offsets::VERSION),
            root: node.read_u32(offsets::ROOT),
            height: node.read_u16(offsets::HEIGHT),
        })
    }

    /// Encode the head fields into node 0.
    pub fn write(&self, node: &mut Node) {
        node.write_u32(offsets::MAGIC, HEAD_MAGIC);
        node.write_u64(offsets::VERSION, self.version);
        node.write_u32(offsets::ROOT, self.root);
        node.write_u16(offsets::HEIGHT, self.height);
    }

    /// Persisted bitmap bytes.
    #[must_use]
    pub fn bitmap(node: &Node) -> &[u8] {
        let end = node.size() - CHECKSUM_SIZE;
        &node.as_bytes()[HEAD_HEADER_SIZE..end]
    }

    /// Mutable persisted bitmap bytes.
    pub fn bitmap_mut(node: &mut Node) -> &mut [u8] {
        let end = node.size() - CHECKSUM_SIZE;
        &mut node.as_bytes_mut()[HEAD_HEADER_SIZE..end]
    }
}
