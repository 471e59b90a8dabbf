//! Node store abstraction.
//!
//! The tree never touches a device directly. It asks a `NodeStore` for node
//! blocks and hands dirty blocks back to it, which lets the engine run over a
//! real file in production and over simulated in-memory storage in tests.
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `read_or_create` returns the last content passed to `write_back`
//! - blocks that were never written read back as zeros when `create` is set
//! - `sync` makes all previous `write_back` calls durable

use crate::storage::node::NodeId;

/// Identifier of one tree among those sharing a store.
pub type TreeId = u32;

/// Block storage backing the node cache.
///
/// Methods take `&self` so concurrent readers of a tree can fault nodes in
/// while sharing the store; implementations synchronize internally.
pub trait NodeStore: Send + Sync {
    /// Return `count` contiguous node blocks of `node_size` bytes starting at
    /// `node`.
    ///
    /// With `create` set, blocks that do not exist yet come back zero-filled;
    /// without it they are reported as missing.
    fn read_or_create(
        &self,
        tree: TreeId,
        node: NodeId,
        count: u32,
        node_size: usize,
        create: bool,
    ) -> Result<Vec<u8>, StoreError>;

    /// Persist one node block. May be buffered until `sync`.
    fn write_back(&self, tree: TreeId, node: NodeId, data: &[u8]) -> Result<(), StoreError>;

    /// Make every previous `write_back` durable.
    fn sync(&self) -> Result<(), StoreError>;
}

/// Errors that can occur during node store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// The block was never written and creation was not requested.
    Missing { tree: TreeId, node: NodeId },
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Missing { tree, node } => {
                write!(f, "node {node} of tree {tree} does not exist")
            }
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
