//! Node storage for B+trees.
//!
//! Each tree is a sequence of fixed-size node blocks addressed by node id:
//!
//! - Node 0: head block (root id, height, version, free-node bitmap)
//! - Nodes 1-N: index and leaf nodes
//!
//! Blocks are read and written through a [`store::NodeStore`]; the tree
//! itself only touches them through the [`cache::NodeCache`].

pub mod bitmap;
pub mod btree;
pub mod cache;
pub mod compare;
pub mod file;
pub mod head;
pub mod memory;
pub mod node;
pub mod store;

pub use bitmap::{BitmapError, FreeNodeBitmap};
pub use cache::{Access, CacheError, CacheLimits, CacheStats, NodeCache, NodeRef};
pub use compare::{ByteOrder, FnComparator, KeyComparator};
pub use file::FileStore;
pub use memory::{FaultConfig, MemoryStore};
pub use node::{Node, NodeError, NodeId, NodeKind};
pub use store::{NodeStore, StoreError, TreeId};
