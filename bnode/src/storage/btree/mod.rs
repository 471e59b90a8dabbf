//! B+tree over variable-length records.
//!
//! # Structure
//!
//! - Leaves (level 1) hold `(key, value)` records
//! - Index nodes hold `(separator, child id)` records; the separator is the
//!   first key of the child when it was indexed
//! - Every level is a doubly linked list through `prev`/`next`
//!
//! A split links the new right node into its level immediately and indexes
//! it one level up afterwards. A node that is linked but not yet indexed is
//! "dangling"; lookups cross over to it through the sibling link and report
//! the crossing so the index can be repaired.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use bnode::config::TreeConfig;
//! use bnode::storage::btree::Btree;
//! use bnode::storage::compare::ByteOrder;
//! use bnode::storage::memory::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new(0));
//! let tree = Btree::create(store, 1, TreeConfig::default(), Arc::new(ByteOrder)).unwrap();
//! tree.insert(b"key", b"value").unwrap();
//! assert_eq!(tree.find(b"key").unwrap(), b"value");
//! ```

mod check;
mod cursor;
mod delete;
mod error;
mod insert;
mod traverse;
mod tree;

pub use check::CheckReport;
pub use cursor::Cursor;
pub use error::{BtreeError, Errno};
pub use traverse::Bridge;
pub use tree::{Btree, Search, TreeStats};
