// Layers, bottom up:
// 1. Node block codec (header, offset table, records) and head block
// 2. Node store: raw block I/O per tree (file or memory)
// 3. Node cache: pinning, refcounts, active/passive LRU, write-back
// 4. B+tree: traversal with dangling-sibling bridging, split/merge engine,
//    deferred index repair, cursor and structural checker
//
// Locking:
//  - One RwLock per tree: readers share it, a mutation holds it exclusively
//  - One Mutex per cache over its bookkeeping
//  - One RwLock per resident node over its bytes

pub mod config;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, TreeConfig};
pub use storage::btree::{Btree, BtreeError, CheckReport, Cursor, Errno, Search, TreeStats};
