//! Node cache.
//!
//! Every node of a tree that is in use lives here, keyed by node id. Callers
//! pin a node with [`NodeCache::get`] and receive a [`NodeRef`]; dropping the
//! handle unpins it.
//!
//! # Design
//!
//! - Referenced nodes and the head node sit on the active LRU
//! - A node whose reference count drops to zero moves to the passive LRU
//! - Passive overflow evicts the oldest entry, writing it back if dirty
//! - Active overflow demotes the oldest unreferenced entry to passive
//! - One mutex guards the hash map, both lists and every reference count;
//!   node contents have their own `RwLock` so record edits never hold it
//!
//! # Invariants
//!
//! - An entry with `refs > 0` is never evicted
//! - Every entry is on exactly one of the two lists
//! - At most one `ReadWrite` handle exists per node

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{trace, warn};

use crate::storage::head::HEAD_MAGIC;
use crate::storage::node::{HEAD_ID, NODE_MAGIC, Node, NodeError, NodeId};
use crate::storage::store::{NodeStore, StoreError, TreeId};

/// Access mode requested when pinning a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Cache sizing.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Bound of the active LRU.
    pub active_capacity: usize,
    /// Bound of the passive LRU.
    pub passive_capacity: usize,
    /// Hard bound on resident nodes; exceeding it with nothing evictable
    /// fails with [`CacheError::OutOfMemory`].
    pub max_resident: usize,
}

/// Counters for cache activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub resident: usize,
}

/// One resident node.
struct NodeSlot {
    id: NodeId,
    node: RwLock<Node>,
    dirty: AtomicBool,
}

impl NodeSlot {
    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.node.write().expect("lock poisoned")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Active,
    Passive,
}

struct CacheEntry {
    slot: Arc<NodeSlot>,
    refs: u32,
    rw_held: bool,
    list: List,
    /// Key of this entry in its LRU list.
    stamp: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<NodeId, CacheEntry>,
    /// Oldest first.
    active: BTreeMap<u64, NodeId>,
    passive: BTreeMap<u64, NodeId>,
    tick: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Move an entry to the most recent end of `list`.
    fn relink(&mut self, id: NodeId, list: List) {
        let stamp = self.next_stamp();
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match entry.list {
            List::Active => self.active.remove(&entry.stamp),
            List::Passive => self.passive.remove(&entry.stamp),
        };
        entry.list = list;
        entry.stamp = stamp;
        match list {
            List::Active => self.active.insert(stamp, id),
            List::Passive => self.passive.insert(stamp, id),
        };
    }

    fn unlink(&mut self, id: NodeId) -> Option<CacheEntry> {
        let entry = self.entries.remove(&id)?;
        match entry.list {
            List::Active => self.active.remove(&entry.stamp),
            List::Passive => self.passive.remove(&entry.stamp),
        };
        Some(entry)
    }

    /// Oldest active entry nobody references.
    fn oldest_idle_active(&self) -> Option<NodeId> {
        self.active
            .values()
            .copied()
            .find(|id| self.entries.get(id).is_some_and(|e| e.refs == 0))
    }
}

/// Node cache of one tree.
pub struct NodeCache {
    tree: TreeId,
    node_size: usize,
    store: Arc<dyn NodeStore>,
    limits: CacheLimits,
    checksums: bool,
    /// Tree version stamped into blocks at write-back.
    version: AtomicU64,
    inner: Mutex<CacheInner>,
}

impl NodeCache {
    #[must_use]
    pub fn new(
        store: Arc<dyn NodeStore>,
        tree: TreeId,
        node_size: usize,
        limits: CacheLimits,
        checksums: bool,
    ) -> Self {
        Self {
            tree,
            node_size,
            store,
            limits,
            checksums,
            version: AtomicU64::new(0),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("lock poisoned")
    }

    #[must_use]
    pub const fn node_size(&self) -> usize {
        self.node_size
    }

    /// Set the version stamped into blocks written from now on.
    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            resident: inner.entries.len(),
            ..inner.stats
        }
    }

    /// Whether `id` is currently resident.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Pin node `id`.
    ///
    /// On a miss the block is fetched from the store. With `create` set a
    /// block that was never written comes back zeroed and is not validated;
    /// the caller initializes it. Otherwise the checksum (when enabled), the
    /// magic number and the stored node id are checked.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn get(&self, id: NodeId, access: Access, create: bool) -> Result<NodeRef<'_>, CacheError> {
        {
            let mut inner = self.lock();
            if let Some(slot) = self.pin(&mut inner, id, access) {
                inner.stats.hits += 1;
                trace!(tree = self.tree, node = id, "cache hit");
                return Ok(self.handle(slot, access));
            }
            inner.stats.misses += 1;
            while inner.entries.len() >= self.limits.max_resident {
                self.evict_one(&mut inner)?;
            }
        }

        trace!(tree = self.tree, node = id, create, "cache miss");
        let bytes = self
            .store
            .read_or_create(self.tree, id, 1, self.node_size, create)?;
        let node = Node::from_bytes(bytes);
        if !create {
            self.validate(id, &node)?;
        }

        let mut inner = self.lock();
        // Another reader may have loaded it while the lock was released.
        if let Some(slot) = self.pin(&mut inner, id, access) {
            return Ok(self.handle(slot, access));
        }
        let slot = Arc::new(NodeSlot {
            id,
            node: RwLock::new(node),
            dirty: AtomicBool::new(false),
        });
        let stamp = inner.next_stamp();
        inner.entries.insert(
            id,
            CacheEntry {
                slot: Arc::clone(&slot),
                refs: 1,
                rw_held: access == Access::ReadWrite,
                list: List::Active,
                stamp,
            },
        );
        inner.active.insert(stamp, id);
        self.trim(&mut inner);
        Ok(self.handle(slot, access))
    }

    /// Take a reference on a resident entry.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn pin(&self, inner: &mut CacheInner, id: NodeId, access: Access) -> Option<Arc<NodeSlot>> {
        let entry = inner.entries.get_mut(&id)?;
        debug_assert!(
            !entry.rw_held,
            "node {id} of tree {} requested while held read-write",
            self.tree
        );
        debug_assert!(
            access == Access::Read || entry.refs == 0,
            "node {id} of tree {} requested read-write while referenced",
            self.tree
        );
        entry.refs += 1;
        entry.rw_held |= access == Access::ReadWrite;
        let slot = Arc::clone(&entry.slot);
        if entry.list == List::Passive || entry.refs == 1 {
            inner.relink(id, List::Active);
        }
        Some(slot)
    }

    const fn handle(&self, slot: Arc<NodeSlot>, access: Access) -> NodeRef<'_> {
        NodeRef {
            cache: self,
            slot,
            access,
            destroyed: false,
        }
    }

    fn validate(&self, id: NodeId, node: &Node) -> Result<(), NodeError> {
        if self.checksums {
            node.verify_checksum()?;
        }
        let expected = if id == HEAD_ID { HEAD_MAGIC } else { NODE_MAGIC };
        if node.magic() != expected {
            return Err(NodeError::BadMagic {
                expected,
                found: node.magic(),
            });
        }
        if id != HEAD_ID && node.id() != id {
            return Err(NodeError::WrongNodeId {
                expected: id,
                found: node.id(),
            });
        }
        Ok(())
    }

    /// Drop one reference.
    fn put(&self, id: NodeId, access: Access) {
        let mut inner = self.lock();
        // Destroyed while still referenced elsewhere.
        let Some(entry) = inner.entries.get_mut(&id) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if access == Access::ReadWrite {
            entry.rw_held = false;
        }
        if entry.refs == 0 && id != HEAD_ID {
            inner.relink(id, List::Passive);
        }
        self.trim(&mut inner);
    }

    /// Enforce both list bounds.
    fn trim(&self, inner: &mut CacheInner) {
        while inner.active.len() > self.limits.active_capacity {
            let Some(id) = inner.oldest_idle_active() else {
                break;
            };
            inner.relink(id, List::Passive);
        }
        while inner.passive.len() > self.limits.passive_capacity {
            if let Err(e) = self.evict_oldest_passive(inner) {
                warn!(tree = self.tree, error = %e, "write-back during eviction failed");
                break;
            }
        }
    }

    /// Make room for one more entry.
    fn evict_one(&self, inner: &mut CacheInner) -> Result<(), CacheError> {
        if inner.passive.is_empty() {
            let Some(id) = inner.oldest_idle_active() else {
                return Err(CacheError::OutOfMemory {
                    resident: inner.entries.len(),
                });
            };
            inner.relink(id, List::Passive);
        }
        self.evict_oldest_passive(inner)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn evict_oldest_passive(&self, inner: &mut CacheInner) -> Result<(), CacheError> {
        let Some((_, &id)) = inner.passive.first_key_value() else {
            return Ok(());
        };
        if let Some(entry) = inner.entries.get(&id) {
            if entry.slot.dirty.load(Ordering::Acquire) {
                let slot = Arc::clone(&entry.slot);
                self.write_back(&slot)?;
                inner.stats.write_backs += 1;
            }
        }
        inner.unlink(id);
        inner.stats.evictions += 1;
        trace!(tree = self.tree, node = id, "evicted");
        Ok(())
    }

    /// Persist a copy of the node, stamped and sealed.
    fn write_back(&self, slot: &NodeSlot) -> Result<(), CacheError> {
        let mut copy = slot.read().clone();
        copy.set_version(self.version.load(Ordering::Acquire));
        copy.seal(self.checksums);
        self.store.write_back(self.tree, slot.id, copy.as_bytes())?;
        slot.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Unlink a node and free its memory without writing it back.
    ///
    /// Used when a node is deleted from the tree.
    pub fn destroy(&self, mut handle: NodeRef<'_>) {
        handle.destroyed = true;
        let id = handle.id();
        if self.lock().unlink(id).is_some() {
            trace!(tree = self.tree, node = id, "destroyed");
        }
    }

    /// Write back every dirty node. Returns how many were written.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn flush_all(&self) -> Result<usize, CacheError> {
        let dirty: Vec<Arc<NodeSlot>> = {
            let inner = self.lock();
            inner
                .entries
                .values()
                .filter(|e| e.slot.dirty.load(Ordering::Acquire))
                .map(|e| Arc::clone(&e.slot))
                .collect()
        };
        for slot in &dirty {
            self.write_back(slot)?;
        }
        self.lock().stats.write_backs += dirty.len() as u64;
        Ok(dirty.len())
    }

    /// Flush every dirty node and make the store durable.
    pub fn sync(&self) -> Result<usize, CacheError> {
        let written = self.flush_all()?;
        self.store.sync()?;
        Ok(written)
    }

    /// Drop every unreferenced clean node.
    pub fn shrink(&self) {
        let mut inner = self.lock();
        let idle: Vec<NodeId> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0 && !e.slot.dirty.load(Ordering::Acquire))
            .map(|(&id, _)| id)
            .collect();
        for id in idle {
            inner.unlink(id);
            inner.stats.evictions += 1;
        }
    }
}

/// A pinned node. Dropping it releases the reference.
pub struct NodeRef<'c> {
    cache: &'c NodeCache,
    slot: Arc<NodeSlot>,
    access: Access,
    destroyed: bool,
}

impl NodeRef<'_> {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.slot.id
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    /// Shared view of the node content.
    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.slot.read()
    }

    /// Exclusive view of the node content. Marks the node dirty.
    #[must_use]
    pub fn write(&self) -> RwLockWriteGuard<'_, Node> {
        debug_assert_eq!(
            self.access,
            Access::ReadWrite,
            "write through a read-only handle of node {}",
            self.slot.id
        );
        self.mark_dirty();
        self.slot.write()
    }

    /// Record that the in-memory content differs from the store.
    pub fn mark_dirty(&self) {
        self.slot.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.slot.dirty.load(Ordering::Acquire)
    }
}

impl Drop for NodeRef<'_> {
    fn drop(&mut self) {
        if !self.destroyed {
            self.cache.put(self.slot.id, self.access);
        }
    }
}

impl std::fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.slot.id)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

/// Errors raised by the node cache.
#[derive(Debug)]
pub enum CacheError {
    /// Reading or writing the backing block failed.
    Store(StoreError),
    /// The block read back is not a valid node.
    Node(NodeError),
    /// Every resident node is referenced.
    OutOfMemory { resident: usize },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "node store error: {e}"),
            Self::Node(e) => write!(f, "invalid node block: {e}"),
            Self::OutOfMemory { resident } => {
                write!(f, "node cache exhausted: {resident} nodes resident and pinned")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::OutOfMemory { .. } => None,
        }
    }
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<NodeError> for CacheError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}
