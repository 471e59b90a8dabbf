//! Tree handle: lifecycle, locking and the read path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info, warn};

use crate::config::TreeConfig;
use crate::storage::bitmap::FreeNodeBitmap;
use crate::storage::btree::error::BtreeError;
use crate::storage::btree::insert::Todo;
use crate::storage::btree::traverse::{Bridge, Start, TraverseStack};
use crate::storage::cache::{Access, CacheStats, NodeCache, NodeRef};
use crate::storage::compare::KeyComparator;
use crate::storage::head::{HEAD_MAGIC, HeadBlock};
use crate::storage::node::{HEAD_ID, Lookup, NodeId, NodeKind};
use crate::storage::store::{NodeStore, TreeId};

/// Mutable tree-wide fields, guarded by the tree lock.
#[derive(Debug)]
pub struct TreeState {
    pub root: NodeId,
    /// Leaves are level 1, the root is level `height`.
    pub height: u16,
    /// Number of committed mutations.
    pub version: u64,
    pub bitmap: FreeNodeBitmap,
}

/// Outcome of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Search {
    /// Found (or not) through the index alone.
    Clean(Option<Vec<u8>>),
    /// The lookup crossed dangling siblings. Repairs were queued.
    Repaired {
        value: Option<Vec<u8>>,
        bridges: Vec<Bridge>,
    },
}

impl Search {
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Clean(value) | Self::Repaired { value, .. } => value.as_deref(),
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Self::Clean(value) | Self::Repaired { value, .. } => value,
        }
    }

    #[must_use]
    pub const fn is_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }
}

/// Snapshot of tree counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    pub root: NodeId,
    pub height: u16,
    pub version: u64,
    /// Node ids the tree may use, head included.
    pub total_nodes: u32,
    pub free_nodes: u32,
    /// Index repairs waiting for the next writer.
    pub pending_repairs: usize,
    pub cache: CacheStats,
}

/// An on-disk B+tree of variable-length records.
///
/// Any number of readers may run concurrently with each other; writers are
/// exclusive for the whole mutation including every split and merge it
/// causes.
pub struct Btree {
    pub(crate) id: TreeId,
    pub(crate) config: TreeConfig,
    pub(crate) comparator: Arc<dyn KeyComparator>,
    pub(crate) cache: NodeCache,
    state: RwLock<TreeState>,
    /// Repairs discovered by readers, drained by the next writer.
    pending: Mutex<Vec<Todo>>,
    /// Corruption is reported instead of aborting while set.
    recovering: AtomicBool,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Btree {
    /// Bootstrap a new tree: head node 0 and an empty root leaf.
    pub fn create(
        store: Arc<dyn NodeStore>,
        id: TreeId,
        config: TreeConfig,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self, BtreeError> {
        config.validate()?;
        let cache = NodeCache::new(
            store,
            id,
            config.node_size,
            config.cache_limits(),
            config.checksums,
        );

        let mut bitmap = FreeNodeBitmap::new(HEAD_ID, config.node_limit());
        bitmap.reserve(HEAD_ID)?;
        let root = bitmap.allocate()?;
        let state = TreeState {
            root,
            height: 1,
            version: 0,
            bitmap,
        };

        {
            let head = cache.get(HEAD_ID, Access::ReadWrite, true)?;
            if head.read().magic() == HEAD_MAGIC {
                return Err(BtreeError::TreeExists(id));
            }
            let mut node = head.write();
            node.as_bytes_mut().fill(0);
            write_head_fields(&state, &mut node);

            let leaf = cache.get(root, Access::ReadWrite, true)?;
            leaf.write().init(root, NodeKind::Leaf);
        }

        info!(tree = id, node_size = config.node_size, "created tree");
        Ok(Self {
            id,
            config,
            comparator,
            cache,
            state: RwLock::new(state),
            pending: Mutex::new(Vec::new()),
            recovering: AtomicBool::new(false),
        })
    }

    /// Open an existing tree.
    ///
    /// The tree starts in recovery mode: structural corruption is returned
    /// as an error until [`Btree::finish_recovery`] is called.
    pub fn open(
        store: Arc<dyn NodeStore>,
        id: TreeId,
        config: TreeConfig,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self, BtreeError> {
        config.validate()?;
        let cache = NodeCache::new(
            store,
            id,
            config.node_size,
            config.cache_limits(),
            config.checksums,
        );

        let (head, bitmap) = {
            let handle = cache.get(HEAD_ID, Access::Read, false)?;
            let node = handle.read();
            let head = HeadBlock::read(&node)?;
            let bitmap =
                FreeNodeBitmap::build(HeadBlock::bitmap(&node), HEAD_ID, config.node_limit())?;
            (head, bitmap)
        };
        if head.height == 0 || head.root == HEAD_ID || !bitmap.is_allocated(head.root) {
            return Err(BtreeError::Inconsistent(format!(
                "head names root {} at height {}",
                head.root, head.height
            )));
        }
        cache.set_version(head.version);

        info!(
            tree = id,
            root = head.root,
            height = head.height,
            version = head.version,
            "opened tree"
        );
        Ok(Self {
            id,
            config,
            comparator,
            cache,
            state: RwLock::new(TreeState {
                root: head.root,
                height: head.height,
                version: head.version,
                bitmap,
            }),
            pending: Mutex::new(Vec::new()),
            recovering: AtomicBool::new(true),
        })
    }

    /// Leave recovery mode. From now on structural corruption is fatal.
    pub fn finish_recovery(&self) {
        self.recovering.store(false, Ordering::Release);
        debug!(tree = self.id, "recovery finished");
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn id(&self) -> TreeId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    #[must_use]
    pub fn height(&self) -> u16 {
        self.read_state().height
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.read_state().root
    }

    /// Insert a record. Fails with `EEXIST` if the key is present.
    ///
    /// If the record was placed but an index update above it failed, the
    /// error is returned and the record stays reachable through its left
    /// sibling until a later writer (or [`Btree::repair`]) indexes it.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), BtreeError> {
        if !self.config.accepts(key.len(), value.len()) {
            return Err(BtreeError::RecordTooLarge {
                len: key.len() + value.len(),
                max: self.config.max_record_len(),
            });
        }
        self.guard(self.mutate(|m| m.insert(key, value)))
    }

    /// Remove a record. Fails with `ENOENT` if the key is absent.
    pub fn delete(&self, key: &[u8]) -> Result<(), BtreeError> {
        self.guard(self.mutate(|m| m.delete(key)))
    }

    /// Drain every queued index repair. Returns how many were queued.
    pub fn repair(&self) -> Result<usize, BtreeError> {
        self.guard(self.mutate(|m| Ok(m.adopt_pending())))
    }

    /// Value stored under `key`.
    pub fn find(&self, key: &[u8]) -> Result<Vec<u8>, BtreeError> {
        self.search(key)?.into_value().ok_or(BtreeError::KeyNotFound)
    }

    /// Point lookup reporting whether dangling siblings had to be crossed.
    pub fn search(&self, key: &[u8]) -> Result<Search, BtreeError> {
        self.guard(self.search_inner(key))
    }

    fn search_inner(&self, key: &[u8]) -> Result<Search, BtreeError> {
        let state = self.read_state();
        let (located, bridges) = self
            .descend(&state, Start::root(&state), key, 1, Access::Read, None)?
            .into_parts();
        let value = match located.lookup {
            Lookup::Exact(pos) => Some(located.handle.read().record(pos)?.value.to_vec()),
            Lookup::Predecessor(_) | Lookup::BeforeFirst => None,
        };
        drop(located);

        if bridges.is_empty() {
            return Ok(Search::Clean(value));
        }
        self.queue_bridges(&bridges, state.height);
        Ok(Search::Repaired { value, bridges })
    }

    /// Write back every dirty node and make it durable.
    pub fn sync(&self) -> Result<(), BtreeError> {
        let state = self.write_state();
        self.write_head(&state)?;
        let written = self.cache.sync()?;
        debug!(tree = self.id, written, version = state.version, "synced tree");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let state = self.read_state();
        TreeStats {
            root: state.root,
            height: state.height,
            version: state.version,
            total_nodes: state.bitmap.total(),
            free_nodes: state.bitmap.free_count(),
            pending_repairs: self.lock_pending().len(),
            cache: self.cache.stats(),
        }
    }

    // ========== Internals ==========

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state.read().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state.write().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_pending(&self) -> MutexGuard<'_, Vec<Todo>> {
        self.pending.lock().expect("lock poisoned")
    }

    /// Pin an allocated node.
    pub(crate) fn node(
        &self,
        state: &TreeState,
        id: NodeId,
        access: Access,
    ) -> Result<NodeRef<'_>, BtreeError> {
        if id == HEAD_ID || !state.bitmap.is_allocated(id) {
            return Err(BtreeError::NodeNotFound(id));
        }
        Ok(self.cache.get(id, access, false)?)
    }

    /// Copy root, height, version and bitmap into the head node.
    pub(crate) fn write_head(&self, state: &TreeState) -> Result<(), BtreeError> {
        let head = self.cache.get(HEAD_ID, Access::ReadWrite, false)?;
        write_head_fields(state, &mut head.write());
        Ok(())
    }

    /// Queue repairs for a later writer. Start hints are dropped: the nodes
    /// they name may be reused by then.
    pub(crate) fn queue_todos(&self, todos: impl IntoIterator<Item = Todo>) {
        let mut pending = self.lock_pending();
        for todo in todos.into_iter().map(Todo::without_anchor) {
            if !pending.contains(&todo) {
                pending.push(todo);
            }
        }
    }

    pub(crate) fn queue_bridges(&self, bridges: &[Bridge], height: u16) {
        self.queue_todos(bridges.iter().map(|b| Todo::from_bridge(b, height)));
    }

    pub(crate) fn take_pending(&self) -> Vec<Todo> {
        std::mem::take(&mut *self.lock_pending())
    }

    /// Run a mutation under the exclusive lock, drain the index work it
    /// produced and commit the head.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut Mutation<'_>) -> Result<T, BtreeError>,
    ) -> Result<T, BtreeError> {
        let mut m = Mutation::new(self, self.write_state());
        let result = op(&mut m).and_then(|value| m.drain().map(|()| value));
        if result.is_ok() {
            m.run_repairs();
        }
        let committed = m.commit();
        result.and_then(|value| committed.map(|()| value))
    }

    /// Abort on structural corruption once recovery is over.
    fn guard<T>(&self, result: Result<T, BtreeError>) -> Result<T, BtreeError> {
        if let Err(e) = &result {
            if e.is_corruption() && !self.is_recovering() {
                error!(tree = self.id, error = %e, "structural corruption");
                panic!("tree {}: structural corruption: {e}", self.id);
            }
        }
        result
    }
}

fn write_head_fields(state: &TreeState, node: &mut crate::storage::node::Node) {
    HeadBlock {
        version: state.version,
        root: state.root,
        height: state.height,
    }
    .write(node);
    state.bitmap.write_into(HeadBlock::bitmap_mut(node));
}

/// State of one exclusive mutation.
pub(crate) struct Mutation<'t> {
    pub(crate) tree: &'t Btree,
    pub(crate) state: RwLockWriteGuard<'t, TreeState>,
    /// Path of the primary descent; ancestors for index propagation.
    pub(crate) stack: TraverseStack,
    /// Index work caused by this mutation.
    pub(crate) todos: VecDeque<Todo>,
    /// Index work for dangling nodes discovered on the way.
    pub(crate) repairs: Vec<Todo>,
    pub(crate) changed: bool,
}

impl<'t> Mutation<'t> {
    fn new(tree: &'t Btree, state: RwLockWriteGuard<'t, TreeState>) -> Self {
        Self {
            tree,
            state,
            stack: TraverseStack::default(),
            todos: VecDeque::new(),
            repairs: Vec::new(),
            changed: false,
        }
    }

    /// Record the bridges a descent crossed.
    pub(crate) fn note_bridges(&mut self, bridges: &[Bridge]) {
        let height = self.state.height;
        for bridge in bridges {
            let todo = Todo::from_bridge(bridge, height);
            if !self.repairs.contains(&todo) {
                self.repairs.push(todo);
            }
        }
    }

    /// Move reader-queued repairs into this mutation's own work.
    pub(crate) fn adopt_pending(&mut self) -> usize {
        let pending = self.tree.take_pending();
        let count = pending.len();
        self.todos.extend(pending);
        count
    }

    /// Drain this mutation's index work in order.
    pub(crate) fn drain(&mut self) -> Result<(), BtreeError> {
        while let Some(todo) = self.todos.pop_front() {
            if let Err(e) = self.apply(&todo) {
                self.todos.push_front(todo);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Best-effort drain of repairs found by this and earlier operations.
    /// Failures are queued again.
    fn run_repairs(&mut self) {
        let mut queue: VecDeque<Todo> = std::mem::take(&mut self.repairs).into();
        queue.extend(self.tree.take_pending());
        let mut done: Vec<Todo> = Vec::new();

        while let Some(todo) = queue.pop_front() {
            if done.contains(&todo) {
                continue;
            }
            let result = self.apply(&todo).and_then(|()| self.drain());
            if let Err(e) = result {
                warn!(tree = self.tree.id, error = %e, ?todo, "deferred index repair failed");
                let leftover: Vec<Todo> = self.todos.drain(..).collect();
                self.tree.queue_todos(std::iter::once(todo.clone()).chain(leftover));
            }
            done.push(todo);
            queue.extend(self.repairs.drain(..));
        }
    }

    /// Queue leftover work and persist the head if anything changed.
    fn commit(&mut self) -> Result<(), BtreeError> {
        if !self.todos.is_empty() || !self.repairs.is_empty() {
            let leftover: Vec<Todo> = self.todos.drain(..).chain(self.repairs.drain(..)).collect();
            self.tree.queue_todos(leftover);
        }
        if !self.changed {
            return Ok(());
        }
        self.state.version += 1;
        self.tree.cache.set_version(self.state.version);
        self.tree.write_head(&self.state)
    }
}
