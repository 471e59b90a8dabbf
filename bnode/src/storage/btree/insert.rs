//! Insertion, node splits and the deferred index work they produce.
//!
//! A split only touches the overflowing node, its new right sibling and the
//! old right neighbour. The index record for the new node is not added in
//! the same step: a [`Todo`] is queued and drained before the mutation
//! commits. Until it is applied the new node is reachable through the
//! sibling link of its left neighbour.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::storage::btree::error::BtreeError;
use crate::storage::btree::traverse::{Bridge, StackEntry, Start};
use crate::storage::btree::tree::Mutation;
use crate::storage::cache::{Access, NodeRef};
use crate::storage::node::{INVALID_ID, Lookup, NodeId, NodeKind, OFFSET_SIZE, encode_index, encode_record};

/// Index work still owed to the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Todo {
    /// Add an index record for `child` to the node at `level` that covers
    /// its first key. `anchor` is where the search starts, if known.
    IndexChild {
        level: u16,
        child: NodeId,
        anchor: Option<StackEntry>,
    },
    /// The top level has more than one node: put a new root above it.
    GrowRoot,
    /// A delete emptied this leaf but could not free it.
    FreeLeaf { node: NodeId },
}

impl Todo {
    /// Work that makes the target of a bridge reachable through the index.
    #[must_use]
    pub const fn from_bridge(bridge: &Bridge, height: u16) -> Self {
        if bridge.level >= height {
            Self::GrowRoot
        } else {
            Self::IndexChild {
                level: bridge.level + 1,
                child: bridge.to,
                anchor: None,
            }
        }
    }

    /// The same work without a start hint.
    #[must_use]
    pub const fn without_anchor(self) -> Self {
        match self {
            Self::IndexChild { level, child, .. } => Self::IndexChild {
                level,
                child,
                anchor: None,
            },
            other => other,
        }
    }
}

impl<'t> Mutation<'t> {
    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), BtreeError> {
        self.stack.clear();
        let (located, bridges) = self
            .tree
            .descend(
                &self.state,
                Start::root(&self.state),
                key,
                1,
                Access::ReadWrite,
                Some(&mut self.stack),
            )?
            .into_parts();
        self.note_bridges(&bridges);

        if located.lookup.is_exact() {
            return Err(BtreeError::KeyExists);
        }
        let anchor = self.stack.at(2);
        self.insert_at(
            &located.handle,
            1,
            located.lookup.insert_position(),
            key,
            &encode_record(key, value),
            anchor,
        )
    }

    /// Place `raw`, whose key is `key`, at `position` of the node at
    /// `level`, splitting the node when the record does not fit. `anchor` is
    /// the parent-level stack entry.
    ///
    /// A record that becomes the node's first one first lowers the
    /// separators above it, so no separator ever exceeds its child's first
    /// key.
    pub(crate) fn insert_at(
        &mut self,
        handle: &NodeRef<'t>,
        level: u16,
        position: usize,
        key: &[u8],
        raw: &[u8],
        anchor: Option<StackEntry>,
    ) -> Result<(), BtreeError> {
        if position == 0 && level < self.state.height {
            let route = handle.read().first_key()?.unwrap_or_else(|| key.to_vec());
            self.lower_separator(level + 1, handle.id(), &route, key)?;
        }
        self.place_or_split(handle, level, position, raw, anchor)
    }

    fn place_or_split(
        &mut self,
        handle: &NodeRef<'t>,
        level: u16,
        position: usize,
        raw: &[u8],
        anchor: Option<StackEntry>,
    ) -> Result<(), BtreeError> {
        {
            let mut node = handle.write();
            if node.fits(raw.len()) {
                node.place_raw(position, raw)?;
                self.changed = true;
                return Ok(());
            }
        }
        self.split(handle, level, position, raw, anchor)
    }

    /// Make the separator of `child` at `level` no larger than `key`.
    ///
    /// Ancestors are lowered before the record below them, so a failure part
    /// way leaves every separator at or below its child's first key.
    fn lower_separator(
        &mut self,
        level: u16,
        child: NodeId,
        route: &[u8],
        key: &[u8],
    ) -> Result<(), BtreeError> {
        if level > self.state.height {
            return Ok(());
        }
        let Some((handle, pos)) = self.locate_index(level, child, route, Access::ReadWrite)? else {
            return Ok(());
        };
        let old = handle.read().record(pos)?.key.to_vec();
        if self.tree.comparator.compare(&old, key) != Ordering::Greater {
            return Ok(());
        }
        if pos == 0 && level < self.state.height {
            self.lower_separator(level + 1, handle.id(), &old, key)?;
        }
        self.replace_separator(&handle, level, pos, key, child)?;
        debug!(tree = self.tree.id, level, child, "lowered separator");
        Ok(())
    }

    /// Rewrite record `pos` of an index node so that `key` leads to `child`.
    /// The old record is put back when the new one cannot be placed.
    pub(crate) fn replace_separator(
        &mut self,
        handle: &NodeRef<'t>,
        level: u16,
        pos: usize,
        key: &[u8],
        child: NodeId,
    ) -> Result<(), BtreeError> {
        let old = handle.read().record(pos)?.raw.to_vec();
        handle.write().delete(pos)?;
        if let Err(e) = self.place_or_split(handle, level, pos, &encode_index(key, child), None) {
            handle.write().place_raw(pos, &old)?;
            return Err(e);
        }
        self.changed = true;
        Ok(())
    }

    fn split(
        &mut self,
        handle: &NodeRef<'t>,
        level: u16,
        position: usize,
        raw: &[u8],
        anchor: Option<StackEntry>,
    ) -> Result<(), BtreeError> {
        let tree = self.tree;
        let (mut records, kind, old_next_id) = {
            let node = handle.read();
            (node.raw_records()?, node.kind()?, node.next())
        };
        records.insert(position, raw.to_vec());
        if records.len() < 2 {
            return Err(BtreeError::Inconsistent(format!(
                "node {} cannot be split with {} records",
                handle.id(),
                records.len()
            )));
        }
        let split_at = split_point(&records, tree.config.capacity());

        let old_next = if old_next_id == INVALID_ID {
            None
        } else {
            Some(tree.node(&self.state, old_next_id, Access::ReadWrite)?)
        };
        let right_id = self.state.bitmap.allocate()?;
        let right = match tree.cache.get(right_id, Access::ReadWrite, true) {
            Ok(right) => right,
            Err(e) => {
                self.state.bitmap.release(right_id)?;
                return Err(e.into());
            }
        };

        {
            let mut left = handle.write();
            let mut new = right.write();
            left.reset();
            for (pos, record) in records[..split_at].iter().enumerate() {
                left.place_raw(pos, record)?;
            }
            new.init(right_id, kind);
            for (pos, record) in records[split_at..].iter().enumerate() {
                new.place_raw(pos, record)?;
            }
            new.set_prev(left.id());
            new.set_next(old_next_id);
            left.set_next(right_id);
        }
        if let Some(next) = &old_next {
            next.write().set_prev(right_id);
        }
        self.changed = true;

        debug!(
            tree = tree.id,
            level,
            left = handle.id(),
            right = right_id,
            left_records = split_at,
            right_records = records.len() - split_at,
            "split node"
        );
        self.todos.push_back(if level >= self.state.height {
            Todo::GrowRoot
        } else {
            Todo::IndexChild {
                level: level + 1,
                child: right_id,
                anchor,
            }
        });
        Ok(())
    }

    pub(crate) fn apply(&mut self, todo: &Todo) -> Result<(), BtreeError> {
        match *todo {
            Todo::GrowRoot => self.grow_root(),
            Todo::FreeLeaf { node } => self.free_leaf(node),
            Todo::IndexChild { level, .. } if level > self.state.height => self.grow_root(),
            Todo::IndexChild {
                level,
                child,
                anchor,
            } => self.index_child(level, child, anchor),
        }
    }

    /// Insert the index record for `child` at `level`.
    ///
    /// Work queued in an earlier mutation may name a node that has since
    /// been freed or reused elsewhere, so the child must still be reachable
    /// at `level - 1` through its own first key.
    fn index_child(
        &mut self,
        level: u16,
        child: NodeId,
        anchor: Option<StackEntry>,
    ) -> Result<(), BtreeError> {
        let tree = self.tree;
        if !self.state.bitmap.is_allocated(child) {
            return Ok(());
        }
        let first = {
            let handle = tree.node(&self.state, child, Access::Read)?;
            let node = handle.read();
            node.first_key()?
        };
        let Some(key) = first else {
            return Ok(());
        };
        let reached = tree
            .descend(&self.state, Start::root(&self.state), &key, level - 1, Access::Read, None)?
            .into_parts()
            .0
            .handle
            .id();
        if reached != child {
            debug!(tree = tree.id, level, child, reached, "node moved before it was indexed");
            return Ok(());
        }

        let start = match anchor {
            Some(entry) if entry.level == level && self.state.bitmap.is_allocated(entry.node) => {
                Start {
                    node: entry.node,
                    level,
                }
            }
            _ => Start::root(&self.state),
        };
        let (located, bridges) = tree
            .descend(&self.state, start, &key, level, Access::ReadWrite, None)?
            .into_parts();
        self.note_bridges(&bridges);

        if let Lookup::Exact(pos) = located.lookup {
            let indexed = located.handle.read().index_child(pos)?;
            if indexed == child {
                return Ok(());
            }
            return Err(BtreeError::Inconsistent(format!(
                "separator of node {indexed} at level {level} equals the first key of node {child}"
            )));
        }
        if located.handle.read().find_child(child)?.is_some() {
            return Ok(());
        }

        let anchor = self.stack.at(level + 1);
        self.insert_at(
            &located.handle,
            level,
            located.lookup.insert_position(),
            &key,
            &encode_index(&key, child),
            anchor,
        )?;
        debug!(tree = tree.id, level, child, node = located.handle.id(), "indexed node");
        Ok(())
    }

    /// Put a new level above the top-level chain.
    ///
    /// All index records of the chain are packed into fresh nodes; when more
    /// than one is needed another root growth is queued for them.
    fn grow_root(&mut self) -> Result<(), BtreeError> {
        let tree = self.tree;
        let capacity = tree.config.capacity();

        let mut chain = Vec::new();
        let mut id = self.state.root;
        while id != INVALID_ID {
            if chain.len() > self.state.bitmap.total() as usize {
                return Err(BtreeError::Inconsistent(format!(
                    "sibling cycle at the top level through node {id}"
                )));
            }
            let handle = tree.node(&self.state, id, Access::Read)?;
            let node = handle.read();
            match node.first_key()? {
                Some(key) => chain.push(encode_index(&key, id)),
                None => warn!(tree = tree.id, node = id, "empty node at the top level"),
            }
            id = node.next();
        }
        if chain.len() <= 1 {
            return Ok(());
        }

        let mut groups: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
        let mut used = 0;
        for raw in chain {
            let size = raw.len() + OFFSET_SIZE;
            if used + size > capacity && groups.last().is_some_and(|g| !g.is_empty()) {
                groups.push(Vec::new());
                used = 0;
            }
            used += size;
            if let Some(group) = groups.last_mut() {
                group.push(raw);
            }
        }

        let mut ids = Vec::with_capacity(groups.len());
        for _ in 0..groups.len() {
            match self.state.bitmap.allocate() {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        self.state.bitmap.release(id)?;
                    }
                    return Err(e.into());
                }
            }
        }
        let mut handles = Vec::with_capacity(ids.len());
        for &id in &ids {
            match tree.cache.get(id, Access::ReadWrite, true) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        tree.cache.destroy(handle);
                    }
                    for id in ids {
                        self.state.bitmap.release(id)?;
                    }
                    return Err(e.into());
                }
            }
        }

        for (i, (handle, group)) in handles.iter().zip(&groups).enumerate() {
            let mut node = handle.write();
            node.init(handle.id(), NodeKind::Index);
            for (pos, raw) in group.iter().enumerate() {
                node.place_raw(pos, raw)?;
            }
            node.set_prev(if i == 0 { INVALID_ID } else { ids[i - 1] });
            node.set_next(ids.get(i + 1).copied().unwrap_or(INVALID_ID));
        }

        let old_root = self.state.root;
        self.state.root = ids[0];
        self.state.height += 1;
        self.changed = true;
        debug!(
            tree = tree.id,
            old_root,
            root = self.state.root,
            height = self.state.height,
            nodes = ids.len(),
            "grew root"
        );
        if ids.len() > 1 {
            self.todos.push_back(Todo::GrowRoot);
        }
        Ok(())
    }
}

/// First record that moves to the right half.
///
/// Cuts at the byte midpoint, then shifts the cut until both halves fit.
fn split_point(records: &[Vec<u8>], capacity: usize) -> usize {
    let sizes: Vec<usize> = records.iter().map(|r| r.len() + OFFSET_SIZE).collect();
    let total: usize = sizes.iter().sum();
    let count = sizes.len();

    let mut acc = 0;
    let mut split = count - 1;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc > total / 2 {
            split = i;
            break;
        }
    }
    let mut split = split.clamp(1, count - 1);
    while split > 1 && sizes[..split].iter().sum::<usize>() > capacity {
        split -= 1;
    }
    while split < count - 1 && sizes[split..].iter().sum::<usize>() > capacity {
        split += 1;
    }
    split
}
