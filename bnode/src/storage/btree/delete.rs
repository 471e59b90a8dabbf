//! Deletion, node merges and root demotion.
//!
//! Removing a record can leave its node empty (the node is freed and its
//! index record removed one level up), change its first key (the separator
//! above is raised) or leave it underfull (it is merged with a sibling).
//! Each of these may repeat on the level above.
//!
//! Freeing and merging pin every node they touch before changing any of
//! them. A read that fails halfway leaves the tree as it was, and the
//! steps already completed leave it consistent.

use std::cmp::Ordering;

use tracing::debug;

use crate::storage::btree::error::BtreeError;
use crate::storage::btree::insert::Todo;
use crate::storage::btree::traverse::Start;
use crate::storage::btree::tree::Mutation;
use crate::storage::cache::{Access, NodeRef};
use crate::storage::node::{INVALID_ID, Lookup, NodeId, NodeKind, encode_index};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// An empty node waiting to be freed, with its neighbours pinned.
struct Unlink<'t> {
    node: NodeRef<'t>,
    prev: Option<NodeRef<'t>>,
    next: Option<NodeRef<'t>>,
}

/// What happens to the index record of the topmost freed node.
enum ParentEdit<'t> {
    /// No record points at it.
    Unindexed,
    /// Its right sibling is not indexed and takes over the record.
    Repoint {
        parent: NodeRef<'t>,
        pos: usize,
        to: NodeId,
    },
    Remove {
        parent: NodeRef<'t>,
        pos: usize,
        level: u16,
    },
    /// It was the only record of the root.
    EmptyRoot {
        root: NodeRef<'t>,
        next: Option<NodeRef<'t>>,
    },
}

impl<'t> Mutation<'t> {
    pub(crate) fn delete(&mut self, key: &[u8]) -> Result<(), BtreeError> {
        let (located, bridges) = self
            .tree
            .descend(
                &self.state,
                Start::root(&self.state),
                key,
                1,
                Access::ReadWrite,
                None,
            )?
            .into_parts();
        self.note_bridges(&bridges);

        let Lookup::Exact(pos) = located.lookup else {
            return Err(BtreeError::KeyNotFound);
        };
        located.handle.write().delete(pos)?;
        self.changed = true;

        self.after_remove(located.handle, 1, pos, key)?;
        self.shrink_root()
    }

    /// Restore the invariants of a node that just lost record `pos`.
    /// `route` is the removed key.
    fn after_remove(
        &mut self,
        handle: NodeRef<'t>,
        level: u16,
        pos: usize,
        route: &[u8],
    ) -> Result<(), BtreeError> {
        let id = handle.id();
        if id == self.state.root {
            return Ok(());
        }
        let (first, free) = {
            let node = handle.read();
            (node.first_key()?, node.free_space())
        };

        let Some(first) = first else {
            return self.unlink_empty(handle, level, route);
        };
        if pos == 0 && level < self.state.height {
            self.raise_separator(level + 1, id, route, &first)?;
        }
        if free > self.tree.config.merge_threshold() {
            self.try_merge(handle, level, &first)?;
        }
        Ok(())
    }

    fn pin_neighbour(&self, id: NodeId) -> Result<Option<NodeRef<'t>>, BtreeError> {
        if id == INVALID_ID {
            return Ok(None);
        }
        Ok(Some(self.tree.node(&self.state, id, Access::ReadWrite)?))
    }

    /// Whether the record after `pos` at `parent`'s level points at `next`.
    fn indexes_next(&self, parent: &NodeRef<'t>, pos: usize, next: NodeId) -> Result<bool, BtreeError> {
        let after = {
            let node = parent.read();
            if pos + 1 < node.record_count() {
                return Ok(node.index_child(pos + 1)? == next);
            }
            node.next()
        };
        if after == INVALID_ID {
            return Ok(false);
        }
        let handle = self.tree.node(&self.state, after, Access::Read)?;
        let node = handle.read();
        Ok(node.record_count() > 0 && node.index_child(0)? == next)
    }

    /// Free an empty node, together with every ancestor its removal
    /// would leave empty, and fix the index record above them.
    ///
    /// A leaf that cannot be freed stays in place, empty, and is retried by
    /// a later repair.
    fn unlink_empty(&mut self, handle: NodeRef<'t>, level: u16, route: &[u8]) -> Result<(), BtreeError> {
        let tree = self.tree;
        let id = handle.id();
        let (doomed, edit) = match self.prepare_unlink(handle, level, route) {
            Ok(plan) => plan,
            Err(e) => {
                if level == 1 {
                    self.repairs.push(Todo::FreeLeaf { node: id });
                }
                return Err(e);
            }
        };

        for unlink in doomed {
            let prev_id = unlink.prev.as_ref().map_or(INVALID_ID, NodeRef::id);
            let next_id = unlink.next.as_ref().map_or(INVALID_ID, NodeRef::id);
            if let Some(prev) = &unlink.prev {
                prev.write().set_next(next_id);
            }
            if let Some(next) = &unlink.next {
                next.write().set_prev(prev_id);
            }
            let id = unlink.node.id();
            self.state.bitmap.release(id)?;
            tree.cache.destroy(unlink.node);
            debug!(tree = tree.id, node = id, "freed node");
        }
        self.changed = true;

        match edit {
            ParentEdit::Unindexed => Ok(()),
            ParentEdit::Repoint { parent, pos, to } => {
                let mut node = parent.write();
                let key = node.record(pos)?.key.to_vec();
                node.delete(pos)?;
                node.place_raw(pos, &encode_index(&key, to))?;
                debug!(tree = tree.id, parent = parent.id(), child = to, "repointed index record");
                Ok(())
            }
            ParentEdit::Remove { parent, pos, level } => {
                let removed = {
                    let mut node = parent.write();
                    let key = node.record(pos)?.key.to_vec();
                    node.delete(pos)?;
                    key
                };
                self.after_remove(parent, level, pos, &removed)
            }
            ParentEdit::EmptyRoot { root, next } => {
                let root_id = root.id();
                match next {
                    Some(next) => {
                        next.write().set_prev(INVALID_ID);
                        self.state.bitmap.release(root_id)?;
                        tree.cache.destroy(root);
                        self.state.root = next.id();
                        debug!(tree = tree.id, old_root = root_id, root = next.id(), "replaced empty root");
                    }
                    None => {
                        root.write().init(root_id, NodeKind::Leaf);
                        self.state.height = 1;
                        debug!(tree = tree.id, root = root_id, "reset empty root");
                    }
                }
                Ok(())
            }
        }
    }

    /// Pin every node that freeing `handle` changes, without changing any.
    fn prepare_unlink(
        &mut self,
        handle: NodeRef<'t>,
        level: u16,
        route: &[u8],
    ) -> Result<(Vec<Unlink<'t>>, ParentEdit<'t>), BtreeError> {
        let mut doomed: Vec<Unlink<'t>> = Vec::new();
        let mut current = handle;
        let mut level = level;
        let mut route = route.to_vec();

        loop {
            let (prev_id, next_id) = {
                let node = current.read();
                (node.prev(), node.next())
            };
            let prev = self.pin_neighbour(prev_id)?;
            let next = self.pin_neighbour(next_id)?;
            let parent = if level < self.state.height {
                self.locate_index(level + 1, current.id(), &route, Access::ReadWrite)?
            } else {
                None
            };
            doomed.push(Unlink {
                node: current,
                prev,
                next,
            });

            let Some((parent, pos)) = parent else {
                return Ok((doomed, ParentEdit::Unindexed));
            };
            if next_id != INVALID_ID && !self.indexes_next(&parent, pos, next_id)? {
                return Ok((
                    doomed,
                    ParentEdit::Repoint {
                        parent,
                        pos,
                        to: next_id,
                    },
                ));
            }
            if parent.read().record_count() > 1 {
                return Ok((
                    doomed,
                    ParentEdit::Remove {
                        parent,
                        pos,
                        level: level + 1,
                    },
                ));
            }
            if parent.id() == self.state.root {
                let next = self.pin_neighbour(parent.read().next())?;
                return Ok((doomed, ParentEdit::EmptyRoot { root: parent, next }));
            }
            route = parent.read().record(0)?.key.to_vec();
            current = parent;
            level += 1;
        }
    }

    /// Retry freeing a leaf that a failed delete left empty.
    pub(crate) fn free_leaf(&mut self, id: NodeId) -> Result<(), BtreeError> {
        let tree = self.tree;
        if id == self.state.root || !self.state.bitmap.is_allocated(id) {
            return Ok(());
        }
        let handle = tree.node(&self.state, id, Access::ReadWrite)?;
        let (prev, next) = {
            let node = handle.read();
            if node.record_count() > 0 || node.kind()? != NodeKind::Leaf {
                return Ok(());
            }
            (node.prev(), node.next())
        };

        // Any key of a neighbour leads to the index records around the leaf.
        let mut route = None;
        for (neighbour, last) in [(prev, true), (next, false)] {
            if neighbour == INVALID_ID {
                continue;
            }
            let other = tree.node(&self.state, neighbour, Access::Read)?;
            let node = other.read();
            let count = node.record_count();
            if count > 0 {
                route = Some(node.record(if last { count - 1 } else { 0 })?.key.to_vec());
                break;
            }
        }
        let Some(route) = route else {
            debug!(tree = tree.id, node = id, "no route to empty leaf");
            return Ok(());
        };
        self.unlink_empty(handle, 1, &route)
    }

    /// Find the record at `level` that points at `child`, searching with
    /// `route` and then in the neighbours of the node it leads to.
    pub(crate) fn locate_index(
        &mut self,
        level: u16,
        child: NodeId,
        route: &[u8],
        access: Access,
    ) -> Result<Option<(NodeRef<'t>, usize)>, BtreeError> {
        let tree = self.tree;
        let (located, bridges) = tree
            .descend(&self.state, Start::root(&self.state), route, level, access, None)?
            .into_parts();
        self.note_bridges(&bridges);

        let handle = located.handle;
        let expected = located.lookup.descend_position();
        let found = {
            let node = handle.read();
            if expected < node.record_count() && node.index_child(expected)? == child {
                Some(expected)
            } else {
                node.find_child(child)?
            }
        };
        if let Some(pos) = found {
            return Ok(Some((handle, pos)));
        }

        let (prev, next) = {
            let node = handle.read();
            (node.prev(), node.next())
        };
        drop(handle);
        for neighbour in [next, prev] {
            if neighbour == INVALID_ID {
                continue;
            }
            let candidate = tree.node(&self.state, neighbour, access)?;
            let found = candidate.read().find_child(child)?;
            if let Some(pos) = found {
                return Ok(Some((candidate, pos)));
            }
        }
        Ok(None)
    }

    /// Raise the separator of `child` at `level` to its new first key.
    ///
    /// Runs bottom-up: a separator below its child's first key is still
    /// valid, so stopping early leaves a consistent tree.
    fn raise_separator(
        &mut self,
        level: u16,
        child: NodeId,
        route: &[u8],
        first: &[u8],
    ) -> Result<(), BtreeError> {
        if level > self.state.height {
            return Ok(());
        }
        let Some((handle, pos)) = self.locate_index(level, child, route, Access::ReadWrite)? else {
            return Ok(());
        };
        let old = handle.read().record(pos)?.key.to_vec();
        if self.tree.comparator.compare(&old, first) != Ordering::Less {
            return Ok(());
        }

        self.replace_separator(&handle, level, pos, first, child)?;
        if pos == 0 && level < self.state.height {
            let id = handle.id();
            self.raise_separator(level + 1, id, &old, first)?;
        }
        Ok(())
    }

    /// Merge an underfull node with a sibling under the same parent.
    ///
    /// A node with a left sibling under its parent merges into it, the
    /// first child of a parent absorbs its right sibling. The other side is
    /// tried when the records do not fit.
    fn try_merge(&mut self, handle: NodeRef<'t>, level: u16, first: &[u8]) -> Result<(), BtreeError> {
        let tree = self.tree;
        let id = handle.id();
        let (prev, next) = {
            let node = handle.read();
            (node.prev(), node.next())
        };

        let parent = if level < self.state.height {
            self.locate_index(level + 1, id, first, Access::Read)?
                .map(|(parent, pos)| (pos, parent.read().record_count()))
        } else {
            None
        };
        let sides: [Option<Side>; 2] = match parent {
            Some((pos, count)) if pos > 0 => [Some(Side::Left), (pos + 1 < count).then_some(Side::Right)],
            Some((pos, count)) if pos + 1 < count => [Some(Side::Right), None],
            Some(_) => [None, None],
            None => [Some(Side::Left), Some(Side::Right)],
        };

        for side in sides.into_iter().flatten() {
            let neighbour = match side {
                Side::Left => prev,
                Side::Right => next,
            };
            if neighbour == INVALID_ID {
                continue;
            }
            let other = tree.node(&self.state, neighbour, Access::ReadWrite)?;
            let fits = match side {
                Side::Left => can_merge(&other, &handle)?,
                Side::Right => can_merge(&handle, &other)?,
            };
            if !fits {
                continue;
            }
            return match side {
                Side::Left => self.merge_nodes(other, handle, level),
                Side::Right => self.merge_nodes(handle, other, level),
            };
        }
        Ok(())
    }

    /// Append every record of `right` to `left` and free `right`.
    ///
    /// The merge is skipped when dropping the index record of `right` would
    /// empty its parent or hand its keys to a different subtree, and when
    /// both nodes are empty.
    fn merge_nodes(&mut self, left: NodeRef<'t>, right: NodeRef<'t>, level: u16) -> Result<(), BtreeError> {
        let tree = self.tree;
        let (records, right_first, after_id) = {
            let node = right.read();
            (node.raw_records()?, node.first_key()?, node.next())
        };
        // An empty right node is found next to the record of `left`.
        let route = match right_first {
            Some(key) => Some(key),
            None => {
                let node = left.read();
                match node.record_count() {
                    0 => None,
                    count => Some(node.record(count - 1)?.key.to_vec()),
                }
            }
        };
        let after = self.pin_neighbour(after_id)?;
        let parent = if level < self.state.height {
            let Some(route) = route else {
                return Ok(());
            };
            self.locate_index(level + 1, right.id(), &route, Access::ReadWrite)?
        } else {
            None
        };
        if let Some((parent, pos)) = &parent {
            if *pos == 0 || parent.read().record_count() < 2 {
                debug!(tree = tree.id, level, node = right.id(), "merge would orphan keys");
                return Ok(());
            }
        }

        {
            let mut node = left.write();
            let start = node.record_count();
            for (i, raw) in records.iter().enumerate() {
                node.place_raw(start + i, raw)?;
            }
            node.set_next(after_id);
        }
        if let Some(after) = &after {
            after.write().set_prev(left.id());
        }
        let removed = match &parent {
            Some((parent, pos)) => {
                let mut node = parent.write();
                let key = node.record(*pos)?.key.to_vec();
                node.delete(*pos)?;
                Some(key)
            }
            None => None,
        };

        let left_id = left.id();
        let right_id = right.id();
        self.state.bitmap.release(right_id)?;
        tree.cache.destroy(right);
        drop(left);
        drop(after);
        self.changed = true;
        debug!(
            tree = tree.id,
            level,
            left = left_id,
            right = right_id,
            moved = records.len(),
            "merged nodes"
        );

        match (parent, removed) {
            (Some((parent, pos)), Some(key)) => self.after_remove(parent, level + 1, pos, &key),
            _ => Ok(()),
        }
    }

    /// Collapse the root while it has a single child, and replace an empty
    /// root by its right sibling.
    fn shrink_root(&mut self) -> Result<(), BtreeError> {
        let tree = self.tree;
        loop {
            let root_id = self.state.root;
            let root = tree.node(&self.state, root_id, Access::ReadWrite)?;
            let (count, next) = {
                let node = root.read();
                (node.record_count(), node.next())
            };

            if next != INVALID_ID {
                if count > 0 {
                    return Ok(());
                }
                tree.node(&self.state, next, Access::ReadWrite)?
                    .write()
                    .set_prev(INVALID_ID);
                self.state.bitmap.release(root_id)?;
                tree.cache.destroy(root);
                self.state.root = next;
                self.changed = true;
                debug!(tree = tree.id, old_root = root_id, root = next, "replaced empty root");
                continue;
            }
            if self.state.height == 1 {
                return Ok(());
            }

            match count {
                0 => {
                    root.write().init(root_id, NodeKind::Leaf);
                    self.state.height = 1;
                    self.changed = true;
                    debug!(tree = tree.id, root = root_id, "reset empty root");
                    return Ok(());
                }
                1 => {
                    let child = root.read().index_child(0)?;
                    let child_next = tree.node(&self.state, child, Access::Read)?.read().next();
                    if child_next != INVALID_ID {
                        self.todos.push_back(Todo::IndexChild {
                            level: self.state.height,
                            child: child_next,
                            anchor: None,
                        });
                        return Ok(());
                    }
                    self.state.bitmap.release(root_id)?;
                    tree.cache.destroy(root);
                    self.state.root = child;
                    self.state.height -= 1;
                    self.changed = true;
                    debug!(
                        tree = tree.id,
                        old_root = root_id,
                        root = child,
                        height = self.state.height,
                        "demoted root"
                    );
                }
                _ => return Ok(()),
            }
        }
    }
}

/// Whether `right` fits into the free space of `left`.
fn can_merge(left: &NodeRef<'_>, right: &NodeRef<'_>) -> Result<bool, BtreeError> {
    let l = left.read();
    let r = right.read();
    Ok(l.kind()? == r.kind()? && l.free_space() >= r.used_space())
}
