//! Ordered iteration along the leaf chain.

use std::sync::RwLockReadGuard;

use crate::storage::btree::error::BtreeError;
use crate::storage::btree::traverse::Start;
use crate::storage::btree::tree::{Btree, TreeState};
use crate::storage::cache::{Access, NodeRef};
use crate::storage::node::INVALID_ID;

/// Iterator over tree entries in key order.
///
/// Holds the tree's read lock: writers on the same tree block until the
/// cursor is dropped.
pub struct Cursor<'t> {
    tree: &'t Btree,
    state: RwLockReadGuard<'t, TreeState>,
    leaf: Option<NodeRef<'t>>,
    position: usize,
}

impl Btree {
    /// Cursor positioned at the smallest key.
    pub fn cursor(&self) -> Result<Cursor<'_>, BtreeError> {
        let state = self.read_state();
        let mut id = state.root;
        for _ in 1..state.height {
            let handle = self.node(&state, id, Access::Read)?;
            id = handle.read().index_child(0)?;
        }
        let leaf = self.node(&state, id, Access::Read)?;
        Ok(Cursor {
            tree: self,
            state,
            leaf: Some(leaf),
            position: 0,
        })
    }

    /// Cursor positioned at the smallest key not below `key`.
    pub fn cursor_from(&self, key: &[u8]) -> Result<Cursor<'_>, BtreeError> {
        let state = self.read_state();
        let (located, bridges) = self
            .descend(&state, Start::root(&state), key, 1, Access::Read, None)?
            .into_parts();
        self.queue_bridges(&bridges, state.height);
        Ok(Cursor {
            tree: self,
            state,
            leaf: Some(located.handle),
            position: located.lookup.insert_position(),
        })
    }

    /// Number of records, counted along the leaf chain.
    pub fn count(&self) -> Result<usize, BtreeError> {
        let mut cursor = self.cursor()?;
        let mut count = 0;
        while cursor.next_entry()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl Cursor<'_> {
    /// Get the next entry.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BtreeError> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };
            let next = {
                let node = leaf.read();
                if self.position < node.record_count() {
                    let record = node.record(self.position)?;
                    let entry = (record.key.to_vec(), record.value.to_vec());
                    self.position += 1;
                    return Ok(Some(entry));
                }
                node.next()
            };

            self.leaf = if next == INVALID_ID {
                None
            } else {
                Some(self.tree.node(&self.state, next, Access::Read)?)
            };
            self.position = 0;
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), BtreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
