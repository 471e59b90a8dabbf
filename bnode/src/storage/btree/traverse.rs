//! Root-to-level descent.
//!
//! A descent binary-searches one node per level. When the chosen record is
//! the last one of its node and the node has a right sibling, the sibling is
//! searched as well: if the key does not sort before the sibling's first
//! record, the sibling is an unindexed ("dangling") half of an earlier split
//! and the descent crosses over to it. Empty siblings are crossed as well.
//! Every crossing is reported as a [`Bridge`] so the missing index record can
//! be added later.

use tracing::warn;

use crate::storage::btree::error::BtreeError;
use crate::storage::btree::tree::{Btree, TreeState};
use crate::storage::cache::{Access, NodeRef};
use crate::storage::node::{INVALID_ID, Lookup, NodeId, NodeKind};

/// A sibling link the descent had to follow because the parent level does
/// not index `to` yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bridge {
    /// Level of both nodes; leaves are level 1.
    pub level: u16,
    pub from: NodeId,
    pub to: NodeId,
}

/// One level of a descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    pub node: NodeId,
    /// Record the descent chose (or would insert after).
    pub position: usize,
    pub level: u16,
}

/// Nodes visited by a descent, root first.
#[derive(Debug, Default)]
pub struct TraverseStack {
    entries: Vec<StackEntry>,
}

impl TraverseStack {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn push(&mut self, entry: StackEntry) {
        self.entries.push(entry);
    }

    /// The entry recorded for `level`.
    #[must_use]
    pub fn at(&self, level: u16) -> Option<StackEntry> {
        self.entries.iter().copied().find(|e| e.level == level)
    }
}

/// The node a descent stopped at.
pub struct Located<'t> {
    pub handle: NodeRef<'t>,
    pub lookup: Lookup,
    pub level: u16,
}

/// Result of a descent.
pub enum Traversal<'t> {
    /// Every node on the path was reachable through the index.
    Clean(Located<'t>),
    /// The path crossed dangling siblings; each bridge still needs an index
    /// record one level up.
    Repair {
        located: Located<'t>,
        bridges: Vec<Bridge>,
    },
}

impl<'t> Traversal<'t> {
    #[must_use]
    pub fn into_parts(self) -> (Located<'t>, Vec<Bridge>) {
        match self {
            Self::Clean(located) => (located, Vec::new()),
            Self::Repair { located, bridges } => (located, bridges),
        }
    }

    #[must_use]
    pub const fn is_repair(&self) -> bool {
        matches!(self, Self::Repair { .. })
    }
}

/// Where a descent begins.
#[derive(Debug, Clone, Copy)]
pub struct Start {
    pub node: NodeId,
    pub level: u16,
}

impl Start {
    #[must_use]
    pub const fn root(state: &TreeState) -> Self {
        Self {
            node: state.root,
            level: state.height,
        }
    }
}

impl Btree {
    /// Descend from `start` to `till_level`.
    ///
    /// Nodes above `till_level` are pinned read-only and released as soon as
    /// the child is known; the node at `till_level` is returned pinned with
    /// `access`.
    pub(crate) fn descend<'t>(
        &'t self,
        state: &TreeState,
        start: Start,
        key: &[u8],
        till_level: u16,
        access: Access,
        mut stack: Option<&mut TraverseStack>,
    ) -> Result<Traversal<'t>, BtreeError> {
        if till_level == 0 || till_level > start.level {
            return Err(BtreeError::Inconsistent(format!(
                "cannot descend from level {} to level {till_level}",
                start.level
            )));
        }

        let cmp = self.comparator.as_ref();
        let mut bridges = Vec::new();
        let mut node_id = start.node;
        let mut level = start.level;

        loop {
            let mode = if level == till_level { access } else { Access::Read };
            let mut handle = self.node(state, node_id, mode)?;
            let mut lookup = handle.read().binary_search(key, cmp)?;

            loop {
                let (count, next) = {
                    let node = handle.read();
                    (node.record_count(), node.next())
                };
                let at_last = match lookup {
                    Lookup::Predecessor(pos) => pos + 1 == count,
                    Lookup::BeforeFirst => count == 0,
                    Lookup::Exact(_) => false,
                };
                if !at_last || next == INVALID_ID {
                    break;
                }
                let sibling = self.node(state, next, mode)?;
                let (sibling_lookup, sibling_empty) = {
                    let node = sibling.read();
                    (node.binary_search(key, cmp)?, node.record_count() == 0)
                };
                // An empty sibling is stepped over; a dangling node may follow.
                if sibling_lookup == Lookup::BeforeFirst && !sibling_empty {
                    break;
                }
                warn!(
                    tree = self.id,
                    level,
                    from = handle.id(),
                    to = next,
                    "crossing dangling sibling"
                );
                bridges.push(Bridge {
                    level,
                    from: handle.id(),
                    to: next,
                });
                handle = sibling;
                lookup = sibling_lookup;
            }

            let expected = if level == 1 { NodeKind::Leaf } else { NodeKind::Index };
            let kind = handle.read().kind()?;
            if kind != expected {
                return Err(BtreeError::Inconsistent(format!(
                    "node {} at level {level} is {kind:?}, expected {expected:?}",
                    handle.id()
                )));
            }

            let position = lookup.descend_position();
            if let Some(stack) = stack.as_deref_mut() {
                stack.push(StackEntry {
                    node: handle.id(),
                    position,
                    level,
                });
            }

            if level == till_level {
                let located = Located {
                    handle,
                    lookup,
                    level,
                };
                return Ok(if bridges.is_empty() {
                    Traversal::Clean(located)
                } else {
                    Traversal::Repair { located, bridges }
                });
            }

            node_id = {
                let node = handle.read();
                if node.record_count() == 0 {
                    return Err(BtreeError::Inconsistent(format!(
                        "index node {} has no records",
                        handle.id()
                    )));
                }
                node.index_child(position)?
            };
            level -= 1;
        }
    }
}
