//! Full structural verification.
//!
//! Walks every level from its leftmost node along the sibling links and
//! checks:
//! - node kind per level and the byte layout of each node
//! - strict key order inside and across the nodes of a level
//! - `prev` links mirroring `next` links
//! - indexed children appearing in order in the level below, with a
//!   separator no larger than the child's first key
//! - every allocated node reachable, head included
//!
//! Nodes of a level that no index record points at are counted as
//! dangling; they are legal and are reached through sibling links.

use std::cmp::Ordering;

use crate::storage::btree::error::BtreeError;
use crate::storage::btree::tree::Btree;
use crate::storage::cache::Access;
use crate::storage::compare::KeyComparator;
use crate::storage::node::{INVALID_ID, NodeId, NodeKind};

/// Summary of a successful check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub height: u16,
    /// Node count per level, leaves first.
    pub nodes_per_level: Vec<usize>,
    pub records: usize,
    /// Nodes reachable only through a sibling link.
    pub dangling: usize,
}

/// One node of a level as seen by the walk.
struct Visited {
    id: NodeId,
    first: Option<Vec<u8>>,
    last: Option<Vec<u8>>,
}

fn inconsistent(message: String) -> BtreeError {
    BtreeError::Inconsistent(message)
}

impl Btree {
    /// Verify the whole tree.
    pub fn check(&self) -> Result<CheckReport, BtreeError> {
        let state = self.read_state();
        let cmp = self.comparator.as_ref();
        let limit = state.bitmap.total() as usize;

        let mut report = CheckReport {
            height: state.height,
            nodes_per_level: Vec::new(),
            records: 0,
            dangling: 0,
        };
        let mut reached = 1;
        let mut leftmost = state.root;
        let mut indexed: Option<Vec<(Vec<u8>, NodeId)>> = None;

        for level in (1..=state.height).rev() {
            let expected = if level == 1 { NodeKind::Leaf } else { NodeKind::Index };
            let mut chain: Vec<Visited> = Vec::new();
            let mut children = Vec::new();
            let mut last_key: Option<Vec<u8>> = None;
            let mut prev = INVALID_ID;
            let mut id = leftmost;

            while id != INVALID_ID {
                if chain.len() >= limit {
                    return Err(inconsistent(format!("sibling cycle at level {level}")));
                }
                if !state.bitmap.is_allocated(id) {
                    return Err(inconsistent(format!(
                        "level {level} links to unallocated node {id}"
                    )));
                }
                let handle = self.node(&state, id, Access::Read)?;
                let node = handle.read();
                let kind = node.kind()?;
                if kind != expected {
                    return Err(inconsistent(format!(
                        "node {id} at level {level} is {kind:?}, expected {expected:?}"
                    )));
                }
                node.verify_layout()?;
                if node.prev() != prev {
                    return Err(inconsistent(format!(
                        "node {id} has prev {}, expected {prev}",
                        node.prev()
                    )));
                }

                let count = node.record_count();
                for i in 0..count {
                    let record = node.record(i)?;
                    if let Some(last) = &last_key {
                        if cmp.compare(last, record.key) != Ordering::Less {
                            return Err(inconsistent(format!(
                                "record {i} of node {id} is out of order"
                            )));
                        }
                    }
                    last_key = Some(record.key.to_vec());
                    if level > 1 {
                        children.push((record.key.to_vec(), node.index_child(i)?));
                    }
                }
                if level == 1 {
                    report.records += count;
                }

                chain.push(Visited {
                    id,
                    first: node.first_key()?,
                    last: if count == 0 {
                        None
                    } else {
                        Some(node.record(count - 1)?.key.to_vec())
                    },
                });
                prev = id;
                id = node.next();
            }

            match indexed.take() {
                Some(upper) => report.dangling += match_children(cmp, level, &upper, &chain)?,
                None => report.dangling += chain.len().saturating_sub(1),
            }
            if level > 1 {
                leftmost = children
                    .first()
                    .map(|(_, child)| *child)
                    .ok_or_else(|| inconsistent(format!("index level {level} has no records")))?;
            }
            reached += chain.len();
            report.nodes_per_level.push(chain.len());
            indexed = Some(children);
        }
        report.nodes_per_level.reverse();

        let allocated = (state.bitmap.total() - state.bitmap.free_count()) as usize;
        if reached != allocated {
            return Err(inconsistent(format!(
                "{allocated} nodes allocated but {reached} reachable"
            )));
        }
        Ok(report)
    }
}

/// Check the index records of the level above against this level's chain.
/// Returns the number of chain nodes no record points at.
fn match_children(
    cmp: &dyn KeyComparator,
    level: u16,
    upper: &[(Vec<u8>, NodeId)],
    chain: &[Visited],
) -> Result<usize, BtreeError> {
    let mut dangling = 0;
    let mut pos = 0;
    for (i, (separator, child)) in upper.iter().enumerate() {
        let Some(offset) = chain[pos..].iter().position(|v| v.id == *child) else {
            return Err(inconsistent(format!(
                "indexed node {child} missing from level {level} or out of order"
            )));
        };
        if i == 0 && offset != 0 {
            return Err(inconsistent(format!(
                "leftmost node of level {level} is not indexed first"
            )));
        }
        let target = &chain[pos + offset];
        if let Some(first) = &target.first {
            if cmp.compare(separator, first) == Ordering::Greater {
                return Err(inconsistent(format!(
                    "separator of node {child} is above its first key"
                )));
            }
        }
        if i > 0 {
            if let Some(last) = chain[pos + offset - 1].last.as_ref() {
                if cmp.compare(separator, last) != Ordering::Greater {
                    return Err(inconsistent(format!(
                        "separator of node {child} does not exceed its left neighbour"
                    )));
                }
            }
        }
        dangling += offset;
        pos += offset + 1;
    }
    Ok(dangling + chain.len() - pos)
}
