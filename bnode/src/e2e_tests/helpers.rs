//! Common helpers for scenario tests.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::TreeConfig;
use crate::storage::btree::{Btree, CheckReport};
use crate::storage::compare::ByteOrder;
use crate::storage::memory::MemoryStore;
use crate::testing::init_tracing;

pub use crate::testing::{key, small_config, value};

/// Tree id used by every scenario.
pub const TREE: u32 = 1;

/// A tree on an in-memory store that outlives it, so the tree can be
/// reopened from what was synced.
pub struct TestTree {
    pub store: Arc<MemoryStore>,
    pub tree: Btree,
}

impl TestTree {
    /// Fresh tree with 128-byte nodes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    #[must_use]
    #[allow(clippy::disallowed_methods, clippy::expect_used)] // Arc::clone is required for shared ownership
    pub fn with_config(config: TreeConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStore::new(0));
        let tree = Btree::create(Arc::<MemoryStore>::clone(&store), TREE, config, Arc::new(ByteOrder))
            .expect("Failed to create tree");
        Self { store, tree }
    }

    /// Sync, drop the tree and open it again with `config`.
    #[must_use]
    #[allow(clippy::disallowed_methods, clippy::expect_used)] // Arc::clone is required for shared ownership
    pub fn reopen(self, config: TreeConfig) -> Self {
        self.tree.sync().expect("Failed to sync tree");
        let Self { store, tree } = self;
        drop(tree);
        let tree = Btree::open(Arc::<MemoryStore>::clone(&store), TREE, config, Arc::new(ByteOrder))
            .expect("Failed to open tree");
        Self { store, tree }
    }

    /// Insert `key(k) -> value(k)` for every `k`.
    #[allow(clippy::expect_used)]
    pub fn insert_all(&self, keys: &[u32]) {
        for &k in keys {
            self.tree.insert(&key(k), &value(k)).expect("Failed to insert");
        }
    }

    /// Every key in leaf-chain order, decoded back to integers.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn keys(&self) -> Vec<u32> {
        let cursor = self.tree.cursor().expect("Failed to open cursor");
        cursor
            .map(|entry| {
                let (k, _) = entry.expect("Failed to read entry");
                u32::from_be_bytes(k.as_slice().try_into().expect("4-byte key"))
            })
            .collect()
    }

    /// Run the structural checker, failing the test on any violation.
    #[must_use]
    pub fn check(&self) -> CheckReport {
        match self.tree.check() {
            Ok(report) => report,
            Err(e) => panic!("tree check failed: {e}"),
        }
    }
}

/// `0..n` in a seeded random order.
#[must_use]
pub fn shuffled(n: u32, seed: u64) -> Vec<u32> {
    let mut keys: Vec<u32> = (0..n).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));
    keys
}
