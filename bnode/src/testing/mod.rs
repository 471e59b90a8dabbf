//! Shared helpers for unit and scenario tests.

use std::sync::Arc;

use crate::config::TreeConfig;
use crate::storage::btree::Btree;
use crate::storage::compare::ByteOrder;
use crate::storage::memory::MemoryStore;
use crate::storage::store::NodeStore;

/// Route `tracing` output to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Big-endian key, so numeric order matches byte order.
#[must_use]
pub const fn key(k: u32) -> [u8; 4] {
    k.to_be_bytes()
}

/// Eight-byte value derived from `k`.
#[must_use]
pub fn value(k: u32) -> [u8; 8] {
    (0xA5A5_A5A5_0000_0000 | u64::from(k)).to_le_bytes()
}

/// Configuration with 128-byte nodes: three 4-byte-key/8-byte-value
/// records per leaf, four index records per index node.
#[must_use]
pub fn small_config() -> TreeConfig {
    TreeConfig::with_node_size(TreeConfig::MIN_NODE_SIZE)
}

/// Fresh tree on an in-memory store.
#[allow(clippy::expect_used)]
#[must_use]
pub fn small_tree() -> Btree {
    init_tracing();
    let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::new(0));
    Btree::create(store, 1, small_config(), Arc::new(ByteOrder)).expect("create tree")
}
