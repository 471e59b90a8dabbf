//! In-memory node store for deterministic testing.
//!
//! Blocks live in a hash map keyed by `(tree, node)`. Fault injection is
//! driven by a seeded RNG so a failing run can be replayed:
//! - block read errors
//! - block write errors
//! - sync errors
//!
//! `corrupt` flips bytes of a stored block to exercise the engine's
//! corruption handling.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::node::NodeId;
use crate::storage::store::{NodeStore, StoreError, TreeId};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Every read fails.
    #[must_use]
    pub const fn failing_reads() -> Self {
        Self {
            read_error_rate: 1.0,
            write_error_rate: 0.0,
            sync_error_rate: 0.0,
        }
    }
}

/// Statistics about memory store operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreStats {
    /// Number of block reads.
    pub reads: u64,
    /// Number of block writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
}

struct MemoryInner {
    blocks: HashMap<(TreeId, NodeId), Vec<u8>>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl MemoryInner {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

/// Node store keeping every block in memory.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Create a store without faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                blocks: HashMap::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Snapshot of the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats.clone()
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.lock().fault_config = config;
    }

    /// Whether a block has ever been written.
    #[must_use]
    pub fn contains(&self, tree: TreeId, node: NodeId) -> bool {
        self.lock().blocks.contains_key(&(tree, node))
    }

    /// Flip every bit of the byte at `offset` of a stored block.
    ///
    /// Returns `false` if the block does not exist.
    pub fn corrupt(&self, tree: TreeId, node: NodeId, offset: usize) -> bool {
        let mut inner = self.lock();
        match inner.blocks.get_mut(&(tree, node)) {
            Some(block) if offset < block.len() => {
                block[offset] ^= 0xFF;
                true
            }
            _ => false,
        }
    }
}

impl NodeStore for MemoryStore {
    fn read_or_create(
        &self,
        tree: TreeId,
        node: NodeId,
        count: u32,
        node_size: usize,
        create: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.lock();
        inner.stats.reads += 1;

        let rate = inner.fault_config.read_error_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.injected_read_errors += 1;
            return Err(StoreError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let mut buffer = vec![0u8; node_size * count as usize];
        for (i, chunk) in buffer.chunks_mut(node_size).enumerate() {
            let id = node + i as NodeId;
            match inner.blocks.get(&(tree, id)) {
                Some(block) => {
                    let len = block.len().min(node_size);
                    chunk[..len].copy_from_slice(&block[..len]);
                }
                None if create => {}
                None => return Err(StoreError::Missing { tree, node: id }),
            }
        }
        Ok(buffer)
    }

    fn write_back(&self, tree: TreeId, node: NodeId, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.stats.writes += 1;

        let rate = inner.fault_config.write_error_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.injected_write_errors += 1;
            return Err(StoreError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        inner.blocks.insert((tree, node), data.to_vec());
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.stats.syncs += 1;

        let rate = inner.fault_config.sync_error_rate;
        if inner.should_inject_fault(rate) {
            inner.stats.injected_sync_errors += 1;
            return Err(StoreError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        // Writes are already "durable" in memory.
        Ok(())
    }
}
