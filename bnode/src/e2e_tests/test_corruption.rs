//! Damaged blocks are reported while recovering and fatal afterwards.

use std::sync::Arc;

use crate::config::TreeConfig;
use crate::e2e_tests::helpers::*;
use crate::storage::btree::{Btree, Errno};
use crate::storage::compare::ByteOrder;
use crate::storage::memory::MemoryStore;

/// Build a tree of 30 keys, sync it, damage `offset` of node 1 (the leaf
/// holding key 0) and open the tree again.
#[allow(clippy::disallowed_methods, clippy::expect_used)] // Arc::clone is required for shared ownership
fn damaged_tree(config: &TreeConfig, offset: usize) -> Btree {
    let test = TestTree::with_config(config.clone());
    test.insert_all(&(0..30).collect::<Vec<_>>());
    test.tree.sync().expect("Failed to sync");

    let TestTree { store, tree } = test;
    drop(tree);
    assert!(store.corrupt(TREE, 1, offset));
    Btree::open(Arc::<MemoryStore>::clone(&store), TREE, config.clone(), Arc::new(ByteOrder))
        .expect("Failed to open tree")
}

#[test]
fn test_checksum_mismatch_reported_during_recovery() {
    let tree = damaged_tree(&small_config(), 40);
    assert!(tree.is_recovering());

    let err = tree.find(&key(0)).expect_err("damaged leaf");
    assert_eq!(err.errno(), Errno::EFAULT);
    assert!(err.is_corruption());

    // Leaves past the damaged one are still readable.
    assert_eq!(tree.find(&key(29)).expect("Failed to find"), value(29).to_vec());
}

#[test]
fn test_bad_magic_without_checksums() {
    let config = TreeConfig {
        checksums: false,
        ..small_config()
    };
    let tree = damaged_tree(&config, 0);

    let err = tree.find(&key(0)).expect_err("damaged leaf");
    assert_eq!(err.errno(), Errno::EINVAL);
    assert!(err.is_corruption());
}

#[test]
#[should_panic(expected = "structural corruption")]
fn test_corruption_fatal_after_recovery() {
    let tree = damaged_tree(&small_config(), 40);
    tree.finish_recovery();
    let _ = tree.find(&key(0));
}
