//! Trees on a directory of files survive closing and reopening.

use std::sync::Arc;

use crate::config::TreeConfig;
use crate::e2e_tests::helpers::*;
use crate::storage::btree::{Btree, Errno};
use crate::storage::compare::ByteOrder;
use crate::storage::file::FileStore;
use crate::testing::init_tracing;

fn config() -> TreeConfig {
    TreeConfig::with_node_size(512)
}

#[test]
fn test_file_tree_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let keys = shuffled(2000, 9);

    {
        let store = Arc::new(FileStore::open(dir.path()).expect("Failed to open store"));
        let tree = Btree::create(store, TREE, config(), Arc::new(ByteOrder))
            .expect("Failed to create tree");
        for &k in &keys {
            tree.insert(&key(k), &value(k)).expect("Failed to insert");
        }
        for k in (0..2000).step_by(3) {
            tree.delete(&key(k)).expect("Failed to delete");
        }
        tree.sync().expect("Failed to sync");
    }

    let store = Arc::new(FileStore::open(dir.path()).expect("Failed to reopen store"));
    assert!(store.tree_path(TREE).exists());
    let tree = Btree::open(store, TREE, config(), Arc::new(ByteOrder)).expect("Failed to open tree");
    tree.finish_recovery();

    for k in 0..2000 {
        let result = tree.find(&key(k));
        if k % 3 == 0 {
            assert_eq!(result.expect_err("deleted").errno(), Errno::ENOENT);
        } else {
            assert_eq!(result.expect("Failed to find"), value(k).to_vec());
        }
    }
    let report = tree.check().expect("Failed to check");
    assert_eq!(report.records, 2000 - 667);
}

#[test]
fn test_open_absent_tree() {
    init_tracing();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Arc::new(FileStore::open(dir.path()).expect("Failed to open store"));

    let err = Btree::open(store, TREE, config(), Arc::new(ByteOrder)).expect_err("no such tree");
    assert_eq!(err.errno(), Errno::ENOENT);
}

#[test]
fn test_memory_tree_reopen_keeps_version() {
    let test = TestTree::new();
    test.insert_all(&shuffled(100, 2));
    let before = test.tree.stats();

    let test = test.reopen(small_config());
    let after = test.tree.stats();
    assert_eq!(after.version, before.version);
    assert_eq!(after.root, before.root);
    assert_eq!(after.height, before.height);
    assert_eq!(after.free_nodes, before.free_nodes);
    assert_eq!(test.keys(), (0..100).collect::<Vec<_>>());
}
