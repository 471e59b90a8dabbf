//! Keys that land in front of a node's first record.
//!
//! Such an insert lowers the separators above the node, so a later split
//! indexes its new right half after the left one.

use crate::e2e_tests::helpers::*;
use crate::storage::btree::Search;

#[test]
fn test_reinsert_below_deleted_first_key() {
    let test = TestTree::new();
    test.insert_all(&[10, 20, 5, 15, 25]);
    test.tree.delete(&key(10)).expect("Failed to delete");
    test.insert_all(&[1, 2, 3]);

    assert_eq!(test.keys(), vec![1, 2, 3, 5, 15, 20, 25]);
    for k in [1, 2, 3, 5, 15, 20, 25] {
        assert_eq!(test.tree.find(&key(k)).expect("Failed to find"), value(k).to_vec());
    }
    let report = test.check();
    assert_eq!(report.dangling, 0);
    assert_eq!(report.records, 7);
}

#[test]
fn test_split_of_first_leaf_searches_clean() {
    let test = TestTree::new();
    test.insert_all(&[10, 20, 5, 15, 25, 1, 30, 2]);

    assert_eq!(test.tree.repair().expect("Failed to repair"), 0);
    for k in [1, 2, 5, 10, 15, 20, 25, 30] {
        match test.tree.search(&key(k)).expect("Failed to search") {
            Search::Clean(found) => assert_eq!(found, Some(value(k).to_vec()), "key {k}"),
            Search::Repaired { bridges, .. } => panic!("key {k} crossed {bridges:?}"),
        }
    }
    assert_eq!(test.check().dangling, 0);
    assert_eq!(test.tree.stats().pending_repairs, 0);
}

#[test]
fn test_shuffled_sets_checked_after_every_insert() {
    for seed in [2, 4, 5] {
        let test = TestTree::new();
        let keys = shuffled(60, seed);
        for (i, &k) in keys.iter().enumerate() {
            test.tree.insert(&key(k), &value(k)).expect("Failed to insert");
            let report = test.check();
            assert_eq!(report.records, i + 1, "seed {seed}");
            assert_eq!(report.dangling, 0, "seed {seed} after key {k}");
        }
        assert_eq!(test.keys(), (0..60).collect::<Vec<_>>(), "seed {seed}");
    }
}

#[test]
fn test_many_small_shuffled_sets() {
    for seed in 0..40 {
        let test = TestTree::new();
        test.insert_all(&shuffled(60, seed));
        assert_eq!(test.keys(), (0..60).collect::<Vec<_>>(), "seed {seed}");
        for k in 0..60 {
            assert_eq!(
                test.tree.find(&key(k)).expect("Failed to find"),
                value(k).to_vec(),
                "seed {seed} key {k}"
            );
        }
        assert_eq!(test.check().dangling, 0, "seed {seed}");
    }
}

#[test]
fn test_descending_then_ascending_deletes() {
    let test = TestTree::new();
    let keys: Vec<u32> = (0..90).rev().collect();
    test.insert_all(&keys);
    for k in 0..45 {
        test.tree.delete(&key(k)).expect("Failed to delete");
        assert_eq!(test.check().records, 89 - k as usize);
    }
    assert_eq!(test.keys(), (45..90).collect::<Vec<_>>());
    test.insert_all(&(0..45).rev().collect::<Vec<_>>());
    assert_eq!(test.keys(), (0..90).collect::<Vec<_>>());
    assert_eq!(test.check().dangling, 0);
}
