//! Deletes interleaved with inserts.

use crate::e2e_tests::helpers::*;
use crate::storage::btree::Errno;

#[test]
fn test_delete_then_reinsert_new_value() {
    let test = TestTree::new();
    test.insert_all(&shuffled(200, 3));
    let before = test.check();

    test.tree.delete(&key(77)).expect("Failed to delete");
    assert_eq!(test.tree.find(&key(77)).expect_err("deleted").errno(), Errno::ENOENT);
    test.tree.insert(&key(77), b"replaced").expect("Failed to reinsert");

    assert_eq!(test.tree.find(&key(77)).expect("Failed to find"), b"replaced".to_vec());
    let after = test.check();
    assert_eq!(after.records, before.records);
    assert_eq!(after.height, before.height);
}

#[test]
fn test_delete_half_in_random_order() {
    let test = TestTree::new();
    test.insert_all(&shuffled(300, 11));

    let doomed: Vec<u32> = shuffled(300, 12).into_iter().filter(|k| k % 2 == 0).collect();
    for (i, &k) in doomed.iter().enumerate() {
        test.tree.delete(&key(k)).expect("Failed to delete");
        if i % 25 == 0 {
            let _ = test.check();
        }
    }

    let expected: Vec<u32> = (0..300).filter(|k| k % 2 == 1).collect();
    assert_eq!(test.keys(), expected);
    let report = test.check();
    assert_eq!(report.records, 150);
    assert_eq!(report.dangling, 0);
}

#[test]
fn test_drain_to_empty_and_refill() {
    let test = TestTree::new();
    let keys = shuffled(250, 5);
    test.insert_all(&keys);
    for &k in &keys {
        test.tree.delete(&key(k)).expect("Failed to delete");
    }

    assert!(test.keys().is_empty());
    assert_eq!(test.tree.height(), 1);
    let stats = test.tree.stats();
    assert_eq!(stats.free_nodes, stats.total_nodes - 2, "only head and root remain");

    test.insert_all(&keys);
    assert_eq!(test.keys(), (0..250).collect::<Vec<_>>());
    let _ = test.check();
}

#[test]
fn test_delete_absent_keys_changes_nothing() {
    let test = TestTree::new();
    test.insert_all(&[2, 4, 6]);
    let version = test.tree.stats().version;

    for k in [1, 3, 5, 7] {
        assert_eq!(test.tree.delete(&key(k)).expect_err("absent").errno(), Errno::ENOENT);
    }
    assert_eq!(test.tree.stats().version, version);
    assert_eq!(test.keys(), vec![2, 4, 6]);
}
