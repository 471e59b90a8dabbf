//! Insert many keys, read every one back.

use crate::e2e_tests::helpers::*;

const N: u32 = 500;

fn assert_round_trip(test: &TestTree, keys: &[u32]) {
    for &k in keys {
        let found = test.tree.find(&key(k)).expect("Failed to find");
        assert_eq!(found, value(k).to_vec(), "value of key {k}");
    }
    assert_eq!(test.keys(), (0..N).collect::<Vec<_>>());

    let report = test.check();
    assert_eq!(report.records, N as usize);
    assert_eq!(report.dangling, 0);
    assert!(report.nodes_per_level[0] >= 3, "at least three splits");
}

#[test]
fn test_ascending_inserts() {
    let test = TestTree::new();
    let keys: Vec<u32> = (0..N).collect();
    test.insert_all(&keys);
    assert_round_trip(&test, &keys);
}

#[test]
fn test_descending_inserts() {
    let test = TestTree::new();
    let keys: Vec<u32> = (0..N).rev().collect();
    test.insert_all(&keys);
    assert_round_trip(&test, &keys);
}

#[test]
fn test_shuffled_inserts() {
    for seed in [1, 7, 42] {
        let test = TestTree::new();
        let keys = shuffled(N, seed);
        test.insert_all(&keys);
        assert_round_trip(&test, &keys);
        assert_eq!(test.tree.stats().version, u64::from(N));
    }
}

#[test]
fn test_missing_keys_between_present_ones() {
    let test = TestTree::new();
    let keys: Vec<u32> = (0..N).map(|k| k * 2).collect();
    test.insert_all(&keys);

    for k in 0..N {
        assert!(test.tree.search(&key(k * 2 + 1)).expect("Failed to search").value().is_none());
    }
    assert_eq!(test.tree.count().expect("Failed to count"), N as usize);
}
