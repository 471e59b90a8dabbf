//! The seven-key scenario on three-record leaves.

use crate::e2e_tests::helpers::*;
use crate::storage::btree::Errno;

#[test]
fn test_seven_keys_build_two_levels() {
    let test = TestTree::new();
    test.insert_all(&[10, 20, 5, 15, 25, 1, 30]);

    assert_eq!(test.keys(), vec![1, 5, 10, 15, 20, 25, 30]);
    assert_eq!(test.tree.height(), 2);

    let report = test.check();
    assert_eq!(report.nodes_per_level, vec![3, 1]);
    assert_eq!(report.records, 7);
    assert_eq!(report.dangling, 0);
}

#[test]
fn test_seven_keys_delete_twenty() {
    let test = TestTree::new();
    test.insert_all(&[10, 20, 5, 15, 25, 1, 30]);

    test.tree.delete(&key(20)).expect("Failed to delete");

    assert_eq!(test.keys(), vec![1, 5, 10, 15, 25, 30]);
    let err = test.tree.find(&key(20)).expect_err("deleted key");
    assert_eq!(err.errno(), Errno::ENOENT);

    // [15] could not join [1, 5, 10], so [25, 30] was pulled into it.
    let report = test.check();
    assert_eq!(report.nodes_per_level, vec![2, 1]);
    for k in [1, 5, 10, 15, 25, 30] {
        assert_eq!(test.tree.find(&key(k)).expect("Failed to find"), value(k).to_vec());
    }
}
