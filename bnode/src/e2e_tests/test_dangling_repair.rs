//! A split whose index update cannot be made leaves the new node dangling.
//! Lookups bridge to it until a repair indexes it.

use crate::config::TreeConfig;
use crate::e2e_tests::helpers::*;
use crate::storage::btree::{Bridge, Errno, Search};

fn tiny_config(max_nodes: u32) -> TreeConfig {
    TreeConfig {
        max_nodes: Some(max_nodes),
        ..small_config()
    }
}

#[test]
fn test_split_without_room_for_new_root() {
    let test = TestTree::with_config(tiny_config(3));
    test.insert_all(&[1, 2, 3]);

    // Splitting [1, 2, 3] takes the last free node; the new root does not fit.
    let err = test.tree.insert(&key(4), &value(4)).expect_err("no room for a root");
    assert_eq!(err.errno(), Errno::ENOSPC);
    assert_eq!(test.tree.height(), 1);

    // The record was placed all the same.
    assert_eq!(test.tree.find(&key(4)).expect("Failed to find"), value(4).to_vec());
    match test.tree.search(&key(4)).expect("Failed to search") {
        Search::Repaired { value: found, bridges } => {
            assert_eq!(found, Some(value(4).to_vec()));
            assert_eq!(bridges, vec![Bridge { level: 1, from: 1, to: 2 }]);
        }
        Search::Clean(_) => panic!("expected a bridged lookup"),
    }

    let report = test.check();
    assert_eq!(report.dangling, 1);
    assert_eq!(report.records, 4);
}

#[test]
fn test_writes_continue_while_dangling() {
    let test = TestTree::with_config(tiny_config(3));
    test.insert_all(&[1, 2, 3]);
    let _ = test.tree.insert(&key(4), &value(4));

    // Fits beside 3 and 4; the pending root growth still cannot run.
    test.tree.insert(&key(5), &value(5)).expect("Failed to insert");
    assert_eq!(test.keys(), vec![1, 2, 3, 4, 5]);
    assert!(test.tree.stats().pending_repairs > 0);
}

#[test]
fn test_repair_after_reopen_with_room() {
    let test = TestTree::with_config(tiny_config(3));
    test.insert_all(&[1, 2, 3]);
    let _ = test.tree.insert(&key(4), &value(4));
    test.tree.insert(&key(5), &value(5)).expect("Failed to insert");

    let test = test.reopen(tiny_config(16));
    test.tree.finish_recovery();
    assert_eq!(test.tree.stats().pending_repairs, 0, "queue is not persisted");

    assert!(test.tree.search(&key(4)).expect("Failed to search").is_repaired());
    assert_eq!(test.tree.repair().expect("Failed to repair"), 1);
    assert_eq!(test.tree.height(), 2);

    let search = test.tree.search(&key(4)).expect("Failed to search");
    assert!(!search.is_repaired());
    assert_eq!(search.value(), Some(value(4).as_slice()));

    let report = test.check();
    assert_eq!(report.dangling, 0);
    assert_eq!(report.records, 5);
    assert_eq!(test.tree.repair().expect("Failed to repair"), 0);
}
