//! Store failures surface as errors and leave the tree usable.
//!
//! A read can fail in the middle of a split, a merge or the index work
//! behind them. The tree must pass the checker right after such a failure
//! and lose nothing once repairs have run.

use crate::config::TreeConfig;
use crate::e2e_tests::helpers::*;
use crate::storage::btree::Errno;
use crate::storage::memory::FaultConfig;

/// Every idle node is evicted, so nearly every step of an operation reads
/// from the store.
fn uncached_config() -> TreeConfig {
    TreeConfig {
        passive_capacity: 0,
        ..small_config()
    }
}

fn flaky_reads() -> FaultConfig {
    FaultConfig {
        read_error_rate: 0.15,
        ..FaultConfig::no_faults()
    }
}

/// Queue bridges for every dangling node and index them all.
fn heal(test: &TestTree, keys: impl Iterator<Item = u32> + Clone) {
    for _ in 0..8 {
        for k in keys.clone() {
            let _ = test.tree.search(&key(k)).expect("Failed to search");
        }
        if test.tree.repair().expect("Failed to repair") == 0 {
            break;
        }
    }
}

#[test]
fn test_failed_sync_retried() {
    let test = TestTree::new();
    test.insert_all(&shuffled(60, 4));

    test.store.set_fault_config(FaultConfig {
        write_error_rate: 1.0,
        ..FaultConfig::no_faults()
    });
    let err = test.tree.sync().expect_err("writes fail");
    assert_eq!(err.errno(), Errno::EIO);

    test.store.set_fault_config(FaultConfig::no_faults());
    let test = test.reopen(small_config());
    test.tree.finish_recovery();
    assert_eq!(test.keys(), (0..60).collect::<Vec<_>>());
    let _ = test.check();
}

#[test]
fn test_failed_store_sync() {
    let test = TestTree::new();
    test.insert_all(&[1, 2, 3]);

    test.store.set_fault_config(FaultConfig {
        sync_error_rate: 1.0,
        ..FaultConfig::no_faults()
    });
    assert_eq!(test.tree.sync().expect_err("sync fails").errno(), Errno::EIO);
    assert!(test.store.stats().injected_sync_errors > 0);

    test.store.set_fault_config(FaultConfig::no_faults());
    test.tree.sync().expect("Failed to sync");
}

#[test]
fn test_read_failures_change_nothing() {
    let test = TestTree::new();
    test.insert_all(&shuffled(80, 8));
    let test = test.reopen(small_config());
    test.tree.finish_recovery();
    let before = test.tree.stats();

    test.store.set_fault_config(FaultConfig::failing_reads());
    assert_eq!(test.tree.find(&key(5)).expect_err("reads fail").errno(), Errno::EIO);
    assert_eq!(
        test.tree.insert(&key(500), &value(500)).expect_err("reads fail").errno(),
        Errno::EIO
    );
    assert_eq!(test.tree.delete(&key(5)).expect_err("reads fail").errno(), Errno::EIO);

    test.store.set_fault_config(FaultConfig::no_faults());
    assert_eq!(test.tree.stats().version, before.version);
    assert_eq!(test.keys(), (0..80).collect::<Vec<_>>());
    test.tree.insert(&key(500), &value(500)).expect("Failed to insert");
}

#[test]
fn test_read_failures_during_deletes() {
    let test = TestTree::with_config(uncached_config());
    test.insert_all(&shuffled(150, 3));

    let mut failed = Vec::new();
    for k in shuffled(150, 11).into_iter().filter(|k| k % 3 != 0) {
        test.store.set_fault_config(flaky_reads());
        let result = test.tree.delete(&key(k));
        test.store.set_fault_config(FaultConfig::no_faults());
        if let Err(e) = result {
            assert_eq!(e.errno(), Errno::EIO, "delete of {k}");
            failed.push(k);
        }
        let _ = test.check();
    }
    assert!(test.store.stats().injected_read_errors > 0);

    // A failed delete may already have removed its record.
    for k in failed {
        if let Err(e) = test.tree.delete(&key(k)) {
            assert_eq!(e.errno(), Errno::ENOENT, "retried delete of {k}");
        }
    }
    heal(&test, 0..150);

    let kept: Vec<u32> = (0..150).filter(|k| k % 3 == 0).collect();
    assert_eq!(test.keys(), kept);
    for &k in &kept {
        assert_eq!(test.tree.find(&key(k)).expect("Failed to find"), value(k).to_vec());
    }
    let report = test.check();
    assert_eq!(report.records, kept.len());
    assert_eq!(report.dangling, 0);
}

#[test]
fn test_read_failures_during_splits() {
    let test = TestTree::with_config(uncached_config());

    let mut failed = Vec::new();
    for k in shuffled(200, 5) {
        test.store.set_fault_config(flaky_reads());
        let result = test.tree.insert(&key(k), &value(k));
        test.store.set_fault_config(FaultConfig::no_faults());
        if let Err(e) = result {
            assert_eq!(e.errno(), Errno::EIO, "insert of {k}");
            failed.push(k);
        }
        let _ = test.check();
    }
    assert!(!failed.is_empty());

    // A failed insert may have placed its record before the index work failed.
    for k in failed {
        if let Err(e) = test.tree.insert(&key(k), &value(k)) {
            assert_eq!(e.errno(), Errno::EEXIST, "retried insert of {k}");
        }
    }
    heal(&test, 0..200);

    assert_eq!(test.keys(), (0..200).collect::<Vec<_>>());
    for k in 0..200 {
        assert_eq!(test.tree.find(&key(k)).expect("Failed to find"), value(k).to_vec());
    }
    let report = test.check();
    assert_eq!(report.records, 200);
    assert_eq!(report.dangling, 0);
}

#[test]
fn test_read_failures_while_emptying_tree() {
    let test = TestTree::with_config(uncached_config());
    test.insert_all(&(0..120).collect::<Vec<_>>());

    let mut remaining: Vec<u32> = (0..120).collect();
    for round in 0..10 {
        let mut left = Vec::new();
        for k in remaining {
            test.store.set_fault_config(flaky_reads());
            let result = test.tree.delete(&key(k));
            test.store.set_fault_config(FaultConfig::no_faults());
            match result {
                Ok(()) => {}
                Err(e) if e.errno() == Errno::ENOENT && round > 0 => {}
                Err(e) => {
                    assert_eq!(e.errno(), Errno::EIO, "delete of {k}");
                    left.push(k);
                }
            }
            let _ = test.check();
        }
        remaining = left;
        if remaining.is_empty() {
            break;
        }
    }
    for k in remaining {
        let _ = test.tree.delete(&key(k));
    }
    heal(&test, 0..120);

    assert!(test.keys().is_empty());
    let report = test.check();
    assert_eq!(report.records, 0);
    assert_eq!(report.dangling, 0);
}
