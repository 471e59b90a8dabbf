//! Keys and values of mixed lengths, and a caller-supplied key order.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TreeConfig;
use crate::storage::btree::{Btree, Errno};
use crate::storage::compare::FnComparator;
use crate::storage::memory::MemoryStore;
use crate::testing::init_tracing;

use super::helpers::{TREE, TestTree};

#[test]
fn test_mixed_lengths() {
    let config = TreeConfig::with_node_size(256);
    let max = config.max_record_len();
    let test = TestTree::with_config(config);
    let mut rng = StdRng::seed_from_u64(17);

    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for n in 0..300u32 {
        // Zero padding keeps keys unique while varying their length.
        let key = format!("k{n:0width$}", width = rng.random_range(1..12)).into_bytes();
        let value = vec![b'v'; rng.random_range(0..max / 2)];
        test.tree.insert(&key, &value).expect("Failed to insert");
        entries.push((key, value));
    }

    for (k, v) in &entries {
        assert_eq!(&test.tree.find(k).expect("Failed to find"), v);
    }
    entries.sort();
    let scanned: Vec<(Vec<u8>, Vec<u8>)> = test
        .tree
        .cursor()
        .expect("Failed to open cursor")
        .collect::<Result<_, _>>()
        .expect("Failed to scan");
    assert_eq!(scanned, entries);
    assert_eq!(test.check().records, entries.len());
}

#[test]
fn test_oversized_record_rejected() {
    let test = TestTree::new();
    let max = test.tree.config().max_record_len();
    let err = test.tree.insert(b"k", &vec![0; max]).expect_err("too large");
    assert_eq!(err.errno(), Errno::EINVAL);
    assert_eq!(test.tree.stats().version, 0);
}

#[test]
fn test_reverse_order_comparator() {
    init_tracing();
    let store = Arc::new(MemoryStore::new(0));
    let reverse = FnComparator(|record: &[u8], key: &[u8]| key.cmp(record));
    let tree = Btree::create(store, TREE, TreeConfig::with_node_size(128), Arc::new(reverse))
        .expect("Failed to create tree");

    for k in 0..50u32 {
        tree.insert(&k.to_be_bytes(), b"x").expect("Failed to insert");
    }
    let keys: Vec<u32> = tree
        .cursor()
        .expect("Failed to open cursor")
        .map(|entry| {
            let (k, _) = entry.expect("Failed to read entry");
            u32::from_be_bytes(k.as_slice().try_into().expect("4-byte key"))
        })
        .collect();
    assert_eq!(keys, (0..50).rev().collect::<Vec<_>>());
    assert_eq!(tree.search(&7u32.to_be_bytes()).expect("Failed to search").value(), Some(&b"x"[..]));
    assert_eq!(tree.count().expect("Failed to count"), 50);
}
