//! Readers share the tree with each other and with a writer.

use std::thread;

use crate::e2e_tests::helpers::*;

#[test]
fn test_parallel_lookups() {
    let test = TestTree::new();
    test.insert_all(&shuffled(400, 21));
    let tree = &test.tree;

    thread::scope(|s| {
        for t in 0..4u32 {
            s.spawn(move || {
                for k in (t..400).step_by(4) {
                    assert_eq!(tree.find(&key(k)).expect("Failed to find"), value(k).to_vec());
                }
            });
        }
    });
}

#[test]
fn test_readers_alongside_writer() {
    let test = TestTree::new();
    let present: Vec<u32> = (0..200).map(|k| k * 2).collect();
    test.insert_all(&present);
    let tree = &test.tree;

    thread::scope(|s| {
        s.spawn(move || {
            for k in 0..200 {
                tree.insert(&key(k * 2 + 1), &value(k * 2 + 1)).expect("Failed to insert");
            }
        });
        for _ in 0..3 {
            s.spawn(move || {
                for _ in 0..5 {
                    for k in (0..200).map(|k| k * 2) {
                        assert_eq!(tree.find(&key(k)).expect("Failed to find"), value(k).to_vec());
                    }
                }
            });
        }
    });

    assert_eq!(test.keys(), (0..400).collect::<Vec<_>>());
    let _ = test.check();
}
