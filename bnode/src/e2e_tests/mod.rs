//! End-to-end scenarios against complete trees.
//!
//! Each test file covers a specific scenario, using deterministic inputs
//! (fixed key sets or seeded shuffles) and the structural checker to verify
//! the tree after every phase.

#![cfg(test)]

mod helpers;

mod test_concurrent_readers;
mod test_corruption;
mod test_dangling_repair;
mod test_delete_reinsert;
mod test_fault_injection;
mod test_file_persistence;
mod test_front_inserts;
mod test_round_trip;
mod test_seven_keys;
mod test_variable_records;
