//! Key ordering used by every search inside the tree.

use std::cmp::Ordering;

/// Total order over record keys.
///
/// `compare(record_key, key)` answers how a key stored in a node relates to
/// the key being searched for. Implementations must be a strict total order:
/// the tree never stores two records that compare equal.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, record_key: &[u8], key: &[u8]) -> Ordering;
}

/// Plain lexicographic byte ordering.
///
/// Big-endian integer keys sort numerically under this order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteOrder;

impl KeyComparator for ByteOrder {
    fn compare(&self, record_key: &[u8], key: &[u8]) -> Ordering {
        record_key.cmp(key)
    }
}

/// Adapter turning a closure into a [`KeyComparator`].
#[derive(Debug, Clone, Copy)]
pub struct FnComparator<F>(pub F);

impl<F> KeyComparator for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, record_key: &[u8], key: &[u8]) -> Ordering {
        (self.0)(record_key, key)
    }
}
