//! Atomic write batches.
//!
//! A batch is the unit of commit: every entity write and every derived index
//! mutation of a transaction lands in one `WriteBatch`, applied to the engine
//! under a single sequence number. Keys are kept sorted so application order
//! is deterministic and lock acquisition can follow canonical key order.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// One staged mutation: a value, or a tombstone.
pub type BatchOp = Option<Vec<u8>>;

/// An ordered set of staged mutations. Last write per key wins.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, BatchOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        WriteBatch::default()
    }

    /// Stage a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert(key, Some(value));
    }

    /// Stage a tombstone.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, None);
    }

    /// Remove a staged op, if any. Used when a later mutation in the same
    /// transaction supersedes an index entry before commit.
    pub fn unstage(&mut self, key: &[u8]) {
        self.ops.remove(key);
    }

    /// Read through the batch: `Some(Some(v))` staged put, `Some(None)`
    /// staged tombstone, `None` not staged.
    pub fn get(&self, key: &[u8]) -> Option<&BatchOp> {
        self.ops.get(key)
    }

    /// Stage a put only if the key has no staged op yet.
    pub fn put_if_absent(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if let Entry::Vacant(e) = self.ops.entry(key) {
            e.insert(Some(value));
        }
    }

    /// Number of staged ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sorted iteration over staged ops.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &BatchOp)> {
        self.ops.iter()
    }

    /// Staged ops within `[start, end)`, in key order.
    pub fn range_ops(&self, start: &[u8], end: Option<&[u8]>) -> Vec<(Vec<u8>, BatchOp)> {
        self.ops
            .iter()
            .filter(|(k, _)| {
                k.as_slice() >= start && end.map_or(true, |e| k.as_slice() < e)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Sorted keys, for lock acquisition.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.ops.keys().cloned().collect()
    }

    /// Consume into sorted ops.
    pub fn into_ops(self) -> BTreeMap<Vec<u8>, BatchOp> {
        self.ops
    }

    /// Fold another batch in; the other batch's ops win on shared keys.
    pub fn merge(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Total staged payload bytes, for backpressure accounting.
    pub fn payload_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|(k, v)| k.len() + v.as_ref().map_or(0, Vec::len))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let mut b = WriteBatch::new();
        b.put(b"k".to_vec(), b"v1".to_vec());
        b.put(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(b.len(), 1);
        assert_eq!(b.get(b"k"), Some(&Some(b"v2".to_vec())));

        b.delete(b"k".to_vec());
        assert_eq!(b.get(b"k"), Some(&None));
    }

    #[test]
    fn iteration_is_sorted() {
        let mut b = WriteBatch::new();
        b.put(b"c".to_vec(), vec![]);
        b.put(b"a".to_vec(), vec![]);
        b.put(b"b".to_vec(), vec![]);
        let keys: Vec<_> = b.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn range_ops_bounds() {
        let mut b = WriteBatch::new();
        for k in ["a", "b", "c", "d"] {
            b.put(k.as_bytes().to_vec(), vec![]);
        }
        let ops = b.range_ops(b"b", Some(b"d"));
        let keys: Vec<_> = ops.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
