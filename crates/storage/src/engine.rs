//! The ordered MVCC map at the heart of the KV engine.
//!
//! Every key holds a version chain: `(commit_seq, value | tombstone)` pairs
//! in ascending sequence order. A reader at snapshot `s` sees the newest
//! version with sequence `<= s`. Batches apply atomically under the writer
//! lock with a single sequence number, so a snapshot taken between commits
//! can never observe half a transaction.
//!
//! Version chains are pruned by `gc`, which keeps the newest version at or
//! below the oldest active snapshot plus everything newer. The compaction
//! driver in the engine crate calls it after sealing log segments.

use crate::batch::WriteBatch;
use crate::locks::LockTable;
use crate::snapshot::Snapshot;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) type ValueRef = Arc<Vec<u8>>;

/// Versions of one key, ascending by sequence.
#[derive(Debug, Clone, Default)]
pub(crate) struct VersionChain {
    pub(crate) versions: SmallVec<[(u64, Option<ValueRef>); 2]>,
}

impl VersionChain {
    /// Newest version visible at `seq`.
    pub(crate) fn visible_at(&self, seq: u64) -> Option<&ValueRef> {
        self.versions
            .iter()
            .rev()
            .find(|(vseq, _)| *vseq <= seq)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Sequence of the newest version, tombstones included. 0 when empty.
    pub(crate) fn latest_seq(&self) -> u64 {
        self.versions.last().map_or(0, |(seq, _)| *seq)
    }

    fn push(&mut self, seq: u64, value: Option<ValueRef>) {
        debug_assert!(seq > self.latest_seq());
        self.versions.push((seq, value));
    }

    /// Drop versions superseded below `horizon`. Returns dropped count and
    /// whether the whole chain is now garbage (single tombstone at or below
    /// the horizon).
    fn prune(&mut self, horizon: u64) -> (usize, bool) {
        // Index of the newest version still needed for readers at `horizon`.
        let keep_from = self
            .versions
            .iter()
            .rposition(|(seq, _)| *seq <= horizon)
            .unwrap_or(0);
        let dropped = keep_from;
        if keep_from > 0 {
            self.versions.drain(..keep_from);
        }
        let garbage = self.versions.len() == 1
            && self.versions[0].1.is_none()
            && self.versions[0].0 <= horizon;
        (dropped, garbage)
    }
}

pub(crate) struct EngineInner {
    pub(crate) map: RwLock<BTreeMap<Vec<u8>, VersionChain>>,
    committed_seq: AtomicU64,
    snapshots: Mutex<BTreeMap<u64, usize>>,
    locks: LockTable,
}

/// The shared KV engine handle. Cheap to clone; all clones see one store.
#[derive(Clone)]
pub struct KvEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Default for KvEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine {
    /// Empty engine at sequence 0.
    pub fn new() -> Self {
        KvEngine {
            inner: Arc::new(EngineInner {
                map: RwLock::new(BTreeMap::new()),
                committed_seq: AtomicU64::new(0),
                snapshots: Mutex::new(BTreeMap::new()),
                locks: LockTable::new(),
            }),
        }
    }

    /// Last committed sequence.
    pub fn committed_seq(&self) -> u64 {
        self.inner.committed_seq.load(Ordering::Acquire)
    }

    /// Force the committed sequence. Only recovery and restore call this,
    /// before any snapshot exists.
    pub fn force_seq(&self, seq: u64) {
        self.inner.committed_seq.store(seq, Ordering::Release);
    }

    /// Take an immutable snapshot of the current committed state.
    pub fn snapshot(&self) -> Snapshot {
        let seq = self.committed_seq();
        *self.inner.snapshots.lock().entry(seq).or_insert(0) += 1;
        Snapshot::new(Arc::clone(&self.inner), seq)
    }

    pub(crate) fn register_snapshot(inner: &EngineInner, seq: u64) {
        *inner.snapshots.lock().entry(seq).or_insert(0) += 1;
    }

    pub(crate) fn release_snapshot(inner: &EngineInner, seq: u64) {
        let mut snaps = inner.snapshots.lock();
        if let Some(count) = snaps.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                snaps.remove(&seq);
            }
        }
    }

    /// Oldest sequence still pinned by a live snapshot.
    pub fn min_active_snapshot(&self) -> Option<u64> {
        self.inner.snapshots.lock().keys().next().copied()
    }

    /// Apply a batch atomically at `seq`.
    ///
    /// `seq` must be greater than the current committed sequence; the
    /// transaction manager serialises commit and allocates sequences, so this
    /// is an invariant, not a runtime case.
    pub fn apply(&self, batch: &WriteBatch, seq: u64) {
        let mut map = self.inner.map.write();
        debug_assert!(seq > self.committed_seq());
        for (key, op) in batch.iter() {
            let chain = map.entry(key.clone()).or_default();
            chain.push(seq, op.as_ref().map(|v| Arc::new(v.clone())));
        }
        self.inner.committed_seq.store(seq, Ordering::Release);
    }

    /// Latest committed sequence that touched `key` (tombstones included).
    /// 0 when the key was never written. This is the version checked by
    /// optimistic conflict detection.
    pub fn committed_version(&self, key: &[u8]) -> u64 {
        self.inner
            .map
            .read()
            .get(key)
            .map_or(0, VersionChain::latest_seq)
    }

    /// Latest sequence that touched `key` at or below `seq` (tombstones
    /// included), 0 when none. The version a snapshot reader actually saw;
    /// for-update fingerprints record this.
    pub fn version_at(&self, key: &[u8], seq: u64) -> u64 {
        self.inner.map.read().get(key).map_or(0, |chain| {
            chain
                .versions
                .iter()
                .rev()
                .find(|(vseq, _)| *vseq <= seq)
                .map_or(0, |(vseq, _)| *vseq)
        })
    }

    /// Read the newest committed value, bypassing snapshots.
    pub fn get_latest(&self, key: &[u8]) -> Option<Vec<u8>> {
        let map = self.inner.map.read();
        map.get(key)
            .and_then(|c| c.visible_at(u64::MAX))
            .map(|v| v.as_ref().clone())
    }

    /// The pessimistic lock table.
    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    /// Count keys visible at `seq` under `prefix`, stopping at `cap`.
    /// The planner's selectivity probe; `cap` bounds planning cost.
    pub fn count_prefix(&self, prefix: &[u8], seq: u64, cap: usize) -> usize {
        let end = themis_core::key::prefix_end(prefix);
        let map = self.inner.map.read();
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &VersionChain)>> = match &end {
            Some(end) => Box::new(map.range(prefix.to_vec()..end.clone())),
            None => Box::new(map.range(prefix.to_vec()..)),
        };
        let mut count = 0;
        for (_, chain) in range {
            if chain.visible_at(seq).is_some() {
                count += 1;
                if count >= cap {
                    break;
                }
            }
        }
        count
    }

    /// Prune version chains below the GC horizon: the oldest active snapshot,
    /// or the committed sequence when no snapshot is live. Returns
    /// `(versions_dropped, chains_removed)`.
    pub fn gc(&self) -> (usize, usize) {
        let horizon = self
            .min_active_snapshot()
            .unwrap_or_else(|| self.committed_seq());
        let mut dropped = 0;
        let mut removed = 0;
        let mut map = self.inner.map.write();
        map.retain(|_, chain| {
            let (d, garbage) = chain.prune(horizon);
            dropped += d;
            if garbage {
                dropped += 1;
                removed += 1;
                false
            } else {
                true
            }
        });
        if dropped > 0 {
            debug!(horizon, dropped, removed, "kv gc pass");
        }
        (dropped, removed)
    }

    /// Number of keys with any version, live or tombstoned. Test hook.
    pub fn chain_count(&self) -> usize {
        self.inner.map.read().len()
    }
}
