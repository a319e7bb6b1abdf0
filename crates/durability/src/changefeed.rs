//! Changefeed: the ordered stream of committed mutations.
//!
//! Records live in the `cdc:` prefix of the shared keyspace. They are staged
//! into the committing transaction's own batch, inside the commit critical
//! section, so feed sequence order equals commit order and a crash can never
//! separate a commit from its feed records: WAL replay rebuilds both from
//! the same batch.
//!
//! Consumers poll by `(start_seq, limit, timeout)`; a subscriber is nothing
//! but its `last_seq`, and any number of them share the one log. Retention
//! trims from the oldest end by bytes and age; the byte bound is applied
//! first, the age bound to whatever survives.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use themis_core::key::{cdc_key, cdc_seq, KeyPrefix};
use themis_core::{Result, Value};
use themis_storage::{KvEngine, KvRead, WriteBatch};

/// What a changefeed record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// An entity was written.
    Put,
    /// An entity was tombstoned.
    Delete,
    /// A transaction's records end here.
    TxnCommit,
    /// A transaction with staged writes was rolled back.
    TxnRollback,
}

/// One record of the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Feed sequence: gap-free within the retained suffix, totally ordered
    /// by commit order.
    pub seq: u64,
    /// Commit wall-clock time, milliseconds since the epoch.
    pub ts_ms: i64,
    /// Record kind.
    pub kind: ChangeKind,
    /// Affected table; empty for transaction markers.
    pub table: String,
    /// Affected primary key; empty for transaction markers.
    pub key: String,
    /// Post-image for puts; `None` for deletes and markers.
    pub value_after: Option<Value>,
}

impl ChangeRecord {
    /// Persisted binary form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    /// Decode the persisted binary form.
    pub fn decode(bytes: &[u8]) -> Result<ChangeRecord> {
        bincode::deserialize(bytes).map_err(Into::into)
    }

    /// JSON rendering for external consumers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "seq": self.seq,
            "ts_ms": self.ts_ms,
            "kind": match self.kind {
                ChangeKind::Put => "put",
                ChangeKind::Delete => "delete",
                ChangeKind::TxnCommit => "txn_commit",
                ChangeKind::TxnRollback => "txn_rollback",
            },
            "table": self.table,
            "key": self.key,
            "value_after": self.value_after.as_ref().map(Value::to_json),
        })
    }
}

/// A pending record, before a feed sequence is assigned.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// Record kind.
    pub kind: ChangeKind,
    /// Affected table.
    pub table: String,
    /// Affected primary key.
    pub key: String,
    /// Post-image for puts.
    pub value_after: Option<Value>,
}

/// The feed handle. Clones share one sequence counter and one notifier.
pub struct Changefeed {
    engine: KvEngine,
    next_seq: AtomicU64,
    wakeup: Mutex<u64>,
    arrived: Condvar,
}

impl Changefeed {
    /// Open over an engine, continuing after the highest persisted record.
    pub fn open(engine: KvEngine) -> Result<Changefeed> {
        let snapshot = engine.snapshot();
        let prefix = KeyPrefix::Cdc.as_bytes();
        let last = snapshot
            .scan(prefix, themis_core::key::prefix_end(prefix).as_deref(), true, 1)
            .into_iter()
            .next()
            .map(|(key, _)| cdc_seq(&key))
            .transpose()?
            .unwrap_or(0);
        Ok(Changefeed {
            engine,
            next_seq: AtomicU64::new(last + 1),
            wakeup: Mutex::new(last),
            arrived: Condvar::new(),
        })
    }

    /// Highest assigned feed sequence, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire) - 1
    }

    /// Assign sequences to `pending` and stage the rows into `batch`.
    ///
    /// Must run inside the commit critical section: sequence assignment
    /// order has to match batch apply order for the feed to publish in
    /// commit order. Returns the last assigned sequence.
    pub fn stage(
        &self,
        batch: &mut WriteBatch,
        ts_ms: i64,
        pending: Vec<PendingChange>,
    ) -> Result<u64> {
        let count = pending.len() as u64;
        let first = self.next_seq.fetch_add(count, Ordering::AcqRel);
        let mut seq = first;
        for p in pending {
            let record = ChangeRecord {
                seq,
                ts_ms,
                kind: p.kind,
                table: p.table,
                key: p.key,
                value_after: p.value_after,
            };
            batch.put(cdc_key(seq), record.encode()?);
            seq += 1;
        }
        Ok(seq.saturating_sub(1))
    }

    /// Roll the sequence counter back to `last_seq + 1` after a staged
    /// batch failed before apply. Only valid while the caller still holds
    /// the commit critical section, so no later stage can have happened.
    pub fn rewind(&self, last_seq: u64) {
        self.next_seq.store(last_seq + 1, Ordering::Release);
    }

    /// Wake pollers after the batch holding staged records was applied.
    pub fn publish(&self, through_seq: u64) {
        let mut published = self.wakeup.lock();
        if through_seq > *published {
            *published = through_seq;
        }
        self.arrived.notify_all();
    }

    /// Fetch up to `limit` records with `seq > start_seq`, waiting up to
    /// `timeout` for the first one.
    pub fn poll(&self, start_seq: u64, limit: usize, timeout: Duration) -> Result<Vec<ChangeRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.fetch(start_seq, limit)?;
            if !records.is_empty() {
                return Ok(records);
            }
            let mut published = self.wakeup.lock();
            if *published > start_seq {
                // Raced with a publish between fetch and lock; re-fetch.
                continue;
            }
            if self
                .arrived
                .wait_until(&mut published, deadline)
                .timed_out()
            {
                return Ok(Vec::new());
            }
        }
    }

    fn fetch(&self, start_seq: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let snapshot = self.engine.snapshot();
        let start = cdc_key(start_seq.saturating_add(1));
        let end = themis_core::key::prefix_end(KeyPrefix::Cdc.as_bytes());
        snapshot
            .scan(&start, end.as_deref(), false, limit)
            .into_iter()
            .map(|(_, bytes)| ChangeRecord::decode(&bytes))
            .collect()
    }

    /// Build the batch of deletions the retention policy calls for.
    ///
    /// `retention_bytes` keeps the newest records whose encoded size fits the
    /// budget; `retention_ms` then drops survivors older than the horizon.
    /// Zero disables the respective bound. The engine crate commits the
    /// returned batch through the normal commit path.
    pub fn trim_batch(
        &self,
        retention_bytes: u64,
        retention_ms: u64,
        now_ms: i64,
    ) -> Result<Option<WriteBatch>> {
        if retention_bytes == 0 && retention_ms == 0 {
            return Ok(None);
        }
        let snapshot = self.engine.snapshot();
        let prefix = KeyPrefix::Cdc.as_bytes();
        let rows = snapshot.scan_prefix(prefix, usize::MAX);
        if rows.is_empty() {
            return Ok(None);
        }

        // Byte budget, newest first.
        let mut cut = 0usize; // rows[..cut] are dropped
        if retention_bytes > 0 {
            let mut budget = retention_bytes as i128;
            let mut keep_from = rows.len();
            for (i, (key, value)) in rows.iter().enumerate().rev() {
                budget -= (key.len() + value.len()) as i128;
                if budget < 0 {
                    break;
                }
                keep_from = i;
            }
            cut = keep_from;
        }
        // Age horizon on the survivors.
        if retention_ms > 0 {
            let horizon = now_ms - retention_ms as i64;
            while cut < rows.len() {
                let record = ChangeRecord::decode(&rows[cut].1)?;
                if record.ts_ms >= horizon {
                    break;
                }
                cut += 1;
            }
        }
        if cut == 0 {
            return Ok(None);
        }
        let mut batch = WriteBatch::new();
        for (key, _) in &rows[..cut] {
            batch.delete(key.clone());
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn commit_changes(engine: &KvEngine, feed: &Changefeed, changes: Vec<PendingChange>) {
        let mut batch = WriteBatch::new();
        let last = feed.stage(&mut batch, 1_000, changes).unwrap();
        engine.apply(&batch, engine.committed_seq() + 1);
        feed.publish(last);
    }

    fn put_change(key: &str) -> PendingChange {
        PendingChange {
            kind: ChangeKind::Put,
            table: "t".into(),
            key: key.into(),
            value_after: Some(Value::from(key)),
        }
    }

    #[test]
    fn sequences_are_gap_free_and_ordered() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine.clone()).unwrap();
        for i in 0..5 {
            commit_changes(&engine, &feed, vec![put_change(&format!("k{i}"))]);
        }
        let records = feed.poll(0, 100, Duration::ZERO).unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn poll_resumes_after_start_seq() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine.clone()).unwrap();
        commit_changes(&engine, &feed, vec![put_change("a"), put_change("b")]);
        commit_changes(&engine, &feed, vec![put_change("c")]);

        let page = feed.poll(2, 10, Duration::ZERO).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, "c");
    }

    #[test]
    fn poll_limit_is_honoured() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine.clone()).unwrap();
        commit_changes(
            &engine,
            &feed,
            (0..10).map(|i| put_change(&format!("k{i}"))).collect(),
        );
        assert_eq!(feed.poll(0, 3, Duration::ZERO).unwrap().len(), 3);
    }

    #[test]
    fn poll_blocks_until_publish() {
        let engine = KvEngine::new();
        let feed = Arc::new(Changefeed::open(engine.clone()).unwrap());

        let feed2 = Arc::clone(&feed);
        let poller = thread::spawn(move || feed2.poll(0, 10, Duration::from_secs(5)).unwrap());

        thread::sleep(Duration::from_millis(20));
        commit_changes(&engine, &feed, vec![put_change("late")]);
        let records = poller.join().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "late");
    }

    #[test]
    fn poll_times_out_empty() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine).unwrap();
        let records = feed.poll(0, 10, Duration::from_millis(10)).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn reopen_continues_sequence() {
        let engine = KvEngine::new();
        {
            let feed = Changefeed::open(engine.clone()).unwrap();
            commit_changes(&engine, &feed, vec![put_change("a")]);
        }
        let feed = Changefeed::open(engine.clone()).unwrap();
        assert_eq!(feed.last_seq(), 1);
        commit_changes(&engine, &feed, vec![put_change("b")]);
        let records = feed.poll(0, 10, Duration::ZERO).unwrap();
        assert_eq!(records.last().unwrap().seq, 2);
    }

    #[test]
    fn byte_retention_trims_oldest_first() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine.clone()).unwrap();
        for i in 0..20 {
            commit_changes(&engine, &feed, vec![put_change(&format!("k{i:02}"))]);
        }
        let batch = feed
            .trim_batch(200, 0, 2_000)
            .unwrap()
            .expect("something to trim");
        engine.apply(&batch, engine.committed_seq() + 1);

        let records = feed.poll(0, 100, Duration::ZERO).unwrap();
        assert!(!records.is_empty());
        assert!(records.len() < 20);
        // Retained suffix is still contiguous and ends at the newest record.
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(*seqs.last().unwrap(), 20);
    }

    #[test]
    fn age_retention_applies_after_bytes() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine.clone()).unwrap();
        // Two batches with distinct timestamps.
        let mut batch = WriteBatch::new();
        let last = feed.stage(&mut batch, 100, vec![put_change("old")]).unwrap();
        engine.apply(&batch, engine.committed_seq() + 1);
        feed.publish(last);

        let mut batch = WriteBatch::new();
        let last = feed.stage(&mut batch, 900, vec![put_change("new")]).unwrap();
        engine.apply(&batch, engine.committed_seq() + 1);
        feed.publish(last);

        // Horizon at now=1000 with retention 500: records older than 500 go.
        let trim = feed.trim_batch(0, 500, 1_000).unwrap().unwrap();
        engine.apply(&trim, engine.committed_seq() + 1);
        let records = feed.poll(0, 10, Duration::ZERO).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "new");
    }

    #[test]
    fn no_retention_configured_means_no_trim() {
        let engine = KvEngine::new();
        let feed = Changefeed::open(engine.clone()).unwrap();
        commit_changes(&engine, &feed, vec![put_change("x")]);
        assert!(feed.trim_batch(0, 0, 1_000).unwrap().is_none());
    }
}
