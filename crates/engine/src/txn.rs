//! Transactions.
//!
//! Snapshot isolation with optimistic conflict detection. A transaction
//! buffers every write (entity plus derived index rows) in one batch and
//! sees its own writes through an overlay view. Commit:
//!
//! 1. acquire pessimistic locks on written and for-update keys in canonical
//!    (sorted byte) order
//! 2. under the commit lock, validate for-update fingerprints and
//!    first-committer-wins on the write set; failures carry the conflicting
//!    commit sequence
//! 3. stage changefeed rows into the same batch, append the WAL record,
//!    apply atomically, run the deferred in-memory index updates
//! 4. release locks, wake changefeed pollers
//!
//! Read-only transactions never lock and never validate. Rollback discards
//! the buffer; an explicit rollback of a transaction that staged writes
//! leaves a `TxnRollback` audit record in the WAL and the feed.

use crate::database::DbCore;
use crate::indexer::{self, RuntimeOp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use themis_core::key;
use themis_core::{Result, ThemisError, Value};
use themis_durability::changefeed::{ChangeKind, PendingChange};
use themis_durability::wal::WalRecord;
use themis_graph::EdgeRef;
use themis_storage::{KvRead, OverlayView, Snapshot, WriteBatch};
use tracing::debug;

/// Retry policy for the closure transaction API.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts before giving up on retryable errors.
    pub max_attempts: usize,
    /// Base backoff; attempt `n` sleeps `base * 2^n`.
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            backoff: Duration::from_millis(5),
        }
    }
}

/// An open transaction. Commit consumes it; dropping without commit
/// discards the buffered writes.
pub struct Transaction {
    core: Arc<DbCore>,
    id: u64,
    snapshot: Snapshot,
    batch: WriteBatch,
    events: Vec<PendingChange>,
    for_update: HashMap<Vec<u8>, u64>,
    runtime_ops: Vec<RuntimeOp>,
}

impl Transaction {
    pub(crate) fn begin(core: Arc<DbCore>) -> Transaction {
        let id = core.next_txn_id();
        let snapshot = core.kv.snapshot();
        Transaction {
            core,
            id,
            snapshot,
            batch: WriteBatch::new(),
            events: Vec::new(),
            for_update: HashMap::new(),
            runtime_ops: Vec::new(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The read snapshot.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    fn decode_visible(&self, table: &str, bytes: &[u8]) -> Result<Option<Value>> {
        let value = Value::decode(bytes)?;
        if self.core.is_expired(table, &value) {
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Read an entity through the transaction's own view.
    pub fn get(&self, table: &str, pk: &str) -> Result<Option<Value>> {
        let view = OverlayView::new(&self.snapshot, &self.batch);
        match view.get(&key::entity_key(table, pk)) {
            Some(bytes) => self.decode_visible(table, &bytes),
            None => Ok(None),
        }
    }

    /// Read an entity and register it for commit-time validation: if any
    /// other transaction commits this key before we do, commit fails with
    /// `Conflict` carrying the winning sequence.
    pub fn get_for_update(&mut self, table: &str, pk: &str) -> Result<Option<Value>> {
        let entity_key = key::entity_key(table, pk);
        let version = self.core.kv.version_at(&entity_key, self.snapshot.seq());
        self.for_update.insert(entity_key, version);
        self.get(table, pk)
    }

    /// Write an entity. With `overwrite` unset the key must not exist in
    /// this transaction's view, else `Exists`.
    pub fn put(&mut self, table: &str, pk: &str, value: Value, overwrite: bool) -> Result<()> {
        if table.is_empty() || pk.is_empty() {
            return Err(ThemisError::invalid_value("table and pk must be non-empty"));
        }
        value.validate()?;
        let entity_key = key::entity_key(table, pk);
        let old = {
            let view = OverlayView::new(&self.snapshot, &self.batch);
            view.get(&entity_key)
                .map(|bytes| Value::decode(&bytes))
                .transpose()?
        };
        if old.is_some() && !overwrite {
            return Err(ThemisError::exists(table, pk));
        }

        let indexes = self.core.registry.table(table);
        let mut staged = WriteBatch::new();
        {
            let view = OverlayView::new(&self.snapshot, &self.batch);
            indexer::stage_transition(
                &indexes,
                pk,
                old.as_ref(),
                Some(&value),
                &view,
                &mut staged,
                &mut self.runtime_ops,
            )?;
        }
        staged.put(entity_key, value.encode()?);
        self.batch.merge(staged);
        self.events.push(PendingChange {
            kind: ChangeKind::Put,
            table: table.to_string(),
            key: pk.to_string(),
            value_after: Some(value),
        });
        Ok(())
    }

    /// Delete an entity. Idempotent: deleting an absent key is a no-op and
    /// emits no changefeed record.
    pub fn delete(&mut self, table: &str, pk: &str) -> Result<()> {
        let entity_key = key::entity_key(table, pk);
        let old = {
            let view = OverlayView::new(&self.snapshot, &self.batch);
            view.get(&entity_key)
                .map(|bytes| Value::decode(&bytes))
                .transpose()?
        };
        let old = match old {
            Some(v) => v,
            None => return Ok(()),
        };

        let indexes = self.core.registry.table(table);
        let mut staged = WriteBatch::new();
        {
            let view = OverlayView::new(&self.snapshot, &self.batch);
            indexer::stage_transition(
                &indexes,
                pk,
                Some(&old),
                None,
                &view,
                &mut staged,
                &mut self.runtime_ops,
            )?;
        }
        staged.delete(entity_key);
        self.batch.merge(staged);
        self.events.push(PendingChange {
            kind: ChangeKind::Delete,
            table: table.to_string(),
            key: pk.to_string(),
            value_after: None,
        });
        Ok(())
    }

    /// Ordered scan of a table through the transaction's view.
    pub fn scan(
        &self,
        table: &str,
        start_pk: Option<&str>,
        end_pk: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>> {
        let view = OverlayView::new(&self.snapshot, &self.batch);
        scan_table(&self.core, &view, table, start_pk, end_pk, limit)
    }

    // ========================================================================
    // Graph mutations
    // ========================================================================

    /// Add an edge to a named graph.
    pub fn add_edge(
        &mut self,
        graph: &str,
        from: &str,
        to: &str,
        edge_id: &str,
        label: &str,
        props: Value,
    ) -> Result<()> {
        props.validate()?;
        themis_graph::store::stage_add_edge(
            graph,
            &EdgeRef {
                from: from.to_string(),
                to: to.to_string(),
                edge_id: edge_id.to_string(),
                label: label.to_string(),
                props,
            },
            &mut self.batch,
        )
    }

    /// Remove an edge.
    pub fn remove_edge(&mut self, graph: &str, from: &str, to: &str, edge_id: &str) {
        themis_graph::store::stage_remove_edge(graph, from, to, edge_id, &mut self.batch);
    }

    /// Attach a label to a vertex.
    pub fn set_vertex_label(&mut self, graph: &str, label: &str, vertex: &str) {
        themis_graph::store::stage_set_label(graph, label, vertex, &mut self.batch);
    }

    /// Detach a label from a vertex.
    pub fn remove_vertex_label(&mut self, graph: &str, label: &str, vertex: &str) {
        themis_graph::store::stage_remove_label(graph, label, vertex, &mut self.batch);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Commit. Returns the commit sequence; a read-only transaction commits
    /// trivially at its snapshot sequence.
    pub fn commit(self) -> Result<u64> {
        let Transaction {
            core,
            id,
            snapshot,
            batch,
            events,
            for_update,
            runtime_ops,
        } = self;
        commit_inner(&core, id, &snapshot, batch, events, for_update, runtime_ops)
    }

    /// Discard the transaction. Writes never touched the engine; when any
    /// were staged, a rollback audit record lands in the WAL and the feed.
    pub fn rollback(self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let core = Arc::clone(&self.core);
        let id = self.id;
        debug!(txn_id = id, staged = self.batch.len(), "explicit rollback");
        let mut batch = WriteBatch::new();
        let ts = chrono::Utc::now().timestamp_millis();
        let _commit = core.commit_lock.lock();
        let last = core.feed.stage(
            &mut batch,
            ts,
            vec![PendingChange {
                kind: ChangeKind::TxnRollback,
                table: String::new(),
                key: String::new(),
                value_after: None,
            }],
        )?;
        let seq = core.kv.committed_seq() + 1;
        if let Some(wal) = &core.wal {
            let ops: Vec<(Vec<u8>, Option<Vec<u8>>)> =
                batch.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            wal.append(seq, &WalRecord::Rollback { txn_id: id, batch: ops })?;
        }
        core.kv.apply(&batch, seq);
        core.feed.publish(last);
        Ok(())
    }
}

/// Ordered, TTL-filtered scan of a table over any view.
pub(crate) fn scan_table(
    core: &DbCore,
    view: &dyn KvRead,
    table: &str,
    start_pk: Option<&str>,
    end_pk: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, Value)>> {
    let start = match start_pk {
        Some(pk) => key::entity_key(table, pk),
        None => key::entity_prefix(table),
    };
    let end = match end_pk {
        Some(pk) => Some(key::entity_key(table, pk)),
        None => key::prefix_end(&key::entity_prefix(table)),
    };
    let mut out = Vec::new();
    let mut cursor = start;
    // Over-read pages to absorb TTL-filtered rows.
    while out.len() < limit {
        let page = view.scan(&cursor, end.as_deref(), false, (limit - out.len()).min(1024) + 64);
        if page.is_empty() {
            break;
        }
        let page_len = page.len();
        let mut last_key = Vec::new();
        for (entity_key, bytes) in page {
            last_key = entity_key.clone();
            if out.len() >= limit {
                break;
            }
            let value = Value::decode(&bytes)?;
            if core.is_expired(table, &value) {
                continue;
            }
            let pk = key::entity_pk(&entity_key)?;
            out.push((pk, value));
        }
        if page_len < 65 && out.len() < limit {
            // Short page: the range is exhausted.
            break;
        }
        cursor = {
            let mut next = last_key;
            next.push(0);
            next
        };
    }
    Ok(out)
}

pub(crate) fn commit_inner(
    core: &DbCore,
    id: u64,
    snapshot: &Snapshot,
    mut batch: WriteBatch,
    events: Vec<PendingChange>,
    for_update: HashMap<Vec<u8>, u64>,
    runtime_ops: Vec<RuntimeOp>,
) -> Result<u64> {
    if batch.is_empty() && for_update.is_empty() {
        return Ok(snapshot.seq());
    }
    core.check_backpressure()?;

    let mut keys = batch.keys();
    keys.extend(for_update.keys().cloned());
    keys.sort();
    keys.dedup();
    let timeout = Duration::from_millis(core.config.txn_lock_wait_timeout_ms);
    core.kv.locks().acquire_all(id, &keys, timeout)?;

    let result = (|| {
        let _commit = core.commit_lock.lock();

        for (fp_key, read_version) in &for_update {
            let current = core.kv.committed_version(fp_key);
            if current != *read_version {
                return Err(ThemisError::conflict(
                    String::from_utf8_lossy(fp_key),
                    current,
                ));
            }
        }
        for written in batch.keys() {
            let current = core.kv.committed_version(&written);
            if current > snapshot.seq() {
                return Err(ThemisError::conflict(
                    String::from_utf8_lossy(&written),
                    current,
                ));
            }
        }

        let ts = chrono::Utc::now().timestamp_millis();
        let mut pending = events;
        if !pending.is_empty() {
            pending.push(PendingChange {
                kind: ChangeKind::TxnCommit,
                table: String::new(),
                key: String::new(),
                value_after: None,
            });
        }
        let feed_floor = core.feed.last_seq();
        let last_cdc = core.feed.stage(&mut batch, ts, pending)?;

        let seq = core.kv.committed_seq() + 1;
        if let Some(wal) = &core.wal {
            let ops: Vec<(Vec<u8>, Option<Vec<u8>>)> =
                batch.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            if let Err(e) = wal.append(seq, &WalRecord::Commit { txn_id: id, batch: ops }) {
                // Nothing was applied; give the staged feed sequences back
                // so the feed stays gap-free.
                core.feed.rewind(feed_floor);
                return Err(e);
            }
        }
        core.kv.apply(&batch, seq);
        for op in runtime_ops {
            op.apply();
        }
        core.feed.publish(last_cdc);
        debug!(txn_id = id, seq, ops = batch.len(), "committed");
        Ok(seq)
    })();

    core.kv.locks().release_all(id, &keys);
    result
}
