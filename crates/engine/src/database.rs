//! The database facade.
//!
//! `Database::open` wires the engine together: load the latest internal
//! checkpoint if one is referenced by `CURRENT`, replay the WAL tail,
//! rebuild the index registry, open the changefeed and start the background
//! workers. `Database::memory` builds an ephemeral instance with no files,
//! used by tests and caches.

use crate::background::{Backpressure, Workers};
use crate::catalog::{descriptor_key, IndexDescriptor, Registry, TableIndexes};
use crate::stats::StatsCache;
use crate::txn::{self, RetryConfig, Transaction};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use themis_core::{DbConfig, Result, ThemisError, Value};
use themis_durability::changefeed::Changefeed;
use themis_durability::checkpoint::{CheckpointOptions, Checkpointer};
use themis_durability::wal::{Wal, WalRecord};
use themis_index::FullTextSpec;
use themis_spatial::SpatialIndex;
use themis_storage::{KvEngine, KvRead, Snapshot, WriteBatch};
use themis_vector::{VectorIndex, WhitelistParams};
use tracing::{info, warn};

/// Everything the transaction and background paths share.
pub struct DbCore {
    pub(crate) kv: KvEngine,
    pub(crate) wal: Option<Wal>,
    pub(crate) feed: Changefeed,
    pub(crate) registry: Registry,
    pub(crate) config: DbConfig,
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) backpressure: Backpressure,
    next_txn: AtomicU64,
}

impl DbCore {
    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::AcqRel)
    }

    /// TTL read filtering: a row whose expire-at is due is invisible even
    /// before the sweeper gets to it.
    pub(crate) fn is_expired(&self, table: &str, value: &Value) -> bool {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        for spec in &self.registry.table(table).ttls {
            if let Some(expire) = themis_index::secondary::ttl_of(Some(value), &spec.field) {
                if expire <= now {
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn check_backpressure(&self) -> Result<()> {
        self.backpressure.check()
    }

    /// Commit a maintenance batch (trimmer, flusher, stats) through the WAL
    /// without locks: these writers touch keys no user transaction contends
    /// on. Returns the commit sequence.
    pub(crate) fn commit_system(&self, batch: &WriteBatch) -> Result<u64> {
        let _commit = self.commit_lock.lock();
        let seq = self.kv.committed_seq() + 1;
        if let Some(wal) = &self.wal {
            let ops: Vec<(Vec<u8>, Option<Vec<u8>>)> =
                batch.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            wal.append(seq, &WalRecord::Commit { txn_id: 0, batch: ops })?;
        }
        self.kv.apply(batch, seq);
        Ok(seq)
    }
}

/// An open database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    core: Arc<DbCore>,
    stats: Arc<StatsCache>,
    workers: Arc<Workers>,
}

impl Database {
    /// Open (or create) a database at `path`.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Database> {
        config.validate()?;
        let data_dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let kv = KvEngine::new();

        // Load the internal checkpoint referenced by CURRENT, if any, then
        // replay the WAL tail past it.
        let mut floor = 0;
        let current = data_dir.join("CURRENT");
        if current.exists() {
            let reference = fs::read_to_string(&current)?;
            let checkpoint_dir = data_dir.join(reference.trim());
            if checkpoint_dir.exists() {
                let manifest =
                    Checkpointer::new(config.compression_default).restore(&checkpoint_dir, &kv)?;
                floor = manifest.highest_seq;
                info!(checkpoint = %checkpoint_dir.display(), floor, "loaded checkpoint");
            } else {
                warn!(current = %reference.trim(), "CURRENT references a missing checkpoint");
            }
        }

        let wal_dir = data_dir.join("wal");
        let highest = Wal::replay(&wal_dir, floor, |seq, record| {
            let ops = match record {
                WalRecord::Commit { batch, .. } => batch,
                WalRecord::Rollback { batch, .. } => batch,
            };
            let mut wb = WriteBatch::new();
            for (key, op) in ops {
                match op {
                    Some(value) => wb.put(key, value),
                    None => wb.delete(key),
                }
            }
            if !wb.is_empty() {
                kv.apply(&wb, seq);
            }
            Ok(())
        })?;
        kv.force_seq(highest.max(floor));
        info!(seq = kv.committed_seq(), "recovery complete");

        let wal = if config.enable_wal {
            Some(Wal::open(
                &wal_dir,
                config.wal_fsync,
                config.compression_default,
                kv.committed_seq(),
            )?)
        } else {
            None
        };

        Self::finish_open(kv, wal, config, Some(data_dir))
    }

    /// An ephemeral database: no files, no WAL, data dies with the handle.
    pub fn memory(mut config: DbConfig) -> Result<Database> {
        config.enable_wal = false;
        config.validate()?;
        Self::finish_open(KvEngine::new(), None, config, None)
    }

    fn finish_open(
        kv: KvEngine,
        wal: Option<Wal>,
        config: DbConfig,
        data_dir: Option<PathBuf>,
    ) -> Result<Database> {
        let feed = Changefeed::open(kv.clone())?;
        let registry = {
            let snapshot = kv.snapshot();
            Registry::load(&snapshot)?
        };
        let core = Arc::new(DbCore {
            kv,
            wal,
            feed,
            registry,
            config,
            data_dir,
            commit_lock: Mutex::new(()),
            backpressure: Backpressure::default(),
            next_txn: AtomicU64::new(1),
        });
        let workers = Workers::start(Arc::clone(&core));
        Ok(Database {
            core,
            stats: Arc::new(StatsCache::default()),
            workers: Arc::new(workers),
        })
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::begin(Arc::clone(&self.core))
    }

    /// Run a closure in a transaction: commit on `Ok`, discard on `Err`,
    /// retrying retryable failures per `retry`.
    pub fn transaction<T>(
        &self,
        retry: RetryConfig,
        mut body: impl FnMut(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            let mut txn = self.begin();
            match body(&mut txn).and_then(|value| txn.commit().map(|_| value)) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    std::thread::sleep(retry.backoff * (1 << attempt.min(8)) as u32);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A read snapshot of the committed state.
    pub fn snapshot(&self) -> Snapshot {
        self.core.kv.snapshot()
    }

    /// Point read at the latest committed state, TTL-filtered.
    pub fn get(&self, table: &str, pk: &str) -> Result<Option<Value>> {
        let snapshot = self.snapshot();
        match snapshot.get(&themis_core::key::entity_key(table, pk)) {
            Some(bytes) => {
                let value = Value::decode(&bytes)?;
                if self.core.is_expired(table, &value) {
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    /// Ordered scan of a table at the latest committed state.
    pub fn scan(
        &self,
        table: &str,
        start_pk: Option<&str>,
        end_pk: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>> {
        let snapshot = self.snapshot();
        txn::scan_table(&self.core, &snapshot, table, start_pk, end_pk, limit)
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Create an index: persist the descriptor, register the runtime, then
    /// back-fill from existing entities in batches. Concurrent writers
    /// double-write from the moment registration completes, so the
    /// back-fill can never miss a newer document.
    pub fn create_index(&self, descriptor: IndexDescriptor) -> Result<()> {
        let table = descriptor.table().to_string();
        // Re-declaring an identical index is a no-op; a different shape
        // under an existing name is Exists.
        if self
            .list_indexes(&table)?
            .iter()
            .any(|existing| existing == &descriptor)
        {
            return Ok(());
        }
        {
            let snapshot = self.snapshot();
            self.core.registry.register(descriptor.clone(), &snapshot)?;
        }
        let mut batch = WriteBatch::new();
        batch.put(descriptor.catalog_key(), bincode::serialize(&descriptor)?);
        self.core.commit_system(&batch)?;

        self.backfill(&descriptor, &table)?;
        info!(table, index = descriptor.name(), "index created");
        Ok(())
    }

    fn backfill(&self, descriptor: &IndexDescriptor, table: &str) -> Result<()> {
        const BATCH: usize = 256;
        let only = single_index_set(descriptor, &self.core.registry.table(table));
        let mut after: Option<String> = None;
        loop {
            let snapshot = self.snapshot();
            let page = txn::scan_table(
                &self.core,
                &snapshot,
                table,
                after.as_deref(),
                None,
                BATCH + 1,
            )?;
            // `after` is inclusive in scan_table; skip the anchor itself.
            let rows: Vec<_> = page
                .into_iter()
                .filter(|(pk, _)| after.as_deref() != Some(pk.as_str()))
                .take(BATCH)
                .collect();
            if rows.is_empty() {
                break;
            }
            after = rows.last().map(|(pk, _)| pk.clone());

            let mut staged = WriteBatch::new();
            let mut runtime = Vec::new();
            for (pk, value) in &rows {
                // Each row must see the rows staged before it (the
                // full-text corpus totals accumulate across the batch).
                let mut one = WriteBatch::new();
                {
                    let view = themis_storage::OverlayView::new(&snapshot, &staged);
                    crate::indexer::stage_transition(
                        &only,
                        pk,
                        None,
                        Some(value),
                        &view,
                        &mut one,
                        &mut runtime,
                    )?;
                }
                staged.merge(one);
            }
            if !staged.is_empty() {
                self.core.commit_system(&staged)?;
            }
            for op in runtime {
                op.apply();
            }
        }
        Ok(())
    }

    /// Drop an index: remove the descriptor, then erase its keyspace.
    pub fn drop_index(&self, table: &str, name: &str) -> Result<()> {
        let prefixes = self.core.registry.deregister(table, name)?;
        let mut batch = WriteBatch::new();
        batch.delete(descriptor_key(table, name));
        self.core.commit_system(&batch)?;

        // Erase in bounded batches so one huge index cannot produce one
        // huge commit record.
        for prefix in prefixes {
            loop {
                let snapshot = self.snapshot();
                let rows = snapshot.scan_prefix(&prefix, 1024);
                if rows.is_empty() {
                    break;
                }
                let mut batch = WriteBatch::new();
                for (key, _) in rows {
                    batch.delete(key);
                }
                self.core.commit_system(&batch)?;
            }
        }
        info!(table, index = name, "index dropped");
        Ok(())
    }

    /// Every persisted descriptor of a table.
    pub fn list_indexes(&self, table: &str) -> Result<Vec<IndexDescriptor>> {
        let snapshot = self.snapshot();
        let prefix = themis_core::key::meta_prefix("idx");
        let mut out = Vec::new();
        for (_, bytes) in snapshot.scan_prefix(&prefix, usize::MAX) {
            let descriptor: IndexDescriptor = bincode::deserialize(&bytes)?;
            if descriptor.table() == table {
                out.push(descriptor);
            }
        }
        Ok(out)
    }

    /// Tables with at least one entity, in name order.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let snapshot = self.snapshot();
        let prefix = themis_core::key::KeyPrefix::Entity.as_bytes();
        let mut tables: BTreeMap<String, ()> = BTreeMap::new();
        let mut cursor = prefix.to_vec();
        let end = themis_core::key::prefix_end(prefix);
        loop {
            let page = snapshot.scan(&cursor, end.as_deref(), false, 512);
            if page.is_empty() {
                break;
            }
            let (last_key, _) = page.last().cloned().unwrap_or_default();
            for (entity_key, _) in page {
                let rest = entity_key
                    .strip_prefix(prefix)
                    .ok_or_else(|| ThemisError::corruption("entity key shape"))?;
                let fields = themis_core::key::split_fields(rest)?;
                if let Some(table) = fields.first() {
                    tables.insert(
                        String::from_utf8(table.clone())
                            .map_err(|_| ThemisError::corruption("non-utf8 table"))?,
                        (),
                    );
                }
            }
            cursor = {
                let mut next = last_key;
                next.push(0);
                next
            };
        }
        Ok(tables.into_keys().collect())
    }

    // ========================================================================
    // Accessors for the query layer
    // ========================================================================

    /// The KV engine (selectivity probes, raw scans).
    pub fn engine(&self) -> &KvEngine {
        &self.core.kv
    }

    /// The configuration.
    pub fn config(&self) -> &DbConfig {
        &self.core.config
    }

    /// Selectivity/stat probes.
    pub fn stats(&self) -> &StatsCache {
        &self.stats
    }

    /// The index set of a table.
    pub fn table_indexes(&self, table: &str) -> Arc<TableIndexes> {
        self.core.registry.table(table)
    }

    /// The vector runtime over `(table, field)`, if declared.
    pub fn vector_index(&self, table: &str, field: &str) -> Option<Arc<VectorIndex>> {
        self.core
            .registry
            .table(table)
            .vectors
            .iter()
            .find(|v| v.spec().field == field)
            .cloned()
    }

    /// The spatial runtime over `(table, field)`, if declared.
    pub fn spatial_index(&self, table: &str, field: &str) -> Option<Arc<SpatialIndex>> {
        self.core
            .registry
            .table(table)
            .spatials
            .iter()
            .find(|s| s.spec().field == field)
            .cloned()
    }

    /// The full-text descriptor over `(table, field)`, if declared.
    pub fn fulltext_index(&self, table: &str, field: &str) -> Option<FullTextSpec> {
        self.core
            .registry
            .table(table)
            .fulltexts
            .iter()
            .find(|f| f.field == field)
            .cloned()
    }

    /// Whitelist prefilter tuning from the configuration.
    pub fn whitelist_params(&self) -> WhitelistParams {
        let c = &self.core.config;
        WhitelistParams {
            enabled: c.whitelist_prefilter_enabled,
            initial_factor: c.whitelist_initial_factor,
            min_candidates: c.whitelist_min_candidates,
            max_attempts: c.whitelist_max_attempts,
            growth_factor: c.whitelist_growth_factor,
        }
    }

    /// The changefeed, for polling subscribers.
    pub fn changefeed(&self) -> &Changefeed {
        &self.core.feed
    }

    /// TTL visibility check used by read paths.
    pub fn is_visible(&self, table: &str, value: &Value) -> bool {
        !self.core.is_expired(table, value)
    }

    // ========================================================================
    // Checkpoint / restore
    // ========================================================================

    /// Take a user checkpoint under `<data>/checkpoints`, archiving WAL
    /// segments for point-in-time restore. Writers keep committing.
    pub fn checkpoint(&self) -> Result<PathBuf> {
        let data_dir = self
            .core
            .data_dir
            .as_ref()
            .ok_or_else(|| ThemisError::unsupported("checkpoint of an ephemeral database"))?;
        // Flush vector graphs first so the checkpoint carries them.
        for index in self.core.registry.all_vectors() {
            let mut batch = WriteBatch::new();
            if index.flush(&mut batch)? {
                self.core.commit_system(&batch)?;
            }
        }
        let snapshot = self.snapshot();
        Checkpointer::new(self.core.config.compression_default).create(
            data_dir,
            &data_dir.join("checkpoints"),
            &snapshot,
            self.core.wal.as_ref(),
            &CheckpointOptions::default(),
        )
    }

    /// Restore a checkpoint into `target_dir` and open the result.
    /// `target_seq` replays archived WAL up to an instant in time.
    pub fn restore(
        checkpoint_dir: &Path,
        target_dir: &Path,
        config: DbConfig,
        target_seq: Option<u64>,
    ) -> Result<Database> {
        config.validate()?;
        fs::create_dir_all(target_dir)?;
        let kv = KvEngine::new();
        let checkpointer = Checkpointer::new(config.compression_default);
        let highest = checkpointer.restore_to_instant(checkpoint_dir, &kv, target_seq)?;
        kv.force_seq(highest);

        // Persist the restored base in the target directory: a later open
        // starts from this internal checkpoint plus whatever WAL follows.
        {
            let snapshot = kv.snapshot();
            let base = checkpointer.create(
                target_dir,
                &target_dir.join("auto"),
                &snapshot,
                None,
                &CheckpointOptions { archive_wal: false, retention_days: 0 },
            )?;
            let relative = base
                .strip_prefix(target_dir)
                .map_err(|_| ThemisError::internal("restore base escaped target dir"))?
                .to_string_lossy()
                .into_owned();
            fs::write(target_dir.join("CURRENT"), relative)?;
        }

        let wal = if config.enable_wal {
            Some(Wal::open(
                target_dir.join("wal"),
                config.wal_fsync,
                config.compression_default,
                highest,
            )?)
        } else {
            None
        };
        Self::finish_open(kv, wal, config, Some(target_dir.to_path_buf()))
    }

    /// Stop background workers and flush what they hold. Dropping the last
    /// handle does the same implicitly.
    pub fn close(&self) -> Result<()> {
        self.workers.stop();
        for index in self.core.registry.all_vectors() {
            let mut batch = WriteBatch::new();
            if index.flush(&mut batch)? {
                self.core.commit_system(&batch)?;
            }
        }
        if let Some(wal) = &self.core.wal {
            wal.sync()?;
        }
        Ok(())
    }
}

/// A `TableIndexes` view holding only the descriptor being back-filled, so
/// the back-fill writes one index without re-deriving the others.
fn single_index_set(descriptor: &IndexDescriptor, full: &TableIndexes) -> TableIndexes {
    let mut only = TableIndexes::default();
    match descriptor {
        IndexDescriptor::Scalar(s) => only.scalars.push(s.clone()),
        IndexDescriptor::Composite(s) => only.composites.push(s.clone()),
        IndexDescriptor::Ttl(s) => only.ttls.push(s.clone()),
        IndexDescriptor::FullText(s) => only.fulltexts.push(s.clone()),
        IndexDescriptor::Vector(s) => {
            if let Some(v) = full.vectors.iter().find(|v| v.spec().name == s.name) {
                only.vectors.push(Arc::clone(v));
            }
        }
        IndexDescriptor::Spatial(s) => {
            if let Some(v) = full.spatials.iter().find(|v| v.spec().name == s.name) {
                only.spatials.push(Arc::clone(v));
            }
        }
    }
    only
}
