//! Background workers.
//!
//! Four periodic loops on dedicated threads: TTL expiry, changefeed
//! trimming, HNSW graph flushing, and compaction (version-chain GC plus
//! WAL-to-checkpoint rewriting). Each loop parks on a shutdown channel, so
//! `stop` is prompt. Compaction debt feeds the backpressure gauge: when the
//! WAL outruns the compactor past the hard watermark, foreground commits
//! fail with `Busy` until the debt is paid.

use crate::database::DbCore;
use crate::txn::Transaction;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use themis_core::{Result, ThemisError};
use themis_durability::checkpoint::{CheckpointOptions, Checkpointer};
use themis_index::secondary;
use themis_storage::WriteBatch;
use tracing::{debug, info, warn};

/// Max rows one TTL sweep transaction deletes.
const TTL_SWEEP_BATCH: usize = 256;

/// WAL debt multiple (over the memtable budget) that flips `Busy`.
const BUSY_DEBT_FACTOR: u64 = 4;

/// Shared write-refusal gauge.
#[derive(Default)]
pub struct Backpressure {
    busy: AtomicBool,
}

impl Backpressure {
    /// Error when a background queue is over its high-watermark.
    pub fn check(&self) -> Result<()> {
        if self.busy.load(Ordering::Acquire) {
            Err(ThemisError::busy("compaction"))
        } else {
            Ok(())
        }
    }

    fn set(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }
}

/// Handles to the running worker threads.
pub struct Workers {
    shutdown: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    /// Spawn the worker loops for `core`.
    pub fn start(core: Arc<DbCore>) -> Workers {
        let (shutdown, signal) = bounded::<()>(0);
        let mut handles = Vec::new();

        let ttl_interval = Duration::from_millis(core.config.ttl_sweep_interval_ms.max(10));
        handles.push(spawn_loop(
            "themis-ttl",
            signal.clone(),
            ttl_interval,
            {
                let core = Arc::clone(&core);
                move || ttl_sweep(&core)
            },
        ));

        handles.push(spawn_loop(
            "themis-cdc-trim",
            signal.clone(),
            Duration::from_millis(1_000),
            {
                let core = Arc::clone(&core);
                move || trim_changefeed(&core)
            },
        ));

        handles.push(spawn_loop(
            "themis-vec-flush",
            signal.clone(),
            Duration::from_millis(2_000),
            {
                let core = Arc::clone(&core);
                move || flush_vectors(&core)
            },
        ));

        handles.push(spawn_loop(
            "themis-compact",
            signal,
            Duration::from_millis(500),
            {
                let core = Arc::clone(&core);
                move || compact(&core)
            },
        ));

        Workers {
            shutdown: Mutex::new(Some(shutdown)),
            handles: Mutex::new(handles),
        }
    }

    /// Signal every loop and join the threads. Idempotent.
    pub fn stop(&self) {
        // Dropping the sender disconnects every receiver, waking all loops.
        self.shutdown.lock().take();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_loop(
    name: &'static str,
    signal: Receiver<()>,
    interval: Duration,
    mut body: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match signal.recv_timeout(interval) {
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    debug!(worker = name, "stopping");
                    return;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => body(),
            }
        })
        .unwrap_or_else(|e| panic!("spawning {name}: {e}"))
}

/// Delete rows whose TTL is due, in their own transactions: expiry never
/// runs inside a user transaction's commit window.
fn ttl_sweep(core: &Arc<DbCore>) {
    let now = chrono::Utc::now().timestamp_millis() as u64;
    for table in core.registry.indexed_tables() {
        if core.registry.table(&table).ttls.is_empty() {
            continue;
        }
        let expired = {
            let snapshot = core.kv.snapshot();
            match secondary::scan_expired(&snapshot, &table, now, TTL_SWEEP_BATCH) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(table, error = %e, "ttl scan failed");
                    continue;
                }
            }
        };
        if expired.is_empty() {
            continue;
        }
        let mut txn = Transaction::begin(Arc::clone(core));
        let mut failed = false;
        for (_, pk) in &expired {
            if let Err(e) = txn.delete(&table, pk) {
                warn!(table, pk, error = %e, "ttl delete failed");
                failed = true;
                break;
            }
        }
        if !failed {
            match txn.commit() {
                Ok(_) => debug!(table, expired = expired.len(), "ttl sweep"),
                Err(e) if e.is_retryable() => {} // next tick retries
                Err(e) => warn!(table, error = %e, "ttl sweep commit failed"),
            }
        }
    }
}

fn trim_changefeed(core: &Arc<DbCore>) {
    let now = chrono::Utc::now().timestamp_millis();
    match core.feed.trim_batch(
        core.config.changefeed_retention_bytes,
        core.config.changefeed_retention_ms,
        now,
    ) {
        Ok(Some(batch)) => {
            let trimmed = batch.len();
            if let Err(e) = core.commit_system(&batch) {
                warn!(error = %e, "changefeed trim failed");
            } else {
                debug!(trimmed, "changefeed trimmed");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "changefeed trim scan failed"),
    }
}

fn flush_vectors(core: &Arc<DbCore>) {
    for index in core.registry.all_vectors() {
        let mut batch = WriteBatch::new();
        match index.flush(&mut batch) {
            Ok(true) => {
                if let Err(e) = core.commit_system(&batch) {
                    warn!(error = %e, "hnsw flush commit failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "hnsw flush failed"),
        }
    }
}

/// Version-chain GC plus WAL rewriting: when the live WAL outgrows the
/// memtable budget, write an internal checkpoint, point `CURRENT` at it and
/// drop the sealed segments it covers. Superseded row versions die here,
/// which is what makes the store log-structured rather than log-unbounded.
fn compact(core: &Arc<DbCore>) {
    core.kv.gc();

    let (wal, data_dir) = match (&core.wal, &core.data_dir) {
        (Some(wal), Some(dir)) => (wal, dir),
        _ => return,
    };
    let budget =
        (core.config.memtable_size_mb as u64) * 1024 * 1024 * core.config.max_write_buffer_number as u64;
    let debt = wal.total_bytes();
    core.backpressure.set(debt > budget * BUSY_DEBT_FACTOR);
    if debt <= budget {
        return;
    }

    let result: Result<()> = (|| {
        let snapshot = core.kv.snapshot();
        let seq = snapshot.seq();
        // Everything at or below `seq` must be on disk before the segments
        // are considered covered.
        wal.sync()?;
        let checkpointer = Checkpointer::new(core.config.bottommost_compression());
        let dir = checkpointer.create(
            data_dir,
            &data_dir.join("auto"),
            &snapshot,
            None,
            &CheckpointOptions {
                archive_wal: false,
                retention_days: 0,
            },
        )?;
        let relative = dir
            .strip_prefix(data_dir)
            .map_err(|_| ThemisError::internal("checkpoint escaped data dir"))?
            .to_string_lossy()
            .into_owned();
        let tmp = data_dir.join("CURRENT.tmp");
        fs::write(&tmp, &relative)?;
        fs::rename(&tmp, data_dir.join("CURRENT"))?;
        let removed = wal.truncate_through(seq)?;
        info!(checkpoint = relative, removed_segments = removed, "wal compacted");
        Ok(())
    })();
    if let Err(e) = result {
        warn!(error = %e, "compaction failed");
    }
    core.backpressure
        .set(wal.total_bytes() > budget * BUSY_DEBT_FACTOR);
}
