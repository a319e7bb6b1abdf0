//! Cross-thread behaviour of the KV substrate: snapshot stability, atomic
//! batch visibility, lock contention, randomized workloads against a
//! reference model.

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use themis_storage::{KvEngine, KvRead, WriteBatch};

/// A snapshot handed to another thread keeps reading its frozen state while
/// the owner keeps committing.
#[test]
fn snapshot_is_stable_across_threads() {
    let engine = KvEngine::new();
    let mut batch = WriteBatch::new();
    for i in 0..100u32 {
        batch.put(format!("k{i:03}").into_bytes(), i.to_be_bytes().to_vec());
    }
    engine.apply(&batch, 1);

    let snapshot = engine.snapshot();
    let reader = thread::spawn(move || {
        // Read repeatedly while the writer below churns.
        for _ in 0..50 {
            let rows = snapshot.scan_prefix(b"k", usize::MAX);
            assert_eq!(rows.len(), 100);
            assert_eq!(rows[7].1, 7u32.to_be_bytes().to_vec());
            thread::sleep(Duration::from_millis(1));
        }
    });

    for round in 0..50u64 {
        let mut batch = WriteBatch::new();
        for i in 0..100u32 {
            batch.put(
                format!("k{i:03}").into_bytes(),
                (i + 1000 * round as u32).to_be_bytes().to_vec(),
            );
        }
        engine.apply(&batch, engine.committed_seq() + 1);
    }
    reader.join().unwrap();
}

/// Readers either see all of a batch or none of it, never a prefix.
#[test]
fn batches_are_atomic_under_concurrent_snapshots() {
    let engine = KvEngine::new();
    let stop = Arc::new(AtomicU64::new(0));

    let writer = {
        let engine = engine.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            for seq in 1..=500u64 {
                let mut batch = WriteBatch::new();
                // Both keys always carry the same sequence number.
                batch.put(b"left".to_vec(), seq.to_be_bytes().to_vec());
                batch.put(b"right".to_vec(), seq.to_be_bytes().to_vec());
                engine.apply(&batch, seq);
            }
            stop.store(1, Ordering::Release);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while stop.load(Ordering::Acquire) == 0 {
                    let snapshot = engine.snapshot();
                    let left = snapshot.get(b"left");
                    let right = snapshot.get(b"right");
                    assert_eq!(left, right, "torn batch observed");
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
}

/// Version-chain GC under churn never disturbs pinned snapshots.
#[test]
fn gc_during_reads_keeps_pinned_versions() {
    let engine = KvEngine::new();
    let mut batch = WriteBatch::new();
    batch.put(b"hot".to_vec(), b"v0".to_vec());
    engine.apply(&batch, 1);

    let pinned = engine.snapshot();
    for round in 0..100u64 {
        let mut batch = WriteBatch::new();
        batch.put(b"hot".to_vec(), format!("v{}", round + 1).into_bytes());
        engine.apply(&batch, engine.committed_seq() + 1);
        engine.gc();
        assert_eq!(pinned.get(b"hot"), Some(b"v0".to_vec()));
    }
    drop(pinned);
    engine.gc();
    assert_eq!(engine.get_latest(b"hot"), Some(b"v100".to_vec()));
}

/// A randomized put/delete workload with interleaved GC matches a plain
/// map model, and snapshots taken mid-run stay self-consistent while the
/// writer keeps churning.
#[test]
fn randomized_workload_matches_reference_model() {
    let mut rng = rand::thread_rng();
    let engine = KvEngine::new();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    let mut mid_run: Option<(themis_storage::Snapshot, Vec<(Vec<u8>, Vec<u8>)>)> = None;
    for round in 0..300u32 {
        let mut batch = WriteBatch::new();
        for _ in 0..rng.gen_range(1..16) {
            let key = format!("k{:03}", rng.gen_range(0..100u32)).into_bytes();
            if rng.gen_bool(0.25) {
                batch.delete(key.clone());
                model.remove(&key);
            } else {
                let value = format!("v{round}").into_bytes();
                batch.put(key.clone(), value.clone());
                model.insert(key, value);
            }
        }
        engine.apply(&batch, engine.committed_seq() + 1);
        if rng.gen_bool(0.1) {
            engine.gc();
        }
        if round == 150 {
            let snapshot = engine.snapshot();
            let frozen = snapshot.scan_prefix(b"k", usize::MAX);
            mid_run = Some((snapshot, frozen));
        }
    }

    // The mid-run snapshot still reads exactly what it read at capture
    // time, GC and 150 further rounds notwithstanding.
    if let Some((snapshot, frozen)) = mid_run {
        assert_eq!(snapshot.scan_prefix(b"k", usize::MAX), frozen);
    }

    engine.gc();
    let rows = engine.snapshot().scan_prefix(b"k", usize::MAX);
    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(rows, expected);
}

/// Two committers locking overlapping key sets in canonical order never
/// deadlock; a holder that never releases forces a timeout.
#[test]
fn lock_contention_resolves_or_times_out() {
    let engine = KvEngine::new();
    let locks_done = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..4u64)
        .map(|owner| {
            let engine = engine.clone();
            let done = Arc::clone(&locks_done);
            thread::spawn(move || {
                let keys: Vec<Vec<u8>> = (0..6u8).map(|i| vec![b'k', i]).collect();
                for _ in 0..100 {
                    engine
                        .locks()
                        .acquire_all(owner, &keys, Duration::from_secs(10))
                        .unwrap();
                    engine.locks().release_all(owner, &keys);
                }
                done.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(locks_done.load(Ordering::Acquire), 4);
    assert_eq!(engine.locks().held_count(), 0);

    // A stuck holder times the waiter out.
    engine
        .locks()
        .acquire_all(99, &[b"stuck".to_vec()], Duration::from_millis(10))
        .unwrap();
    let err = engine
        .locks()
        .acquire_all(100, &[b"stuck".to_vec()], Duration::from_millis(20))
        .unwrap_err();
    assert!(err.is_retryable());
}
