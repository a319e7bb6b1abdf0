//! Checkpoint and restore.
//!
//! A checkpoint is a directory holding `data.snap` (the committed state at
//! one sequence, in compressed crc-framed chunks), optionally a copy of the
//! WAL segments, and `manifest.json` listing every file with its size and
//! sha256 digest plus the highest included sequence.
//!
//! Restore verifies the manifest digests, loads the chunks into a fresh
//! engine, and pins the committed sequence to `highest_seq` so the next
//! commit is `highest_seq + 1`. Point-in-time restore then replays archived
//! WAL records up to a target sequence; replay is idempotent because each
//! record carries its sequence and the engine ignores nothing: the caller
//! replays into a freshly restored engine whose sequence floor is known.

use crate::wal::{Wal, WalRecord};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use themis_core::{Compression, Result, ThemisError};
use themis_storage::codec;
use themis_storage::{KvEngine, KvRead, Snapshot, WriteBatch};
use tracing::info;

const CHUNK_ROWS: usize = 4096;
const CHUNK_HEADER: usize = 8;

/// Manifest written alongside every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Wall-clock creation time, RFC 3339.
    pub timestamp: String,
    /// The data directory this checkpoint was taken from.
    pub db_path: String,
    /// The checkpoint directory itself.
    pub checkpoint_dir: String,
    /// Relative directory of archived WAL segments, when archived.
    pub wal_archive_dir: Option<String>,
    /// Advisory retention for backup rotation tooling.
    pub retention_days: u32,
    /// Total size of the checkpoint on disk, MiB.
    pub backup_size_mb: f64,
    /// Highest commit sequence included in `data.snap`.
    pub highest_seq: u64,
    /// Relative path -> sha256 hex digest for every payload file.
    pub sha256_index: BTreeMap<String, String>,
}

/// Options for checkpoint creation.
#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    /// Copy current WAL segments into the checkpoint for point-in-time
    /// restore.
    pub archive_wal: bool,
    /// Advisory retention recorded in the manifest.
    pub retention_days: u32,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        CheckpointOptions {
            archive_wal: true,
            retention_days: 30,
        }
    }
}

/// Creates and restores checkpoints.
pub struct Checkpointer {
    compression: Compression,
}

impl Checkpointer {
    /// A checkpointer writing chunks with the given codec.
    pub fn new(compression: Compression) -> Self {
        Checkpointer { compression }
    }

    /// Write a checkpoint of `snapshot` under `root`, returning its
    /// directory. Writers are not blocked: the snapshot pins its sequence
    /// and the scan pages through it.
    pub fn create(
        &self,
        db_path: &Path,
        root: &Path,
        snapshot: &Snapshot,
        wal: Option<&Wal>,
        options: &CheckpointOptions,
    ) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let dir = root.join(format!("checkpoint-{stamp}"));
        fs::create_dir_all(&dir)?;

        let data_path = dir.join("data.snap");
        self.write_data(&data_path, snapshot)?;

        let mut wal_archive_dir = None;
        if let (true, Some(wal)) = (options.archive_wal, wal) {
            // Fence: everything at or below the snapshot sequence must be on
            // disk before the segments are copied.
            wal.sync()?;
            let archive = dir.join("wal");
            fs::create_dir_all(&archive)?;
            for segment in wal.segment_paths()? {
                let name = segment
                    .file_name()
                    .ok_or_else(|| ThemisError::internal("segment without file name"))?;
                fs::copy(&segment, archive.join(name))?;
            }
            wal_archive_dir = Some("wal".to_string());
        }

        let mut sha256_index = BTreeMap::new();
        let mut total_bytes = 0u64;
        for file in files_under(&dir)? {
            let relative = file
                .strip_prefix(&dir)
                .map_err(|_| ThemisError::internal("file outside checkpoint dir"))?
                .to_string_lossy()
                .into_owned();
            let (digest, size) = sha256_file(&file)?;
            total_bytes += size;
            sha256_index.insert(relative, digest);
        }

        let manifest = CheckpointManifest {
            timestamp: chrono::Utc::now().to_rfc3339(),
            db_path: db_path.to_string_lossy().into_owned(),
            checkpoint_dir: dir.to_string_lossy().into_owned(),
            wal_archive_dir,
            retention_days: options.retention_days,
            backup_size_mb: total_bytes as f64 / (1024.0 * 1024.0),
            highest_seq: snapshot.seq(),
            sha256_index,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| ThemisError::internal(format!("manifest encode: {e}")))?;
        fs::write(dir.join("manifest.json"), manifest_json)?;
        info!(
            dir = %dir.display(),
            highest_seq = manifest.highest_seq,
            size_mb = manifest.backup_size_mb,
            "checkpoint created"
        );
        Ok(dir)
    }

    fn write_data(&self, path: &Path, snapshot: &Snapshot) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let mut cursor: Vec<u8> = Vec::new();
        loop {
            let page = snapshot.scan(&cursor, None, false, CHUNK_ROWS);
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|(k, _)| {
                let mut next = k.clone();
                next.push(0);
                next
            })
            .unwrap_or_default();
            let block = codec::compress(self.compression, &bincode::serialize(&page)?)?;
            let mut header = [0u8; CHUNK_HEADER];
            BigEndian::write_u32(&mut header[0..4], block.len() as u32);
            BigEndian::write_u32(&mut header[4..8], crc32fast::hash(&block));
            writer.write_all(&header)?;
            writer.write_all(&block)?;
            if page.len() < CHUNK_ROWS {
                break;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Load a checkpoint into a fresh engine. Verifies every manifest digest
    /// before a single row is applied.
    pub fn restore(&self, checkpoint_dir: &Path, engine: &KvEngine) -> Result<CheckpointManifest> {
        let manifest = Self::read_manifest(checkpoint_dir)?;
        for (relative, expected) in &manifest.sha256_index {
            let (actual, _) = sha256_file(&checkpoint_dir.join(relative))?;
            if &actual != expected {
                return Err(ThemisError::corruption(format!(
                    "checkpoint file {relative} digest mismatch"
                )));
            }
        }

        let bytes = {
            let mut buf = Vec::new();
            File::open(checkpoint_dir.join("data.snap"))?.read_to_end(&mut buf)?;
            buf
        };
        let mut pos = 0;
        let mut seq = engine.committed_seq();
        while pos < bytes.len() {
            if pos + CHUNK_HEADER > bytes.len() {
                return Err(ThemisError::corruption("truncated checkpoint chunk header"));
            }
            let len = BigEndian::read_u32(&bytes[pos..pos + 4]) as usize;
            let crc = BigEndian::read_u32(&bytes[pos + 4..pos + 8]);
            pos += CHUNK_HEADER;
            if pos + len > bytes.len() {
                return Err(ThemisError::corruption("truncated checkpoint chunk"));
            }
            let block = &bytes[pos..pos + len];
            pos += len;
            if crc32fast::hash(block) != crc {
                return Err(ThemisError::corruption("checkpoint chunk crc mismatch"));
            }
            let rows: Vec<(Vec<u8>, Vec<u8>)> =
                bincode::deserialize(&codec::decompress(block)?)?;
            let mut batch = WriteBatch::new();
            for (key, value) in rows {
                batch.put(key, value);
            }
            seq += 1;
            engine.apply(&batch, seq);
        }
        engine.force_seq(manifest.highest_seq.max(seq));
        info!(
            dir = %checkpoint_dir.display(),
            highest_seq = manifest.highest_seq,
            "checkpoint restored"
        );
        Ok(manifest)
    }

    /// Restore, then replay archived WAL records with
    /// `manifest.highest_seq < seq <= target_seq`. `None` replays the whole
    /// archive. Returns the final committed sequence.
    pub fn restore_to_instant(
        &self,
        checkpoint_dir: &Path,
        engine: &KvEngine,
        target_seq: Option<u64>,
    ) -> Result<u64> {
        let manifest = self.restore(checkpoint_dir, engine)?;
        let archive = match &manifest.wal_archive_dir {
            Some(relative) => checkpoint_dir.join(relative),
            None => return Ok(manifest.highest_seq),
        };
        let target = target_seq.unwrap_or(u64::MAX);
        let highest = Wal::replay(&archive, manifest.highest_seq, |seq, record| {
            if seq > target {
                return Ok(());
            }
            let batch = match record {
                WalRecord::Commit { batch, .. } => batch,
                WalRecord::Rollback { batch, .. } => batch,
            };
            let mut wb = WriteBatch::new();
            for (key, op) in batch {
                match op {
                    Some(value) => wb.put(key, value),
                    None => wb.delete(key),
                }
            }
            if !wb.is_empty() {
                engine.apply(&wb, seq);
            }
            Ok(())
        })?;
        Ok(highest.min(target).max(manifest.highest_seq))
    }

    /// Read and parse a checkpoint manifest.
    pub fn read_manifest(checkpoint_dir: &Path) -> Result<CheckpointManifest> {
        let raw = fs::read_to_string(checkpoint_dir.join("manifest.json"))?;
        serde_json::from_str(&raw)
            .map_err(|e| ThemisError::corruption(format!("manifest parse: {e}")))
    }
}

fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    let digest = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    Ok((digest, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use themis_core::WalFsync;

    fn engine_with(rows: usize) -> KvEngine {
        let engine = KvEngine::new();
        for i in 0..rows {
            let mut batch = WriteBatch::new();
            batch.put(format!("k{i:05}").into_bytes(), format!("v{i}").into_bytes());
            engine.apply(&batch, engine.committed_seq() + 1);
        }
        engine
    }

    #[test]
    fn checkpoint_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(500);
        let snap = engine.snapshot();
        let cp = Checkpointer::new(Compression::Zstd);
        let cp_dir = cp
            .create(
                dir.path(),
                &dir.path().join("checkpoints"),
                &snap,
                None,
                &CheckpointOptions::default(),
            )
            .unwrap();

        let restored = KvEngine::new();
        let manifest = cp.restore(&cp_dir, &restored).unwrap();
        assert_eq!(manifest.highest_seq, 500);
        assert_eq!(restored.committed_seq(), 500);

        let a = snap.scan_prefix(b"k", usize::MAX);
        let b = restored.snapshot().scan_prefix(b"k", usize::MAX);
        assert_eq!(a, b);
    }

    #[test]
    fn restore_ignores_writes_after_checkpoint() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(100);
        let snap = engine.snapshot();
        let cp = Checkpointer::new(Compression::Lz4);
        let cp_dir = cp
            .create(
                dir.path(),
                &dir.path().join("checkpoints"),
                &snap,
                None,
                &CheckpointOptions::default(),
            )
            .unwrap();

        // Writes after the snapshot must not appear in the restored state.
        let mut batch = WriteBatch::new();
        batch.put(b"later".to_vec(), b"x".to_vec());
        engine.apply(&batch, engine.committed_seq() + 1);

        let restored = KvEngine::new();
        cp.restore(&cp_dir, &restored).unwrap();
        assert_eq!(restored.get_latest(b"later"), None);
        assert_eq!(restored.get_latest(b"k00099"), Some(b"v99".to_vec()));
    }

    #[test]
    fn tampered_checkpoint_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(50);
        let snap = engine.snapshot();
        let cp = Checkpointer::new(Compression::None);
        let cp_dir = cp
            .create(
                dir.path(),
                &dir.path().join("checkpoints"),
                &snap,
                None,
                &CheckpointOptions::default(),
            )
            .unwrap();

        // Flip one byte in the data file.
        let data = cp_dir.join("data.snap");
        let mut bytes = fs::read(&data).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        fs::write(&data, bytes).unwrap();

        let restored = KvEngine::new();
        let err = cp.restore(&cp_dir, &restored).unwrap_err();
        assert!(matches!(err, ThemisError::Corruption { .. }));
        // Nothing was applied.
        assert_eq!(restored.committed_seq(), 0);
    }

    #[test]
    fn point_in_time_restore_replays_archived_wal() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(10);
        let wal = Wal::open(
            dir.path().join("wal"),
            WalFsync::Always,
            Compression::None,
            engine.committed_seq(),
        )
        .unwrap();

        let snap = engine.snapshot();
        let cp = Checkpointer::new(Compression::None);
        let cp_dir = cp
            .create(
                dir.path(),
                &dir.path().join("checkpoints"),
                &snap,
                Some(&wal),
                &CheckpointOptions::default(),
            )
            .unwrap();

        // Two more commits after the checkpoint, logged to the WAL.
        for (seq, key) in [(11u64, b"after-1".to_vec()), (12u64, b"after-2".to_vec())] {
            let ops = vec![(key.clone(), Some(b"x".to_vec()))];
            wal.append(seq, &WalRecord::Commit { txn_id: seq, batch: ops.clone() })
                .unwrap();
            let mut batch = WriteBatch::new();
            batch.put(key, b"x".to_vec());
            engine.apply(&batch, seq);
        }
        // Archive again so the checkpoint's wal copy holds both commits.
        wal.sync().unwrap();
        for segment in wal.segment_paths().unwrap() {
            fs::copy(&segment, cp_dir.join("wal").join(segment.file_name().unwrap())).unwrap();
        }

        let restored = KvEngine::new();
        let final_seq = cp
            .restore_to_instant(&cp_dir, &restored, Some(11))
            .unwrap();
        assert_eq!(final_seq, 11);
        assert_eq!(restored.get_latest(b"after-1"), Some(b"x".to_vec()));
        assert_eq!(restored.get_latest(b"after-2"), None);
    }
}
