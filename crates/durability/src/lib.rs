//! Durability layer: write-ahead log, checkpoint/restore, changefeed.
//!
//! The WAL is the log of the log-structured store: every commit appends one
//! crc-framed record before the batch touches the in-memory engine, and
//! recovery replays the tail beyond the last checkpoint. Checkpoints write a
//! consistent copy of the committed state plus a manifest with per-file
//! sha256 digests. The changefeed is a persistent queue in the `cdc:` prefix
//! whose rows ride inside the committing batch itself, so feed and state can
//! never diverge.

pub mod changefeed;
pub mod checkpoint;
pub mod wal;

pub use changefeed::{ChangeKind, ChangeRecord, Changefeed};
pub use checkpoint::{CheckpointManifest, Checkpointer};
pub use wal::{Wal, WalRecord};
