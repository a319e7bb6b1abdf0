//! KV engine substrate for ThemisDB.
//!
//! A durable ordered map `bytes -> bytes` built from:
//! - an in-memory ordered index of MVCC version chains (`engine`)
//! - atomic multi-key batches (`batch`)
//! - immutable snapshots and bounded iterators (`snapshot`)
//! - a pessimistic lock table with canonical-order acquisition (`locks`)
//! - block compression codecs behind the storage codec seam (`codec`)
//!
//! Durability itself lives one crate up: the WAL is the log, checkpoints are
//! the snapshots of the log-structured store, and compaction rewrites sealed
//! log segments. This crate owns the committed in-memory state and the
//! visibility rules.

pub mod batch;
pub mod codec;
pub mod engine;
pub mod locks;
pub mod snapshot;

pub use batch::WriteBatch;
pub use engine::KvEngine;
pub use locks::LockTable;
pub use snapshot::{KvRead, OverlayView, Snapshot};
