//! Secondary and full-text indices.
//!
//! Maintenance is stateless: each `apply_*` function takes the transaction's
//! read view and its pending batch, deletes the entries derived from the old
//! document and stages the entries derived from the new one. Everything
//! commits atomically with the entity because it all rides the same batch.
//!
//! Scans read through any `KvRead`, so they serve both transactional reads
//! (overlay view) and plain snapshot reads.

pub mod fulltext;
pub mod secondary;

pub use fulltext::{FullTextSpec, TextMatch};
pub use secondary::{
    CompositeIndexSpec, IndexEntry, RangeBound, RangeScan, ScalarIndexKind, ScalarIndexSpec,
    TtlIndexSpec,
};
