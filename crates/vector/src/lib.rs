//! HNSW vector index.
//!
//! - `distance`: metric kernels, scalar reference plus a runtime-detected
//!   AVX2 fast path, behind the `DistanceBackend` trait (the seam an
//!   external accelerator would plug into)
//! - `hnsw`: the hierarchical navigable small-world graph itself
//! - `index`: the per-`(table, field)` manager tying vectors in the KV
//!   engine to the in-memory graph, with whitelist prefilter search

pub mod distance;
pub mod hnsw;
pub mod index;

pub use distance::{select_backend, DistanceBackend, DistanceMetric, ScalarBackend};
pub use hnsw::HnswParams;
pub use index::{VectorHit, VectorIndex, VectorIndexSpec, WhitelistParams};
