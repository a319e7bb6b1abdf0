//! Property-graph index.
//!
//! Edges live as two directed adjacency rows in the `idx:gph:` prefix, one
//! under each endpoint, so in- and out-neighbourhoods are both single prefix
//! scans. Vertices are entity primary keys; a separate label row set maps
//! labels to vertices. Writes ride the caller's batch and commit with the
//! entity, no extra locking.
//!
//! - `store`: adjacency and label row maintenance and scans
//! - `algo`: BFS, DFS, weighted shortest path, degree centrality, connected
//!   components, PageRank, with an optional geo circle filter on traversal

pub mod algo;
pub mod store;

pub use algo::{GeoCircleFilter, PathResult};
pub use store::{EdgeRef, GraphSpec};
