//! R*-tree spatial index.
//!
//! - `rtree`: the tree itself, with R* choose-subtree, axis/index split and
//!   forced reinsertion (once per level per insertion)
//! - `index`: the per-`(table, field)` manager persisting leaf entries as
//!   `(MBR, EWKB)` rows and answering intersects / within / nearest-k with
//!   an exact second pass where the predicate asks for it

pub mod index;
pub mod rtree;

pub use index::{SpatialHit, SpatialIndex, SpatialIndexSpec};
pub use rtree::RTree;
