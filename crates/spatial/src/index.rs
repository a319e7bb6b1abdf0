//! Per-`(table, field)` spatial index manager.
//!
//! Leaf entries persist as `idx:spa:<table><field><pk> -> (MBR, EWKB)` rows
//! inside the committing batch; the R*-tree itself is rebuilt from those
//! rows on open and kept in memory behind a published-root pattern: readers
//! clone an `Arc` of the current tree and search without locks, the writer
//! path swaps a new root in under a coarse lock.
//!
//! Exact predicates (`within`, exact `intersects`) run a second pass over
//! the stored EWKB of the MBR candidates.

use crate::rtree::RTree;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use themis_core::geo::Geometry;
use themis_core::key;
use themis_core::{GeoPoint, Mbr, Result, ThemisError};
use themis_storage::{KvRead, WriteBatch};

/// Descriptor of a spatial index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialIndexSpec {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Dotted path of the geometry field.
    pub field: String,
}

/// Persisted leaf row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpatialRow {
    mbr: Mbr,
    ewkb: Vec<u8>,
}

/// One spatial hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialHit {
    /// Primary key.
    pub pk: String,
    /// Great-circle distance in metres, for `nearest_k`; 0 otherwise.
    pub distance_m: f64,
}

#[derive(Clone)]
struct SpatialState {
    tree: RTree,
    mbr_of: FxHashMap<String, Mbr>,
}

/// The runtime index for one `(table, field)`.
pub struct SpatialIndex {
    spec: SpatialIndexSpec,
    state: RwLock<Arc<SpatialState>>,
    writer: Mutex<()>,
}

impl SpatialIndex {
    /// Open the index, bulk-loading the persisted leaf rows.
    pub fn open(spec: SpatialIndexSpec, view: &dyn KvRead) -> Result<SpatialIndex> {
        let mut tree = RTree::new();
        let mut mbr_of = FxHashMap::default();
        let prefix = key::spatial_index_prefix(&spec.table, &spec.field);
        for (entry_key, bytes) in view.scan_prefix(&prefix, usize::MAX) {
            let pk = key::index_entry_pk(key::KeyPrefix::IdxSpatial, &entry_key)?;
            let row: SpatialRow = bincode::deserialize(&bytes)?;
            tree.insert(row.mbr, pk.clone());
            mbr_of.insert(pk, row.mbr);
        }
        Ok(SpatialIndex {
            spec,
            state: RwLock::new(Arc::new(SpatialState { tree, mbr_of })),
            writer: Mutex::new(()),
        })
    }

    /// The descriptor.
    pub fn spec(&self) -> &SpatialIndexSpec {
        &self.spec
    }

    /// Indexed entry count.
    pub fn len(&self) -> usize {
        self.state.read().tree.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared total bounds: the union of everything indexed. The planner
    /// divides query MBR area by this area.
    pub fn total_bounds(&self) -> Mbr {
        self.state.read().tree.bounds()
    }

    /// Query-MBR area over total-bounds area, clamped to `[0, 1]`.
    pub fn area_ratio(&self, query: &Mbr) -> f64 {
        let total = self.total_bounds().area();
        if total <= 0.0 {
            return 1.0;
        }
        (query.area() / total).clamp(0.0, 1.0)
    }

    /// Validate a geometry and stage its row into the committing batch.
    pub fn stage_put(&self, pk: &str, geometry: &Geometry, batch: &mut WriteBatch) -> Result<Mbr> {
        let mbr = geometry.mbr();
        if mbr.is_empty() {
            return Err(ThemisError::invalid_value("empty geometry"));
        }
        let row = SpatialRow {
            mbr,
            ewkb: geometry.to_ewkb(),
        };
        batch.put(
            key::spatial_entry_key(&self.spec.table, &self.spec.field, pk),
            bincode::serialize(&row)?,
        );
        Ok(mbr)
    }

    /// Stage removal of a row.
    pub fn stage_delete(&self, pk: &str, batch: &mut WriteBatch) {
        batch.delete(key::spatial_entry_key(&self.spec.table, &self.spec.field, pk));
    }

    /// Apply a committed put to the in-memory tree.
    pub fn on_commit_put(&self, pk: &str, mbr: Mbr) {
        let _writer = self.writer.lock();
        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut guard);
        if let Some(old) = state.mbr_of.remove(pk) {
            state.tree.remove(&old, pk);
        }
        state.tree.insert(mbr, pk.to_string());
        state.mbr_of.insert(pk.to_string(), mbr);
    }

    /// Apply a committed delete to the in-memory tree.
    pub fn on_commit_delete(&self, pk: &str) {
        let _writer = self.writer.lock();
        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut guard);
        if let Some(old) = state.mbr_of.remove(pk) {
            state.tree.remove(&old, pk);
        }
    }

    /// MBR-level intersection candidates.
    pub fn search_intersects(&self, query: &Mbr) -> Vec<String> {
        let state = Arc::clone(&self.state.read());
        state.tree.search_intersects(query)
    }

    /// Exact containment: entries whose geometry lies entirely inside
    /// `container`. MBR candidates first, EWKB second pass.
    pub fn search_within(
        &self,
        view: &dyn KvRead,
        container: &Geometry,
    ) -> Result<Vec<String>> {
        let query_mbr = container.mbr();
        let candidates = {
            let state = Arc::clone(&self.state.read());
            state.tree.search_intersects(&query_mbr)
        };
        let mut out = Vec::with_capacity(candidates.len());
        for pk in candidates {
            let geometry = self.load_geometry(view, &pk)?;
            if geometry.within_exact(container) {
                out.push(pk);
            }
        }
        Ok(out)
    }

    /// Exact intersection against an arbitrary geometry.
    pub fn search_intersects_exact(
        &self,
        view: &dyn KvRead,
        query: &Geometry,
    ) -> Result<Vec<String>> {
        let query_mbr = query.mbr();
        let candidates = {
            let state = Arc::clone(&self.state.read());
            state.tree.search_intersects(&query_mbr)
        };
        let mut out = Vec::with_capacity(candidates.len());
        for pk in candidates {
            let geometry = self.load_geometry(view, &pk)?;
            if geometry.intersects_exact(query) {
                out.push(pk);
            }
        }
        Ok(out)
    }

    /// The `k` entries nearest to `point`, distance-sorted ascending.
    pub fn nearest_k(&self, point: &GeoPoint, k: usize) -> Vec<SpatialHit> {
        let state = Arc::clone(&self.state.read());
        state
            .tree
            .nearest_k(point, k)
            .into_iter()
            .map(|(entry, distance_m)| SpatialHit {
                pk: entry.pk,
                distance_m,
            })
            .collect()
    }

    fn load_geometry(&self, view: &dyn KvRead, pk: &str) -> Result<Geometry> {
        let bytes = view
            .get(&key::spatial_entry_key(&self.spec.table, &self.spec.field, pk))
            .ok_or_else(|| {
                ThemisError::corruption(format!("spatial row missing for candidate {pk}"))
            })?;
        let row: SpatialRow = bincode::deserialize(&bytes)?;
        Geometry::from_ewkb(&row.ewkb)
    }

    /// Prefix owning everything this index persisted; drop erases it.
    pub fn keyspace_prefix(&self) -> Vec<u8> {
        key::spatial_index_prefix(&self.spec.table, &self.spec.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_storage::KvEngine;

    fn spec() -> SpatialIndexSpec {
        SpatialIndexSpec {
            name: "loc".into(),
            table: "hotels".into(),
            field: "location".into(),
        }
    }

    fn populated(engine: &KvEngine) -> SpatialIndex {
        let snap = engine.snapshot();
        let index = SpatialIndex::open(spec(), &snap).unwrap();
        let mut batch = WriteBatch::new();
        // Berlin-ish grid plus one far-away point.
        for i in 0..50 {
            let pk = format!("h-{i:02}");
            let lon = 13.3 + (i % 10) as f64 * 0.04;
            let lat = 52.4 + (i / 10) as f64 * 0.04;
            let g = Geometry::Point(GeoPoint::new(lon, lat));
            let mbr = index.stage_put(&pk, &g, &mut batch).unwrap();
            index.on_commit_put(&pk, mbr);
        }
        let munich = Geometry::Point(GeoPoint::new(11.58, 48.14));
        let mbr = index.stage_put("munich", &munich, &mut batch).unwrap();
        index.on_commit_put("munich", mbr);
        engine.apply(&batch, engine.committed_seq() + 1);
        index
    }

    #[test]
    fn intersects_candidates_in_bbox() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        let berlin_box = Mbr::new(13.25, 52.35, 13.75, 52.65);
        let hits = index.search_intersects(&berlin_box);
        assert_eq!(hits.len(), 50);
        assert!(!hits.contains(&"munich".to_string()));
    }

    #[test]
    fn within_polygon_exact_pass() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        let snap = engine.snapshot();
        // Triangle that clips the bbox: MBR candidates alone would
        // over-report; the exact pass must prune them.
        let triangle = Geometry::Polygon {
            exterior: vec![
                GeoPoint::new(13.3, 52.4),
                GeoPoint::new(13.5, 52.4),
                GeoPoint::new(13.3, 52.6),
                GeoPoint::new(13.3, 52.4),
            ],
            holes: vec![],
        };
        let within = index.search_within(&snap, &triangle).unwrap();
        assert!(!within.is_empty());
        // Everything returned is genuinely inside the triangle.
        for pk in &within {
            let i: usize = pk[2..].parse().unwrap();
            let lon = 13.3 + (i % 10) as f64 * 0.04;
            let lat = 52.4 + (i / 10) as f64 * 0.04;
            // Triangle edge: lon-13.3 scaled + lat-52.4 scaled <= 0.2 span.
            assert!(
                (lon - 13.3) + (lat - 52.4) <= 0.2 + 1e-9,
                "{pk} at ({lon},{lat}) outside triangle"
            );
        }
        // And at least one bbox candidate was pruned.
        let bbox_candidates = index.search_intersects(&triangle.mbr());
        assert!(within.len() < bbox_candidates.len());
    }

    #[test]
    fn nearest_k_sorted() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        let hits = index.nearest_k(&GeoPoint::new(11.6, 48.1), 3);
        assert_eq!(hits[0].pk, "munich");
        assert!(hits.windows(2).all(|w| w[0].distance_m <= w[1].distance_m));
    }

    #[test]
    fn area_ratio_reflects_query_size() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        let tiny = Mbr::new(13.3, 52.4, 13.31, 52.41);
        let huge = index.total_bounds();
        assert!(index.area_ratio(&tiny) < 0.05);
        assert!((index.area_ratio(&huge) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn update_moves_entry() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        let mut batch = WriteBatch::new();
        let moved = Geometry::Point(GeoPoint::new(9.99, 53.55));
        let mbr = index.stage_put("h-00", &moved, &mut batch).unwrap();
        index.on_commit_put("h-00", mbr);
        engine.apply(&batch, engine.committed_seq() + 1);

        let berlin_box = Mbr::new(13.25, 52.35, 13.75, 52.65);
        assert!(!index.search_intersects(&berlin_box).contains(&"h-00".to_string()));
        let hamburg_box = Mbr::new(9.9, 53.5, 10.1, 53.6);
        assert_eq!(index.search_intersects(&hamburg_box), vec!["h-00".to_string()]);
    }

    #[test]
    fn reopen_from_rows() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        drop(index);
        let snap = engine.snapshot();
        let reopened = SpatialIndex::open(spec(), &snap).unwrap();
        assert_eq!(reopened.len(), 51);
        let berlin_box = Mbr::new(13.25, 52.35, 13.75, 52.65);
        assert_eq!(reopened.search_intersects(&berlin_box).len(), 50);
    }

    #[test]
    fn delete_removes_entry() {
        let engine = KvEngine::new();
        let index = populated(&engine);
        let mut batch = WriteBatch::new();
        index.stage_delete("munich", &mut batch);
        index.on_commit_delete("munich");
        engine.apply(&batch, engine.committed_seq() + 1);
        assert_eq!(index.len(), 50);
        let hits = index.nearest_k(&GeoPoint::new(11.6, 48.1), 1);
        assert_ne!(hits[0].pk, "munich");
    }
}
