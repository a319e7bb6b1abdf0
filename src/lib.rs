//! ThemisDB: a single-node embedded multi-model database.
//!
//! JSON-shaped entities in a log-structured KV engine, with secondary,
//! full-text, HNSW vector, R*-tree spatial and property-graph indices kept
//! transactionally consistent, and a cost-based hybrid query executor over
//! all of them.
//!
//! ```no_run
//! use themisdb::{Database, DbConfig, Query, QueryExt, Value};
//!
//! # fn main() -> themisdb::Result<()> {
//! let db = Database::open("data/demo", DbConfig::default())?;
//! let mut txn = db.begin();
//! txn.put(
//!     "hotels",
//!     "h-1",
//!     Value::object([("city", Value::from("Berlin"))]),
//!     false,
//! )?;
//! txn.commit()?;
//!
//! let page = db.query(Query::table("hotels"))?;
//! assert_eq!(page.rows.len(), 1);
//! # Ok(())
//! # }
//! ```

pub use themis_core::{
    Compression, DbConfig, GeoPoint, Geometry, Mbr, Result, ThemisError, Value, WalFsync,
};
pub use themis_durability::{ChangeKind, ChangeRecord};
pub use themis_engine::{Database, IndexDescriptor, RetryConfig, Transaction};
pub use themis_graph::{GeoCircleFilter, PathResult};
pub use themis_index::{
    CompositeIndexSpec, FullTextSpec, ScalarIndexKind, ScalarIndexSpec, TextMatch, TtlIndexSpec,
};
pub use themis_query::{
    execute, Cursor, FieldFilter, FilterOp, OrderBy, PlanKind, Query, QueryOptions, QueryResult,
    Row, SpatialPredicate, VectorScorer,
};
pub use themis_spatial::{SpatialHit, SpatialIndexSpec};
pub use themis_vector::{DistanceMetric, HnswParams, VectorHit, VectorIndexSpec, WhitelistParams};

use themis_core::key;
use themis_storage::KvRead;

/// Query entry points on [`Database`].
pub trait QueryExt {
    /// Run a hybrid query.
    fn query(&self, query: Query) -> Result<QueryResult>;

    /// BM25 full-text search over a declared full-text index. All query
    /// terms must match (`AND` semantics).
    fn search_text(
        &self,
        table: &str,
        field: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<TextMatch>>;

    /// k-nearest entities by great-circle distance over a spatial index.
    fn nearest(&self, table: &str, field: &str, point: GeoPoint, k: usize)
        -> Result<Vec<SpatialHit>>;

    /// Breadth-first traversal of a named graph.
    fn graph_bfs(&self, graph: &str, start: &str, max_depth: usize)
        -> Result<Vec<(String, usize)>>;

    /// Weighted shortest path with an optional geo circle restricted to
    /// vertices of `vertex_table` whose `location_field` lies inside.
    /// `NotFound` when no path survives the filters.
    #[allow(clippy::too_many_arguments)]
    fn graph_shortest_path(
        &self,
        graph: &str,
        from: &str,
        to: &str,
        weight_attr: &str,
        vertex_table: &str,
        location_field: &str,
        geo: Option<(GeoPoint, f64)>,
    ) -> Result<PathResult>;

    /// PageRank over a named graph.
    fn graph_pagerank(
        &self,
        graph: &str,
        tolerance: f64,
        max_iterations: usize,
    ) -> Result<Vec<(String, f64)>>;

    /// Connected components of a named graph, undirected.
    fn graph_components(&self, graph: &str) -> Result<Vec<Vec<String>>>;

    /// In/out degree per vertex of a named graph.
    fn graph_degrees(&self, graph: &str) -> Result<Vec<(String, usize, usize)>>;
}

fn entity_location(
    view: &dyn KvRead,
    table: &str,
    field: &str,
    pk: &str,
) -> Option<GeoPoint> {
    let bytes = view.get(&key::entity_key(table, pk))?;
    let value = Value::decode(&bytes).ok()?;
    let geometry = themis_core::geo::geometry_from_value(value.get_path(field)?).ok()?;
    geometry.representative_point()
}

impl QueryExt for Database {
    fn query(&self, query: Query) -> Result<QueryResult> {
        execute(self, query)
    }

    fn search_text(
        &self,
        table: &str,
        field: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<TextMatch>> {
        let spec = self
            .fulltext_index(table, field)
            .ok_or_else(|| ThemisError::not_found(format!("full-text index on {table}.{field}")))?;
        let snapshot = self.snapshot();
        themis_index::fulltext::search(&snapshot, &spec, text, limit, true)
    }

    fn nearest(
        &self,
        table: &str,
        field: &str,
        point: GeoPoint,
        k: usize,
    ) -> Result<Vec<SpatialHit>> {
        let index = self
            .spatial_index(table, field)
            .ok_or_else(|| ThemisError::not_found(format!("spatial index on {table}.{field}")))?;
        Ok(index.nearest_k(&point, k))
    }

    fn graph_bfs(
        &self,
        graph: &str,
        start: &str,
        max_depth: usize,
    ) -> Result<Vec<(String, usize)>> {
        let snapshot = self.snapshot();
        themis_graph::algo::bfs(&snapshot, graph, start, max_depth, None, None)
    }

    fn graph_shortest_path(
        &self,
        graph: &str,
        from: &str,
        to: &str,
        weight_attr: &str,
        vertex_table: &str,
        location_field: &str,
        geo: Option<(GeoPoint, f64)>,
    ) -> Result<PathResult> {
        let snapshot = self.snapshot();
        let locate =
            |pk: &str| entity_location(&snapshot, vertex_table, location_field, pk);
        let filter = geo.map(|(center, radius_m)| GeoCircleFilter {
            center,
            radius_m,
            locate: &locate,
        });
        themis_graph::algo::shortest_path(
            &snapshot,
            graph,
            from,
            to,
            weight_attr,
            None,
            filter.as_ref(),
        )?
        .ok_or_else(|| ThemisError::not_found(format!("path {from} -> {to} in {graph}")))
    }

    fn graph_pagerank(
        &self,
        graph: &str,
        tolerance: f64,
        max_iterations: usize,
    ) -> Result<Vec<(String, f64)>> {
        let snapshot = self.snapshot();
        let ranks = themis_graph::algo::pagerank(&snapshot, graph, tolerance, max_iterations)?;
        let mut out: Vec<(String, f64)> = ranks.into_iter().collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(out)
    }

    fn graph_components(&self, graph: &str) -> Result<Vec<Vec<String>>> {
        let snapshot = self.snapshot();
        themis_graph::algo::connected_components(&snapshot, graph)
    }

    fn graph_degrees(&self, graph: &str) -> Result<Vec<(String, usize, usize)>> {
        let snapshot = self.snapshot();
        let degrees = themis_graph::algo::degree_centrality(&snapshot, graph)?;
        let mut out: Vec<(String, usize, usize)> = degrees
            .into_iter()
            .map(|(v, (i, o))| (v, i, o))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
