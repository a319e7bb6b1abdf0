//! The normalised query tree.

use std::time::Instant;
use themis_core::{GeoPoint, Geometry, Mbr, Result, ThemisError, Value};

/// Comparison operators for scalar filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Strictly less.
    Lt,
    /// Less or equal.
    Le,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    Ge,
}

/// One conjunctive scalar filter.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    /// Dotted field path.
    pub field: String,
    /// Operator.
    pub op: FilterOp,
    /// Comparison value.
    pub value: Value,
}

impl FieldFilter {
    /// Evaluate against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        let field_value = match doc.get_path(&self.field) {
            Some(v) => v,
            None => return false,
        };
        match self.op {
            FilterOp::Eq => field_value == &self.value,
            _ => {
                let ordering = match (field_value.as_float(), self.value.as_float()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => match (field_value.as_str(), self.value.as_str()) {
                        (Some(a), Some(b)) => Some(a.cmp(b)),
                        _ => None,
                    },
                };
                match (self.op, ordering) {
                    (FilterOp::Lt, Some(o)) => o.is_lt(),
                    (FilterOp::Le, Some(o)) => o.is_le(),
                    (FilterOp::Gt, Some(o)) => o.is_gt(),
                    (FilterOp::Ge, Some(o)) => o.is_ge(),
                    _ => false,
                }
            }
        }
    }
}

/// The single allowed spatial predicate.
#[derive(Debug, Clone)]
pub enum SpatialPredicate {
    /// Geometry MBR intersects a rectangle.
    WithinBBox {
        /// Geometry field.
        field: String,
        /// Query rectangle.
        mbr: Mbr,
    },
    /// Geometry lies entirely inside a polygon (exact).
    Within {
        /// Geometry field.
        field: String,
        /// Containing geometry.
        geometry: Geometry,
    },
    /// Geometry intersects another geometry (exact).
    Intersects {
        /// Geometry field.
        field: String,
        /// Probe geometry.
        geometry: Geometry,
    },
    /// Geometry within a great-circle distance of a point.
    DistanceCap {
        /// Geometry field.
        field: String,
        /// Circle centre.
        center: GeoPoint,
        /// Radius in metres.
        radius_m: f64,
    },
}

impl SpatialPredicate {
    /// The geometry field this predicate constrains.
    pub fn field(&self) -> &str {
        match self {
            SpatialPredicate::WithinBBox { field, .. }
            | SpatialPredicate::Within { field, .. }
            | SpatialPredicate::Intersects { field, .. }
            | SpatialPredicate::DistanceCap { field, .. } => field,
        }
    }

    /// Bounding rectangle of the predicate, for candidate generation and
    /// the planner's area ratio.
    pub fn query_mbr(&self) -> Mbr {
        match self {
            SpatialPredicate::WithinBBox { mbr, .. } => *mbr,
            SpatialPredicate::Within { geometry, .. }
            | SpatialPredicate::Intersects { geometry, .. } => geometry.mbr(),
            SpatialPredicate::DistanceCap { center, radius_m, .. } => {
                // Degree box around the circle; latitude degrees are fixed,
                // longitude degrees shrink with latitude.
                let dlat = radius_m / 111_320.0;
                let dlon = radius_m / (111_320.0 * center.lat.to_radians().cos().max(1e-6));
                Mbr::new(
                    center.lon - dlon,
                    center.lat - dlat,
                    center.lon + dlon,
                    center.lat + dlat,
                )
            }
        }
    }
}

/// The single allowed vector scorer.
#[derive(Debug, Clone)]
pub struct VectorScorer {
    /// Vector field.
    pub field: String,
    /// Query vector.
    pub query: Vec<f32>,
    /// Requested neighbours.
    pub k: usize,
    /// Per-query `ef_search` override.
    pub ef_search: Option<usize>,
}

/// Result ordering.
#[derive(Debug, Clone)]
pub enum OrderBy {
    /// By a document column.
    Column {
        /// Dotted field path.
        field: String,
        /// Descending instead of ascending.
        descending: bool,
    },
    /// By the vector score (descending similarity / ascending distance).
    Score,
}

/// Cursor anchor: the `(order_value, pk)` of the last emitted row.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    /// Order-column value of the anchor row.
    pub value: Value,
    /// Primary key of the anchor row.
    pub pk: String,
}

/// The plan space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Composite prefix scan first, everything else pushed behind it.
    CompositeFirst,
    /// R-tree candidates first, ANN with whitelist prefilter after.
    SpatialFirst,
    /// ANN with overfetch first, predicates rerank after.
    VectorFirst,
    /// Walk the table.
    FullScan,
}

/// Execution hints and limits.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the configured ANN overfetch factor.
    pub overfetch: Option<f64>,
    /// Forces a plan, skipping the choice rule.
    pub force_plan: Option<PlanKind>,
    /// Wall-clock deadline; expiry returns partial results flagged
    /// `truncated`.
    pub deadline: Option<Instant>,
}

/// A normalised query.
#[derive(Debug, Clone)]
pub struct Query {
    /// Target table.
    pub table: String,
    /// Conjunctive scalar filters.
    pub filters: Vec<FieldFilter>,
    /// At most one spatial predicate.
    pub spatial: Option<SpatialPredicate>,
    /// At most one vector scorer.
    pub vector: Option<VectorScorer>,
    /// Result ordering.
    pub order_by: Option<OrderBy>,
    /// Row cap.
    pub limit: Option<usize>,
    /// Resume strictly after this anchor.
    pub cursor: Option<Cursor>,
    /// Hints.
    pub options: QueryOptions,
}

impl Query {
    /// A query over one table with everything else empty.
    pub fn table(table: impl Into<String>) -> Query {
        Query {
            table: table.into(),
            filters: Vec::new(),
            spatial: None,
            vector: None,
            order_by: None,
            limit: None,
            cursor: None,
            options: QueryOptions::default(),
        }
    }

    /// Structural validation; malformed trees are `InvalidQuery`.
    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(ThemisError::invalid_query("empty table name"));
        }
        for filter in &self.filters {
            if filter.field.is_empty() {
                return Err(ThemisError::invalid_query("filter with empty field"));
            }
            if matches!(
                filter.value,
                Value::Array(_) | Value::Object(_) | Value::Vector(_)
            ) {
                return Err(ThemisError::invalid_query(format!(
                    "filter on {} compares a non-scalar",
                    filter.field
                )));
            }
        }
        if let Some(v) = &self.vector {
            if v.k == 0 {
                return Err(ThemisError::invalid_query("vector scorer with k = 0"));
            }
            if v.query.is_empty() || v.query.iter().any(|c| !c.is_finite()) {
                return Err(ThemisError::invalid_query("malformed query vector"));
            }
        }
        if let Some(SpatialPredicate::DistanceCap { radius_m, .. }) = &self.spatial {
            if !radius_m.is_finite() || *radius_m <= 0.0 {
                return Err(ThemisError::invalid_query("non-positive distance cap"));
            }
        }
        if self.limit == Some(0) {
            return Err(ThemisError::invalid_query("limit 0"));
        }
        if self.cursor.is_some() {
            match &self.order_by {
                Some(OrderBy::Column { .. }) => {}
                _ => {
                    return Err(ThemisError::invalid_query(
                        "cursor requires an order-by column",
                    ))
                }
            }
        }
        if matches!(self.order_by, Some(OrderBy::Score)) && self.vector.is_none() {
            return Err(ThemisError::invalid_query(
                "score ordering without a vector scorer",
            ));
        }
        Ok(())
    }
}

/// One result row.
#[derive(Debug, Clone)]
pub struct Row {
    /// Primary key.
    pub pk: String,
    /// The entity document.
    pub value: Value,
    /// Vector score when a scorer ran (orientation per metric).
    pub score: Option<f32>,
}

/// A query result page.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Rows, in final order.
    pub rows: Vec<Row>,
    /// A further page exists.
    pub has_more: bool,
    /// Anchor for the next page, when column-ordered.
    pub next_cursor: Option<Cursor>,
    /// The deadline expired; rows hold what was produced in time.
    pub truncated: bool,
    /// The executed plan.
    pub plan: PlanKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matching() {
        let doc = Value::object([
            ("city", Value::from("Berlin")),
            ("stars", Value::from(4i64)),
        ]);
        let eq = FieldFilter {
            field: "city".into(),
            op: FilterOp::Eq,
            value: Value::from("Berlin"),
        };
        assert!(eq.matches(&doc));

        let ge = FieldFilter {
            field: "stars".into(),
            op: FilterOp::Ge,
            value: Value::from(4i64),
        };
        assert!(ge.matches(&doc));

        let lt = FieldFilter {
            field: "stars".into(),
            op: FilterOp::Lt,
            value: Value::from(4i64),
        };
        assert!(!lt.matches(&doc));

        let missing = FieldFilter {
            field: "rooms".into(),
            op: FilterOp::Eq,
            value: Value::from(1i64),
        };
        assert!(!missing.matches(&doc));
    }

    #[test]
    fn numeric_comparison_widens_ints() {
        let doc = Value::object([("price", Value::Float(99.5))]);
        let filter = FieldFilter {
            field: "price".into(),
            op: FilterOp::Le,
            value: Value::from(100i64),
        };
        assert!(filter.matches(&doc));
    }

    #[test]
    fn validation_rejects_malformed_trees() {
        let mut q = Query::table("t");
        q.vector = Some(VectorScorer {
            field: "emb".into(),
            query: vec![1.0, f32::NAN],
            k: 5,
            ef_search: None,
        });
        assert!(matches!(
            q.validate(),
            Err(ThemisError::InvalidQuery { .. })
        ));

        let mut q = Query::table("t");
        q.cursor = Some(Cursor { value: Value::from(1i64), pk: "a".into() });
        assert!(q.validate().is_err());

        let mut q = Query::table("t");
        q.limit = Some(0);
        assert!(q.validate().is_err());

        assert!(Query::table("t").validate().is_ok());
    }

    #[test]
    fn distance_cap_mbr_contains_circle() {
        let p = SpatialPredicate::DistanceCap {
            field: "loc".into(),
            center: GeoPoint::new(13.4, 52.5),
            radius_m: 50_000.0,
        };
        let mbr = p.query_mbr();
        assert!(mbr.contains_point(&GeoPoint::new(13.4, 52.5)));
        // ~50km north is inside the box.
        assert!(mbr.contains_point(&GeoPoint::new(13.4, 52.5 + 0.44)));
        assert!(!mbr.contains_point(&GeoPoint::new(13.4, 54.0)));
    }
}
