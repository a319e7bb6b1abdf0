//! Cost-based plan choice.
//!
//! Costs (design form, not wall-clock):
//!
//! ```text
//! cost_composite = log N + selectivity * (cost_spatial + cost_vector)
//! cost_spatial   = log N + area_ratio * cost_vector
//! cost_vector    = log N + k * ef_search * dim
//! cost_scan      = N
//! ```
//!
//! The choice rule is fixed precedence, not cost minimisation: a hint wins,
//! then a selective composite prefix, then a small spatial box, then a
//! vector scorer, then the scan. Costs are still computed and attached to
//! the query span. A predicate whose index is missing silently drops out of
//! the race; the planner never errors over absent indices.

use crate::plan::{FilterOp, PlanKind, Query};
use themis_core::{Result, Value};
use themis_engine::Database;
use themis_index::CompositeIndexSpec;
use tracing::debug;

/// Costs attached to the chosen plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanCosts {
    /// Composite-first cost, when a prefix exists.
    pub composite: Option<f64>,
    /// Spatial-first cost, when predicate and index exist.
    pub spatial: Option<f64>,
    /// Vector-first cost, when scorer and index exist.
    pub vector: Option<f64>,
    /// Full scan cost.
    pub scan: f64,
    /// Equality-prefix selectivity of the best composite.
    pub selectivity: Option<f64>,
    /// Query-MBR over total-bounds area ratio.
    pub area_ratio: Option<f64>,
}

/// The planner's decision.
pub struct PlanChoice {
    /// Plan to execute.
    pub kind: PlanKind,
    /// Best composite prefix: the spec and the bound equality values.
    pub composite: Option<(CompositeIndexSpec, Vec<Value>)>,
    /// Costs for observability.
    pub costs: PlanCosts,
}

/// Longest all-equality prefix of `spec.fields` bound by the query.
fn equality_prefix(spec: &CompositeIndexSpec, query: &Query) -> Vec<Value> {
    let mut values = Vec::new();
    for field in &spec.fields {
        let bound = query
            .filters
            .iter()
            .find(|f| f.op == FilterOp::Eq && &f.field == field);
        match bound {
            Some(f) => values.push(f.value.clone()),
            None => break,
        }
    }
    values
}

/// Choose a plan for `query`.
pub fn plan_query(db: &Database, query: &Query) -> Result<PlanChoice> {
    let snapshot_seq = db.engine().committed_seq();
    let indexes = db.table_indexes(&query.table);
    let n = db
        .stats()
        .table_rows(db.engine(), snapshot_seq, &query.table)
        .max(1) as f64;
    let log_n = n.ln().max(1.0);

    // Best composite: longest bound prefix, lowest selectivity on ties.
    let mut best_composite: Option<(CompositeIndexSpec, Vec<Value>, f64)> = None;
    for spec in indexes.composites.iter() {
        let values = equality_prefix(spec, query);
        if values.is_empty() {
            continue;
        }
        let selectivity =
            db.stats()
                .composite_selectivity(db.engine(), snapshot_seq, spec, &values)?;
        let better = match &best_composite {
            None => true,
            Some((_, existing, existing_sel)) => values.len() > existing.len()
                || (values.len() == existing.len() && selectivity < *existing_sel),
        };
        if better {
            best_composite = Some((spec.clone(), values, selectivity));
        }
    }

    // Vector leaf cost.
    let vector_cost = query.vector.as_ref().and_then(|scorer| {
        let index = db.vector_index(&query.table, &scorer.field)?;
        let ef = scorer
            .ef_search
            .unwrap_or(db.config().vector_ef_search_default);
        let dim = index.spec().dim as f64;
        Some(log_n + scorer.k as f64 * ef as f64 * dim)
    });
    let vector_leaf = vector_cost.unwrap_or(0.0);

    // Spatial cost.
    let spatial = query.spatial.as_ref().and_then(|predicate| {
        let index = db.spatial_index(&query.table, predicate.field())?;
        let ratio = index.area_ratio(&predicate.query_mbr());
        Some((log_n + ratio * vector_leaf, ratio))
    });
    let (spatial_cost, area_ratio) = match spatial {
        Some((c, r)) => (Some(c), Some(r)),
        None => (None, None),
    };

    let composite_cost = best_composite.as_ref().map(|(_, _, selectivity)| {
        log_n + selectivity * (spatial_cost.unwrap_or(0.0) + vector_leaf)
    });

    let costs = PlanCosts {
        composite: composite_cost,
        spatial: spatial_cost,
        vector: vector_cost,
        scan: n,
        selectivity: best_composite.as_ref().map(|(_, _, s)| *s),
        area_ratio,
    };

    // Fixed precedence.
    let kind = if let Some(forced) = query.options.force_plan {
        forced
    } else if best_composite
        .as_ref()
        .is_some_and(|(_, _, s)| *s <= db.config().composite_selectivity_threshold)
    {
        PlanKind::CompositeFirst
    } else if area_ratio.is_some_and(|r| r <= db.config().bbox_ratio_threshold) {
        PlanKind::SpatialFirst
    } else if vector_cost.is_some() {
        PlanKind::VectorFirst
    } else {
        PlanKind::FullScan
    };

    debug!(
        table = %query.table,
        plan = ?kind,
        selectivity = ?costs.selectivity,
        area_ratio = ?costs.area_ratio,
        "plan chosen"
    );
    Ok(PlanChoice {
        kind,
        composite: best_composite.map(|(spec, values, _)| (spec, values)),
        costs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{FieldFilter, SpatialPredicate, VectorScorer};
    use themis_core::{DbConfig, GeoPoint, Mbr, Value};
    use themis_engine::{Database, IndexDescriptor};
    use themis_index::CompositeIndexSpec;
    use themis_vector::{DistanceMetric, HnswParams, VectorIndexSpec};

    fn hotel(i: usize, city: &str) -> Value {
        Value::object([
            ("city", Value::from(city)),
            ("category", Value::from("hotel")),
            (
                "location",
                Value::Array(vec![
                    Value::Float(13.3 + (i % 10) as f64 * 0.01),
                    Value::Float(52.4 + (i / 10) as f64 * 0.01),
                ]),
            ),
            ("embedding", Value::Vector(vec![i as f32, 1.0, 0.0, 0.0])),
        ])
    }

    fn seeded() -> Database {
        let db = Database::memory(DbConfig::default()).unwrap();
        db.create_index(IndexDescriptor::Composite(CompositeIndexSpec {
            name: "city_cat".into(),
            table: "hotels".into(),
            fields: vec!["city".into(), "category".into()],
        }))
        .unwrap();
        db.create_index(IndexDescriptor::Spatial(themis_spatial::SpatialIndexSpec {
            name: "loc".into(),
            table: "hotels".into(),
            field: "location".into(),
        }))
        .unwrap();
        db.create_index(IndexDescriptor::Vector(VectorIndexSpec {
            name: "emb".into(),
            table: "hotels".into(),
            field: "embedding".into(),
            dim: 4,
            metric: DistanceMetric::Cosine,
            params: HnswParams { m: 8, ef_construction: 32, ef_search: 16 },
        }))
        .unwrap();

        let mut txn = db.begin();
        for i in 0..200 {
            let city = if i < 4 { "Rare" } else { "Berlin" };
            txn.put("hotels", &format!("h-{i:03}"), hotel(i, city), false)
                .unwrap();
        }
        txn.commit().unwrap();
        db
    }

    fn base_query() -> Query {
        Query::table("hotels")
    }

    #[test]
    fn selective_prefix_wins() {
        let db = seeded();
        let mut q = base_query();
        q.filters.push(FieldFilter {
            field: "city".into(),
            op: FilterOp::Eq,
            value: Value::from("Rare"),
        });
        // 4/200 = 2% > 1% default threshold: not composite. Tighten it.
        let choice = plan_query(&db, &q).unwrap();
        assert!(choice.costs.selectivity.unwrap() > 0.01);
        assert_eq!(choice.kind, PlanKind::FullScan);
    }

    #[test]
    fn small_bbox_prefers_spatial() {
        let db = seeded();
        let mut q = base_query();
        q.spatial = Some(SpatialPredicate::WithinBBox {
            field: "location".into(),
            mbr: Mbr::new(13.3, 52.4, 13.31, 52.41),
        });
        let choice = plan_query(&db, &q).unwrap();
        assert_eq!(choice.kind, PlanKind::SpatialFirst);
        assert!(choice.costs.area_ratio.unwrap() < 0.3);
    }

    #[test]
    fn vector_only_prefers_vector() {
        let db = seeded();
        let mut q = base_query();
        q.vector = Some(VectorScorer {
            field: "embedding".into(),
            query: vec![1.0, 0.0, 0.0, 0.0],
            k: 5,
            ef_search: None,
        });
        let choice = plan_query(&db, &q).unwrap();
        assert_eq!(choice.kind, PlanKind::VectorFirst);
    }

    #[test]
    fn missing_index_falls_back_silently() {
        let db = Database::memory(DbConfig::default()).unwrap();
        let mut txn = db.begin();
        txn.put("bare", "r-1", Value::object([("x", Value::from(1i64))]), false)
            .unwrap();
        txn.commit().unwrap();

        let mut q = Query::table("bare");
        q.spatial = Some(SpatialPredicate::DistanceCap {
            field: "location".into(),
            center: GeoPoint::new(0.0, 0.0),
            radius_m: 1000.0,
        });
        let choice = plan_query(&db, &q).unwrap();
        assert_eq!(choice.kind, PlanKind::FullScan);
    }

    #[test]
    fn force_plan_hint_wins() {
        let db = seeded();
        let mut q = base_query();
        q.vector = Some(VectorScorer {
            field: "embedding".into(),
            query: vec![1.0, 0.0, 0.0, 0.0],
            k: 5,
            ef_search: None,
        });
        q.options.force_plan = Some(PlanKind::FullScan);
        let choice = plan_query(&db, &q).unwrap();
        assert_eq!(choice.kind, PlanKind::FullScan);
    }
}
