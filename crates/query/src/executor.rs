//! Plan execution.
//!
//! Strategies:
//! - `CompositeFirst`: composite prefix scan -> whitelist -> spatial exact
//!   check and/or ANN with whitelist prefilter
//! - `SpatialFirst`: R-tree candidates (exact pass where the predicate
//!   needs one) -> whitelist -> ANN with whitelist prefilter
//! - `VectorFirst`: ANN overfetch (`k' = k * overfetch`) -> evaluate scalar
//!   and spatial predicates -> keep top k by score
//! - `FullScan`: table walk; a range index on the order column takes over
//!   when one exists, which is what makes cursor pages cheap
//!
//! Any plan whose intermediate order differs from the requested one gets a
//! final sort before `limit + 1` pagination. Deadlines are checked at stage
//! boundaries and inside row loops; expiry returns the rows produced so
//! far with `truncated = true`.

use crate::plan::{
    Cursor, OrderBy, PlanKind, Query, QueryResult, Row, SpatialPredicate,
};
use crate::planner::{plan_query, PlanChoice};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;
use themis_core::geo::{self, Geometry};
use themis_core::{key, Result, ThemisError, Value};
use themis_engine::Database;
use themis_index::secondary::{self, RangeScan, ScalarIndexKind};
use themis_storage::{KvRead, Snapshot};
use themis_vector::DistanceBackend;
use tracing::{debug, info_span};

/// Execute a query against the latest committed state.
pub fn execute(db: &Database, query: Query) -> Result<QueryResult> {
    query.validate()?;
    let choice = plan_query(db, &query)?;
    let span = info_span!(
        "query",
        table = %query.table,
        plan = ?choice.kind,
        cost_composite = choice.costs.composite,
        cost_spatial = choice.costs.spatial,
        cost_vector = choice.costs.vector,
        cost_scan = choice.costs.scan,
        composite_prefilter_size = tracing::field::Empty,
        spatial_prefilter_size = tracing::field::Empty,
        vector_rerank_count = tracing::field::Empty,
        overfetch_factor_effective = tracing::field::Empty,
        whitelist_hit_rate = tracing::field::Empty,
    );
    let _enter = span.enter();

    let snapshot = db.snapshot();
    let mut ctx = ExecCtx {
        db,
        snapshot: &snapshot,
        query: &query,
        span: &span,
        truncated: false,
    };

    // A forced or chosen plan whose index turns out absent falls back to
    // the scan; the executor never errors over a missing index.
    let kind = effective_kind(&ctx, &choice);
    let rows = match kind {
        PlanKind::CompositeFirst => {
            let (spec, values) = match &choice.composite {
                Some(pair) => pair,
                None => unreachable!("effective_kind verified the prefix"),
            };
            let pks: Vec<String> =
                secondary::scan_composite_prefix(ctx.snapshot, spec, values, usize::MAX)?
                    .into_iter()
                    .map(|e| e.pk)
                    .collect();
            span.record("composite_prefilter_size", pks.len());
            ctx.finish_whitelist(pks, false)?
        }
        PlanKind::SpatialFirst => {
            let predicate = match &query.spatial {
                Some(p) => p,
                None => unreachable!("effective_kind verified the predicate"),
            };
            let pks = ctx.spatial_candidates(predicate)?;
            span.record("spatial_prefilter_size", pks.len());
            ctx.finish_whitelist(pks, true)?
        }
        PlanKind::VectorFirst => ctx.vector_first()?,
        PlanKind::FullScan => ctx.full_scan()?,
    };

    let truncated = ctx.truncated;
    // The executor normalises score orientation for the final sort: L2
    // scores are distances and ascend, cosine/IP similarities descend.
    let score_ascending = query
        .vector
        .as_ref()
        .and_then(|s| db.vector_index(&query.table, &s.field))
        .map(|i| i.spec().metric.lower_is_better())
        .unwrap_or(false);
    Ok(finalize(&query, kind, rows, truncated, score_ascending))
}

fn effective_kind(ctx: &ExecCtx, choice: &PlanChoice) -> PlanKind {
    match choice.kind {
        PlanKind::CompositeFirst if choice.composite.is_none() => PlanKind::FullScan,
        PlanKind::SpatialFirst
            if ctx.query.spatial.as_ref().map_or(true, |p| {
                ctx.db.spatial_index(&ctx.query.table, p.field()).is_none()
            }) =>
        {
            PlanKind::FullScan
        }
        PlanKind::VectorFirst
            if ctx.query.vector.as_ref().map_or(true, |v| {
                ctx.db.vector_index(&ctx.query.table, &v.field).is_none()
            }) =>
        {
            PlanKind::FullScan
        }
        kind => kind,
    }
}

struct ExecCtx<'a> {
    db: &'a Database,
    snapshot: &'a Snapshot,
    query: &'a Query,
    span: &'a tracing::Span,
    truncated: bool,
}

impl ExecCtx<'_> {
    fn deadline_hit(&mut self) -> bool {
        if let Some(deadline) = self.query.options.deadline {
            if Instant::now() >= deadline {
                self.truncated = true;
                return true;
            }
        }
        false
    }

    fn load(&self, pk: &str) -> Result<Option<Value>> {
        match self.snapshot.get(&key::entity_key(&self.query.table, pk)) {
            Some(bytes) => {
                let value = Value::decode(&bytes)?;
                if self.db.is_visible(&self.query.table, &value) {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn scalar_filters_pass(&self, value: &Value) -> bool {
        self.query.filters.iter().all(|f| f.matches(value))
    }

    fn spatial_pass(&self, value: &Value) -> bool {
        let predicate = match &self.query.spatial {
            Some(p) => p,
            None => return true,
        };
        let geometry = match value
            .get_path(predicate.field())
            .map(geo::geometry_from_value)
        {
            Some(Ok(g)) => g,
            _ => return false,
        };
        evaluate_spatial(predicate, &geometry)
    }

    /// Whitelist from the spatial index, exact where the predicate asks.
    fn spatial_candidates(&self, predicate: &SpatialPredicate) -> Result<Vec<String>> {
        let index = self
            .db
            .spatial_index(&self.query.table, predicate.field())
            .ok_or_else(|| ThemisError::internal("spatial plan without index"))?;
        match predicate {
            SpatialPredicate::WithinBBox { mbr, .. } => Ok(index.search_intersects(mbr)),
            SpatialPredicate::Within { geometry, .. } => {
                index.search_within(self.snapshot, geometry)
            }
            SpatialPredicate::Intersects { geometry, .. } => {
                index.search_intersects_exact(self.snapshot, geometry)
            }
            SpatialPredicate::DistanceCap { center, radius_m, .. } => {
                let candidates = index.search_intersects(&predicate.query_mbr());
                let mut out = Vec::with_capacity(candidates.len());
                for pk in candidates {
                    if let Some(value) = self.load(&pk)? {
                        if let Some(Ok(g)) = value
                            .get_path(predicate.field())
                            .map(geo::geometry_from_value)
                        {
                            if let Some(p) = g.representative_point() {
                                if p.distance_m(center) <= *radius_m {
                                    out.push(pk);
                                }
                            }
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Whitelist path: remaining predicates push behind the prefilter, and
    /// a vector scorer turns the whitelist into an ANN prefilter search.
    /// `from_spatial` marks candidates produced by the spatial index, whose
    /// exact predicates already ran in the candidate pass.
    fn finish_whitelist(&mut self, pks: Vec<String>, from_spatial: bool) -> Result<Vec<Row>> {
        // Evaluate cheap predicates first so the ANN whitelist is as tight
        // as the filters allow.
        let mut filtered: Vec<(String, Value)> = Vec::with_capacity(pks.len());
        let spatial_prechecked = from_spatial
            && matches!(
                self.query.spatial.as_ref(),
                Some(SpatialPredicate::Within { .. })
                    | Some(SpatialPredicate::Intersects { .. })
                    | Some(SpatialPredicate::DistanceCap { .. })
            );
        for pk in pks {
            if self.deadline_hit() {
                break;
            }
            let value = match self.load(&pk)? {
                Some(v) => v,
                None => continue,
            };
            if !self.scalar_filters_pass(&value) {
                continue;
            }
            // Bbox candidates are approximate; re-check exactly. Exact
            // predicates already ran in the candidate pass.
            if !spatial_prechecked && !self.spatial_pass(&value) {
                continue;
            }
            filtered.push((pk, value));
        }

        let scorer = match &self.query.vector {
            Some(s) => s,
            None => {
                return Ok(filtered
                    .into_iter()
                    .map(|(pk, value)| Row { pk, value, score: None })
                    .collect())
            }
        };
        let index = match self.db.vector_index(&self.query.table, &scorer.field) {
            Some(index) => index,
            None => {
                // Scorer without an index: no score, plain rows.
                return Ok(filtered
                    .into_iter()
                    .map(|(pk, value)| Row { pk, value, score: None })
                    .collect());
            }
        };

        let whitelist: HashSet<String> = filtered.iter().map(|(pk, _)| pk.clone()).collect();
        let by_pk: rustc_hash::FxHashMap<String, Value> = filtered.into_iter().collect();
        let params = self.db.whitelist_params();
        let hits = index.search_knn(
            &scorer.query,
            scorer.k,
            scorer.ef_search,
            Some(&whitelist),
            &params,
        )?;
        self.span.record(
            "whitelist_hit_rate",
            hits.len() as f64 / scorer.k.max(1) as f64,
        );
        self.span.record("vector_rerank_count", hits.len());

        let mut rows = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(value) = by_pk.get(&hit.pk) {
                rows.push(Row {
                    pk: hit.pk,
                    value: value.clone(),
                    score: Some(hit.score),
                });
            }
        }
        Ok(rows)
    }

    /// ANN first with overfetch, predicates rerank the candidates.
    fn vector_first(&mut self) -> Result<Vec<Row>> {
        let scorer = match &self.query.vector {
            Some(s) => s,
            None => return Err(ThemisError::internal("vector plan without scorer")),
        };
        let index = self
            .db
            .vector_index(&self.query.table, &scorer.field)
            .ok_or_else(|| ThemisError::internal("vector plan without index"))?;

        let overfetch = self
            .query
            .options
            .overfetch
            .unwrap_or(self.db.config().vector_overfetch_factor)
            .max(1.0);
        self.span.record("overfetch_factor_effective", overfetch);
        let fetch = ((scorer.k as f64) * overfetch).ceil() as usize;
        let params = self.db.whitelist_params();
        let hits = index.search_knn(&scorer.query, fetch, scorer.ef_search, None, &params)?;
        self.span.record("vector_rerank_count", hits.len());

        let mut rows = Vec::with_capacity(scorer.k);
        for hit in hits {
            if rows.len() >= scorer.k {
                break;
            }
            if self.deadline_hit() {
                break;
            }
            let value = match self.load(&hit.pk)? {
                Some(v) => v,
                None => continue,
            };
            if !self.scalar_filters_pass(&value) || !self.spatial_pass(&value) {
                continue;
            }
            rows.push(Row {
                pk: hit.pk,
                value,
                score: Some(hit.score),
            });
        }
        Ok(rows)
    }

    /// Table walk; an order-column range index takes over when present.
    fn full_scan(&mut self) -> Result<Vec<Row>> {
        if let Some(OrderBy::Column { field, descending }) = &self.query.order_by {
            let has_range_index = self
                .db
                .table_indexes(&self.query.table)
                .scalars
                .iter()
                .any(|s| s.kind == ScalarIndexKind::Range && &s.field == field);
            if has_range_index {
                return self.index_ordered_scan(field, *descending);
            }
        }

        let mut rows = Vec::new();
        let limit_goal = self.scan_goal();
        let mut after: Option<String> = None;
        loop {
            if self.deadline_hit() {
                break;
            }
            let page = self
                .db
                .scan(&self.query.table, after.as_deref(), None, 512)?;
            let fresh: Vec<_> = page
                .into_iter()
                .filter(|(pk, _)| after.as_deref() != Some(pk.as_str()))
                .collect();
            if fresh.is_empty() {
                break;
            }
            after = fresh.last().map(|(pk, _)| pk.clone());
            for (pk, value) in fresh {
                if !self.scalar_filters_pass(&value) || !self.spatial_pass(&value) {
                    continue;
                }
                rows.push(Row { pk, value, score: None });
            }
            // Without a sort to run, stop as soon as the page is full.
            if self.query.order_by.is_none() && self.query.vector.is_none() {
                if rows.len() >= limit_goal {
                    break;
                }
            }
        }

        if let Some(scorer) = &self.query.vector {
            // Scan plan with a scorer (e.g. forced): score from documents.
            let backend = themis_vector::select_backend();
            let metric = self
                .db
                .vector_index(&self.query.table, &scorer.field)
                .map(|i| i.spec().metric)
                .unwrap_or(themis_vector::DistanceMetric::Cosine);
            for row in &mut rows {
                if let Some(vector) = row.value.get_path(&scorer.field).and_then(Value::as_vector)
                {
                    if vector.len() == scorer.query.len() {
                        let sim = backend.similarity(&scorer.query, vector, metric);
                        row.score = Some(themis_vector::distance::public_score(sim, metric));
                    }
                }
            }
            rows.retain(|r| r.score.is_some());
        }
        Ok(rows)
    }

    /// Range-index-ordered scan with native cursor support.
    fn index_ordered_scan(&mut self, field: &str, descending: bool) -> Result<Vec<Row>> {
        let goal = self.scan_goal();
        let mut scan = RangeScan {
            reverse: descending,
            limit: goal.saturating_mul(4).saturating_add(64),
            ..RangeScan::default()
        };
        if let Some(cursor) = &self.query.cursor {
            scan.anchor = Some((cursor.value.clone(), cursor.pk.clone()));
        }
        let mut entries =
            secondary::scan_range(self.snapshot, &self.query.table, field, &scan)?;
        let mut rows = self.entries_to_rows(&entries)?;
        if rows.len() < goal && entries.len() >= scan.limit {
            // Filters ate the page; fall back to the unbounded scan.
            scan.limit = usize::MAX;
            entries = secondary::scan_range(self.snapshot, &self.query.table, field, &scan)?;
            rows = self.entries_to_rows(&entries)?;
        }
        rows.truncate(goal);
        Ok(rows)
    }

    fn entries_to_rows(&mut self, entries: &[secondary::IndexEntry]) -> Result<Vec<Row>> {
        let goal = self.scan_goal();
        let mut rows = Vec::new();
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for entry in entries {
            if rows.len() >= goal {
                break;
            }
            if self.deadline_hit() {
                break;
            }
            if !seen.insert(entry.pk.as_str()) {
                continue;
            }
            let value = match self.load(&entry.pk)? {
                Some(v) => v,
                None => continue,
            };
            if !self.scalar_filters_pass(&value) || !self.spatial_pass(&value) {
                continue;
            }
            rows.push(Row {
                pk: entry.pk.clone(),
                value,
                score: None,
            });
        }
        Ok(rows)
    }

    /// Rows worth producing before final ordering: `limit + 1` for the
    /// `has_more` probe, everything when unbounded.
    fn scan_goal(&self) -> usize {
        match self.query.limit {
            Some(limit) => limit.saturating_add(1),
            None => usize::MAX,
        }
    }
}

fn evaluate_spatial(predicate: &SpatialPredicate, geometry: &Geometry) -> bool {
    match predicate {
        SpatialPredicate::WithinBBox { mbr, .. } => mbr.intersects(&geometry.mbr()),
        SpatialPredicate::Within { geometry: container, .. } => geometry.within_exact(container),
        SpatialPredicate::Intersects { geometry: probe, .. } => geometry.intersects_exact(probe),
        SpatialPredicate::DistanceCap { center, radius_m, .. } => geometry
            .representative_point()
            .map(|p| p.distance_m(center) <= *radius_m)
            .unwrap_or(false),
    }
}

/// Cross-type scalar ordering for in-memory sorts: null < bool < number <
/// string < everything else, numbers compared widened.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

fn finalize(
    query: &Query,
    plan: PlanKind,
    mut rows: Vec<Row>,
    truncated: bool,
    score_ascending: bool,
) -> QueryResult {
    let order = query.order_by.clone().unwrap_or_else(|| {
        if query.vector.is_some() {
            OrderBy::Score
        } else {
            OrderBy::Column { field: String::new(), descending: false }
        }
    });

    match &order {
        OrderBy::Score => {
            rows.sort_by(|a, b| {
                let (sa, sb) = (a.score.unwrap_or(f32::MIN), b.score.unwrap_or(f32::MIN));
                let ordering = if score_ascending {
                    sa.partial_cmp(&sb)
                } else {
                    sb.partial_cmp(&sa)
                };
                ordering
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.pk.cmp(&b.pk))
            });
        }
        OrderBy::Column { field, descending } if !field.is_empty() => {
            rows.sort_by(|a, b| {
                let av = a.value.get_path(field).unwrap_or(&Value::Null);
                let bv = b.value.get_path(field).unwrap_or(&Value::Null);
                let ordering = cmp_values(av, bv).then_with(|| a.pk.cmp(&b.pk));
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            // Cursor anchor: strictly after `(value, pk)` in scan direction.
            if let Some(cursor) = &query.cursor {
                rows.retain(|row| {
                    let v = row.value.get_path(field).unwrap_or(&Value::Null);
                    let ordering =
                        cmp_values(v, &cursor.value).then_with(|| row.pk.cmp(&cursor.pk));
                    if *descending {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    }
                });
            }
        }
        OrderBy::Column { .. } => {
            rows.sort_by(|a, b| a.pk.cmp(&b.pk));
        }
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let next_cursor = match (&query.order_by, rows.last()) {
        (Some(OrderBy::Column { field, .. }), Some(last)) if has_more => Some(Cursor {
            value: last.value.get_path(field).cloned().unwrap_or(Value::Null),
            pk: last.pk.clone(),
        }),
        _ => None,
    };

    debug!(rows = rows.len(), has_more, truncated, "query done");
    QueryResult {
        rows,
        has_more,
        next_cursor,
        truncated,
        plan,
    }
}
