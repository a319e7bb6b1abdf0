//! Entity-to-index fan-out.
//!
//! One function derives every index mutation for an entity transition
//! `old -> new` and stages it into the transaction's batch. Vector and
//! spatial indices additionally queue in-memory graph/tree updates that the
//! commit path applies after the batch lands, so the runtime structures
//! follow commit order.

use crate::catalog::TableIndexes;
use std::sync::Arc;
use themis_core::geo::{self, Geometry};
use themis_core::{Mbr, Result, ThemisError, Value};
use themis_index::{fulltext, secondary};
use themis_spatial::SpatialIndex;
use themis_storage::{KvRead, WriteBatch};
use themis_vector::VectorIndex;

/// A deferred in-memory index update, applied once the batch is committed.
pub enum RuntimeOp {
    /// Insert/replace a vector.
    VectorPut(Arc<VectorIndex>, String, Vec<f32>),
    /// Remove a vector.
    VectorDelete(Arc<VectorIndex>, String),
    /// Insert/replace a rectangle.
    SpatialPut(Arc<SpatialIndex>, String, Mbr),
    /// Remove a rectangle.
    SpatialDelete(Arc<SpatialIndex>, String),
}

impl RuntimeOp {
    /// Apply to the in-memory structure.
    pub fn apply(self) {
        match self {
            RuntimeOp::VectorPut(index, pk, vector) => index.on_commit_put(&pk, vector),
            RuntimeOp::VectorDelete(index, pk) => index.on_commit_delete(&pk),
            RuntimeOp::SpatialPut(index, pk, mbr) => index.on_commit_put(&pk, mbr),
            RuntimeOp::SpatialDelete(index, pk) => index.on_commit_delete(&pk),
        }
    }
}

/// Stage every index mutation for `old -> new` of `(table, pk)`.
///
/// `view` is the transaction's read-your-writes view; `staged` receives the
/// KV mutations, `runtime` the deferred in-memory updates. Index deletes
/// stage before the entity tombstone lands in the same batch, and a failure
/// from any index (unique violation, bad vector, bad geometry) aborts the
/// whole staging with nothing half-applied: the caller merges `staged` only
/// on success.
pub fn stage_transition(
    indexes: &TableIndexes,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    view: &dyn KvRead,
    staged: &mut WriteBatch,
    runtime: &mut Vec<RuntimeOp>,
) -> Result<()> {
    for spec in &indexes.scalars {
        secondary::apply_scalar(spec, pk, old, new, view, staged)?;
    }
    for spec in &indexes.composites {
        secondary::apply_composite(spec, pk, old, new, staged)?;
    }
    for spec in &indexes.ttls {
        secondary::apply_ttl(spec, pk, old, new, staged)?;
    }
    for spec in &indexes.fulltexts {
        fulltext::apply_fulltext(spec, pk, old, new, view, staged)?;
    }
    for index in &indexes.vectors {
        stage_vector(index, pk, old, new, staged, runtime)?;
    }
    for index in &indexes.spatials {
        stage_spatial(index, pk, old, new, staged, runtime)?;
    }
    Ok(())
}

fn vector_field<'v>(doc: Option<&'v Value>, field: &str) -> Result<Option<&'v [f32]>> {
    match doc.and_then(|d| d.get_path(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Vector(v)) => Ok(Some(v)),
        Some(other) => Err(ThemisError::invalid_value(format!(
            "field {field} holds {}, expected vector",
            other.type_name()
        ))),
    }
}

fn stage_vector(
    index: &Arc<VectorIndex>,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    staged: &mut WriteBatch,
    runtime: &mut Vec<RuntimeOp>,
) -> Result<()> {
    let field = index.spec().field.clone();
    let had = vector_field(old, &field)?.is_some();
    match vector_field(new, &field)? {
        Some(vector) => {
            let prepared = index.prepare(vector)?;
            index.stage_put(pk, &prepared, staged)?;
            runtime.push(RuntimeOp::VectorPut(Arc::clone(index), pk.to_string(), prepared));
        }
        None if had => {
            index.stage_delete(pk, staged);
            runtime.push(RuntimeOp::VectorDelete(Arc::clone(index), pk.to_string()));
        }
        None => {}
    }
    Ok(())
}

fn geometry_field(doc: Option<&Value>, field: &str) -> Result<Option<Geometry>> {
    match doc.and_then(|d| d.get_path(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => geo::geometry_from_value(value).map(Some),
    }
}

fn stage_spatial(
    index: &Arc<SpatialIndex>,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    staged: &mut WriteBatch,
    runtime: &mut Vec<RuntimeOp>,
) -> Result<()> {
    let field = index.spec().field.clone();
    let had = geometry_field(old, &field)?.is_some();
    match geometry_field(new, &field)? {
        Some(geometry) => {
            let mbr = index.stage_put(pk, &geometry, staged)?;
            runtime.push(RuntimeOp::SpatialPut(Arc::clone(index), pk.to_string(), mbr));
        }
        None if had => {
            index.stage_delete(pk, staged);
            runtime.push(RuntimeOp::SpatialDelete(Arc::clone(index), pk.to_string()));
        }
        None => {}
    }
    Ok(())
}
