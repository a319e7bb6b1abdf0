//! Per-`(table, field)` vector index manager.
//!
//! Vectors are persisted as blob rows in the committing batch, so they are
//! crash-consistent with the entity. The graph lives in memory behind a
//! copy-on-write snapshot: readers clone an `Arc` and search without holding
//! any lock; the single writer path mutates through `Arc::make_mut`, cloning
//! only while readers still hold the previous snapshot. A background flusher
//! serialises the graph into the KV engine; on open the graph page is loaded
//! and reconciled against the blob rows, re-inserting whatever the last
//! flush missed.

use crate::distance::{self, normalize, public_score, DistanceBackend, DistanceMetric};
use crate::hnsw::{HnswGraph, HnswParams, VectorStore};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use themis_core::key;
use themis_core::{Result, ThemisError};
use themis_storage::{KvRead, WriteBatch};
use tracing::debug;

/// Descriptor of a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexSpec {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Dotted path of the vector field.
    pub field: String,
    /// Required dimension.
    pub dim: usize,
    /// Distance metric.
    pub metric: DistanceMetric,
    /// Graph parameters.
    pub params: HnswParams,
}

/// Whitelist prefilter tuning, lifted from `DbConfig`.
#[derive(Debug, Clone, Copy)]
pub struct WhitelistParams {
    /// Push the whitelist into the search instead of postfiltering.
    pub enabled: bool,
    /// First candidate list size as a multiple of `k`.
    pub initial_factor: usize,
    /// Floor for the candidate list size.
    pub min_candidates: usize,
    /// Enlargement attempts before returning what was found.
    pub max_attempts: usize,
    /// Candidate list growth per attempt.
    pub growth_factor: f64,
}

impl Default for WhitelistParams {
    fn default() -> Self {
        WhitelistParams {
            enabled: true,
            initial_factor: 4,
            min_candidates: 64,
            max_attempts: 4,
            growth_factor: 2.0,
        }
    }
}

/// One search hit. `score` is similarity (higher-better) for cosine and
/// inner product, distance (lower-better) for L2; callers check
/// `spec.metric.lower_is_better()` for sort orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Primary key.
    pub pk: String,
    /// Public score in metric orientation.
    pub score: f32,
}

#[derive(Clone)]
struct IndexState {
    store: VectorStore,
    graph: HnswGraph,
    by_pk: HashMap<String, u32>,
    pk_of: BTreeMap<u32, String>,
}

#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    graph: HnswGraph,
    ids: Vec<(u32, String)>,
}

/// The runtime index for one `(table, field)`.
pub struct VectorIndex {
    spec: VectorIndexSpec,
    backend: &'static dyn DistanceBackend,
    state: RwLock<Arc<IndexState>>,
    writer: Mutex<()>,
    dirty: AtomicBool,
}

impl VectorIndex {
    /// Open the index, loading the persisted graph page and reconciling it
    /// with the vector blob rows.
    pub fn open(spec: VectorIndexSpec, view: &dyn KvRead) -> Result<VectorIndex> {
        let backend = distance::select_backend();
        let mut state = IndexState {
            store: VectorStore::new(),
            graph: HnswGraph::new(spec.params, spec.metric),
            by_pk: HashMap::new(),
            pk_of: BTreeMap::new(),
        };

        // Blob rows are the source of truth; the graph page is a cache.
        let blob_prefix = key::vec_blob_prefix(&spec.table, &spec.field);
        let mut blobs: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        for (entry_key, bytes) in view.scan_prefix(&blob_prefix, usize::MAX) {
            let pk = key::index_entry_pk(key::KeyPrefix::IdxVector, &entry_key)?;
            let vector: Vec<f32> = bincode::deserialize(&bytes)?;
            blobs.insert(pk, vector);
        }

        let page = view.get(&key::vec_graph_key(&spec.table, &spec.field));
        let mut rebuilt = 0usize;
        if let Some(bytes) = page {
            let persisted: PersistedGraph = bincode::deserialize(&bytes)?;
            // Keep only graph nodes whose blob still exists; load their
            // vectors into the same slots the graph references.
            let mut keep: HashMap<u32, String> = HashMap::new();
            let mut stale: Vec<u32> = Vec::new();
            for (id, pk) in persisted.ids {
                if blobs.contains_key(&pk) {
                    keep.insert(id, pk);
                } else {
                    stale.push(id);
                }
            }
            let mut graph = persisted.graph;
            let mut store = VectorStore::new();
            // Slots must align with ids; insert in id order, removing stale
            // graph nodes as they surface.
            let all_ids: Vec<u32> = keep.keys().copied().collect();
            let max_id = all_ids.iter().copied().max().map(|m| m as usize + 1).unwrap_or(0);
            let mut slot_fill: Vec<Option<Vec<f32>>> = vec![None; max_id];
            for (&id, pk) in &keep {
                slot_fill[id as usize] = blobs.remove(pk);
            }
            // Fill every slot first so ids stay aligned, then free the
            // stale ones; freeing mid-fill would let the free list break
            // the id <-> slot correspondence.
            for (slot, vector) in slot_fill.into_iter().enumerate() {
                let id = store.insert(vector.unwrap_or_default());
                debug_assert_eq!(id as usize, slot);
            }
            for id in 0..max_id as u32 {
                if !keep.contains_key(&id) {
                    store.remove(id);
                }
            }
            for id in stale {
                graph.remove(id);
            }
            for (id, pk) in keep {
                state.by_pk.insert(pk.clone(), id);
                state.pk_of.insert(id, pk);
            }
            state.store = store;
            state.graph = graph;
        }
        // Whatever the last flush missed gets re-inserted now.
        for (pk, vector) in blobs {
            let id = state.store.insert(vector);
            state.graph.insert(backend, &state.store, id);
            state.by_pk.insert(pk.clone(), id);
            state.pk_of.insert(id, pk);
            rebuilt += 1;
        }
        if rebuilt > 0 {
            debug!(
                table = %spec.table,
                field = %spec.field,
                rebuilt,
                "hnsw open reconciled unflushed vectors"
            );
        }
        Ok(VectorIndex {
            spec,
            backend,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            dirty: AtomicBool::new(false),
        })
    }

    /// The descriptor.
    pub fn spec(&self) -> &VectorIndexSpec {
        &self.spec
    }

    /// Live vector count.
    pub fn len(&self) -> usize {
        self.state.read().by_pk.len()
    }

    /// True when the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate and normalise a vector for this index.
    ///
    /// Dimension mismatch and non-finite components are `InvalidValue`; the
    /// failed operation leaves the index untouched.
    pub fn prepare(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.spec.dim {
            return Err(ThemisError::invalid_value(format!(
                "vector dimension {} differs from index dimension {}",
                vector.len(),
                self.spec.dim
            )));
        }
        if vector.iter().any(|c| !c.is_finite()) {
            return Err(ThemisError::invalid_value("non-finite vector component"));
        }
        let mut prepared = vector.to_vec();
        if self.spec.metric == DistanceMetric::Cosine {
            normalize(&mut prepared);
        }
        Ok(prepared)
    }

    /// Stage a vector blob into the committing batch.
    pub fn stage_put(&self, pk: &str, prepared: &[f32], batch: &mut WriteBatch) -> Result<()> {
        batch.put(
            key::vec_blob_key(&self.spec.table, &self.spec.field, pk),
            bincode::serialize(&prepared.to_vec())?,
        );
        Ok(())
    }

    /// Stage removal of a vector blob.
    pub fn stage_delete(&self, pk: &str, batch: &mut WriteBatch) {
        batch.delete(key::vec_blob_key(&self.spec.table, &self.spec.field, pk));
    }

    /// Apply a committed put to the in-memory graph.
    pub fn on_commit_put(&self, pk: &str, prepared: Vec<f32>) {
        let _writer = self.writer.lock();
        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut guard);
        if let Some(&old_id) = state.by_pk.get(pk) {
            state.graph.remove(old_id);
            state.store.remove(old_id);
            state.pk_of.remove(&old_id);
        }
        let id = state.store.insert(prepared);
        state.graph.insert(self.backend, &state.store, id);
        state.by_pk.insert(pk.to_string(), id);
        state.pk_of.insert(id, pk.to_string());
        self.dirty.store(true, Ordering::Release);
    }

    /// Apply a committed delete to the in-memory graph.
    pub fn on_commit_delete(&self, pk: &str) {
        let _writer = self.writer.lock();
        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut guard);
        if let Some(id) = state.by_pk.remove(pk) {
            state.graph.remove(id);
            state.store.remove(id);
            state.pk_of.remove(&id);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// k-NN search.
    ///
    /// With a whitelist and prefilter enabled, the candidate list is grown
    /// geometrically until it holds `k` whitelist members or the attempts
    /// are spent; non-members are skipped, never backfilled by brute force.
    /// Without a whitelist this is a plain top-`k` search. Every returned pk
    /// is in the whitelist and at most `k` hits come back.
    pub fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        ef_override: Option<usize>,
        whitelist: Option<&HashSet<String>>,
        params: &WhitelistParams,
    ) -> Result<Vec<VectorHit>> {
        let prepared = self.prepare(query)?;
        let state = Arc::clone(&self.state.read());
        let ef = ef_override.unwrap_or(self.spec.params.ef_search);

        let raw: Vec<(u32, f32)> = match whitelist {
            None => state
                .graph
                .search(self.backend, &state.store, &prepared, k, ef, None),
            Some(list) => {
                let allowed: FxHashSet<u32> = list
                    .iter()
                    .filter_map(|pk| state.by_pk.get(pk).copied())
                    .collect();
                if allowed.is_empty() {
                    return Ok(Vec::new());
                }
                let allow = |id: u32| allowed.contains(&id);
                if params.enabled {
                    let mut cand = (k * params.initial_factor).max(params.min_candidates);
                    let mut hits = Vec::new();
                    for attempt in 0..params.max_attempts {
                        hits = state.graph.search(
                            self.backend,
                            &state.store,
                            &prepared,
                            cand,
                            ef.max(cand),
                            Some(&allow),
                        );
                        if hits.len() >= k || cand >= state.graph.len() {
                            break;
                        }
                        cand = (cand as f64 * params.growth_factor).ceil() as usize;
                        debug!(
                            attempt,
                            next_candidates = cand,
                            hits = hits.len(),
                            "whitelist prefilter enlarging candidate list"
                        );
                    }
                    hits.truncate(k);
                    hits
                } else {
                    // Postfilter fallback: the executor overfetches; keep
                    // whitelist members only.
                    let mut hits = state.graph.search(
                        self.backend,
                        &state.store,
                        &prepared,
                        k,
                        ef.max(k),
                        Some(&allow),
                    );
                    hits.truncate(k);
                    hits
                }
            }
        };

        Ok(raw
            .into_iter()
            .filter_map(|(id, sim)| {
                state.pk_of.get(&id).map(|pk| VectorHit {
                    pk: pk.clone(),
                    score: public_score(sim, self.spec.metric),
                })
            })
            .collect())
    }

    /// Serialise the graph into `batch` if anything changed since the last
    /// flush. The background flusher commits the batch.
    pub fn flush(&self, batch: &mut WriteBatch) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let state = Arc::clone(&self.state.read());
        let persisted = PersistedGraph {
            graph: state.graph.clone(),
            ids: state.pk_of.iter().map(|(id, pk)| (*id, pk.clone())).collect(),
        };
        batch.put(
            key::vec_graph_key(&self.spec.table, &self.spec.field),
            bincode::serialize(&persisted)?,
        );
        Ok(true)
    }

    /// Prefix owning everything this index persisted; drop erases it.
    pub fn keyspace_prefix(&self) -> Vec<u8> {
        key::vec_index_prefix(&self.spec.table, &self.spec.field)
    }
}
