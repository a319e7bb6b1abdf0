//! Hierarchical navigable small-world graph.
//!
//! Multi-layer proximity graph: layer 0 holds every node with up to `2M`
//! connections, higher layers hold exponentially fewer nodes with up to `M`.
//! A new node's level is `floor(-ln(U) * mL)` with `mL = 1 / ln(M)`.
//! Insertion beam-searches each layer with `ef_construction` candidates and
//! connects through the neighbourhood-diverse heuristic: a candidate is
//! accepted only while it is closer to the query than to every neighbour
//! already accepted, which keeps edges spread around the node instead of
//! bunched in one direction.
//!
//! Determinism: level assignment uses a counter-seeded splitmix64, node maps
//! are `BTreeMap`, and every ordering tie breaks by node id ascending.
//! Identical insert sequences build identical graphs.

use crate::distance::{DistanceBackend, DistanceMetric};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use rustc_hash::FxHashSet;

/// Graph build/search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max connections per layer above 0; layer 0 allows `2 * m`.
    pub m: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Default beam width during search.
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

impl HnswParams {
    fn ml(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }

    fn cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// Slot-addressed vector storage. Ids are dense and reused after removal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorStore {
    slots: Vec<Option<Vec<f32>>>,
    free: Vec<u32>,
}

impl VectorStore {
    /// Empty store.
    pub fn new() -> Self {
        VectorStore::default()
    }

    /// Insert a vector, returning its slot id.
    pub fn insert(&mut self, vector: Vec<f32>) -> u32 {
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(vector);
                id
            }
            None => {
                self.slots.push(Some(vector));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Vector at a slot.
    pub fn get(&self, id: u32) -> Option<&[f32]> {
        self.slots.get(id as usize)?.as_deref()
    }

    /// Free a slot.
    pub fn remove(&mut self, id: u32) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if slot.take().is_some() {
                self.free.push(id);
            }
        }
    }

    /// Live vector count.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when no vector is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    /// neighbors[layer] = connected node ids, sorted ascending.
    neighbors: Vec<Vec<u32>>,
}

impl Node {
    fn new(max_layer: usize) -> Self {
        Node {
            neighbors: vec![Vec::new(); max_layer + 1],
        }
    }

    fn max_layer(&self) -> usize {
        self.neighbors.len() - 1
    }
}

/// Scored candidate: max-heap by similarity, ties prefer lower id.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    sim: f32,
    id: u32,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .partial_cmp(&other.sim)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// The graph itself. Vectors live outside in a `VectorStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    params: HnswParams,
    metric: DistanceMetric,
    nodes: BTreeMap<u32, Node>,
    entry: Option<u32>,
    top_level: usize,
    rng_counter: u64,
}

impl HnswGraph {
    /// Empty graph.
    pub fn new(params: HnswParams, metric: DistanceMetric) -> Self {
        HnswGraph {
            params,
            metric,
            nodes: BTreeMap::new(),
            entry: None,
            top_level: 0,
            rng_counter: 0,
        }
    }

    /// Build parameters.
    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Node count.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn splitmix64(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^ (x >> 31)
    }

    fn assign_level(&mut self) -> usize {
        self.rng_counter += 1;
        let hash = Self::splitmix64(0x7e31_5_u64.wrapping_add(self.rng_counter));
        let uniform = ((hash as f64) / (u64::MAX as f64)).max(1e-15);
        (-uniform.ln() * self.params.ml()) as usize
    }

    fn sim(&self, backend: &dyn DistanceBackend, store: &VectorStore, a: &[f32], id: u32) -> f32 {
        store
            .get(id)
            .map(|v| backend.similarity(a, v, self.metric))
            .unwrap_or(f32::NEG_INFINITY)
    }

    /// Beam search one layer: up to `ef` nearest nodes, best first.
    fn search_layer(
        &self,
        backend: &dyn DistanceBackend,
        store: &VectorStore,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
    ) -> Vec<Scored> {
        let entry_sim = self.sim(backend, store, query, entry);
        let mut visited: FxHashSet<u32> = FxHashSet::default();
        visited.insert(entry);

        let mut candidates = BinaryHeap::new();
        candidates.push(Scored { sim: entry_sim, id: entry });
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        results.push(Reverse(Scored { sim: entry_sim, id: entry }));

        while let Some(nearest) = candidates.pop() {
            let worst = results.peek().map(|r| r.0.sim).unwrap_or(f32::NEG_INFINITY);
            if nearest.sim < worst && results.len() >= ef {
                break;
            }
            if let Some(node) = self.nodes.get(&nearest.id) {
                if let Some(neighbors) = node.neighbors.get(layer) {
                    for &next in neighbors {
                        if !visited.insert(next) {
                            continue;
                        }
                        let sim = self.sim(backend, store, query, next);
                        let worst = results.peek().map(|r| r.0.sim).unwrap_or(f32::NEG_INFINITY);
                        if results.len() < ef || sim > worst {
                            candidates.push(Scored { sim, id: next });
                            results.push(Reverse(Scored { sim, id: next }));
                            if results.len() > ef {
                                results.pop();
                            }
                        }
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Greedy descent from `from_layer` down to just above `to_layer`.
    fn descend(
        &self,
        backend: &dyn DistanceBackend,
        store: &VectorStore,
        query: &[f32],
        mut current: u32,
        from_layer: usize,
        to_layer: usize,
    ) -> u32 {
        for layer in (to_layer..=from_layer).rev() {
            loop {
                let current_sim = self.sim(backend, store, query, current);
                let mut best = Scored { sim: current_sim, id: current };
                if let Some(node) = self.nodes.get(&current) {
                    if let Some(neighbors) = node.neighbors.get(layer) {
                        for &next in neighbors {
                            let sim = self.sim(backend, store, query, next);
                            let candidate = Scored { sim, id: next };
                            if candidate > best {
                                best = candidate;
                            }
                        }
                    }
                }
                if best.id == current {
                    break;
                }
                current = best.id;
            }
        }
        current
    }

    /// Diverse neighbour selection (the paper's Algorithm 4): walk the
    /// candidates best-first and accept one only while it is closer to the
    /// query than to every already accepted neighbour.
    fn select_diverse(
        &self,
        backend: &dyn DistanceBackend,
        store: &VectorStore,
        candidates: &[Scored],
        max: usize,
    ) -> Vec<u32> {
        let mut accepted: Vec<u32> = Vec::with_capacity(max);
        for c in candidates {
            if accepted.len() >= max {
                break;
            }
            let c_vec = match store.get(c.id) {
                Some(v) => v,
                None => continue,
            };
            let dominated = accepted.iter().any(|&a| {
                self.sim(backend, store, c_vec, a) > c.sim
            });
            if !dominated {
                accepted.push(c.id);
            }
        }
        // Fill from the remainder if diversity left slots empty.
        if accepted.len() < max {
            for c in candidates {
                if accepted.len() >= max {
                    break;
                }
                if !accepted.contains(&c.id) {
                    accepted.push(c.id);
                }
            }
        }
        accepted
    }

    fn link(&mut self, a: u32, b: u32, layer: usize) {
        if a == b {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&a) {
            if let Some(list) = node.neighbors.get_mut(layer) {
                if let Err(pos) = list.binary_search(&b) {
                    list.insert(pos, b);
                }
            }
        }
    }

    fn prune(&mut self, backend: &dyn DistanceBackend, store: &VectorStore, id: u32, layer: usize) {
        let cap = self.params.cap(layer);
        let list = match self.nodes.get(&id).and_then(|n| n.neighbors.get(layer)) {
            Some(list) if list.len() > cap => list.clone(),
            _ => return,
        };
        let own = match store.get(id) {
            Some(v) => v.to_vec(),
            None => return,
        };
        let mut scored: Vec<Scored> = list
            .iter()
            .map(|&n| Scored { sim: self.sim(backend, store, &own, n), id: n })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        let mut kept = self.select_diverse(backend, store, &scored, cap);
        kept.sort_unstable();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[layer] = kept;
        }
    }

    /// Insert a node whose vector is already in `store`.
    pub fn insert(&mut self, backend: &dyn DistanceBackend, store: &VectorStore, id: u32) {
        let level = self.assign_level();
        self.nodes.insert(id, Node::new(level));
        let query = match store.get(id) {
            Some(v) => v.to_vec(),
            None => return,
        };

        let entry = match self.entry {
            Some(e) if e != id => e,
            _ => {
                self.entry = Some(id);
                self.top_level = level;
                return;
            }
        };

        let mut current = entry;
        if self.top_level > level {
            current = self.descend(backend, store, &query, entry, self.top_level, level + 1);
        }

        for layer in (0..=level.min(self.top_level)).rev() {
            let candidates = self.search_layer(
                backend,
                store,
                &query,
                current,
                self.params.ef_construction,
                layer,
            );
            let selected =
                self.select_diverse(backend, store, &candidates, self.params.cap(layer));
            for &neighbor in &selected {
                self.link(id, neighbor, layer);
                self.link(neighbor, id, layer);
                self.prune(backend, store, neighbor, layer);
            }
            current = candidates.first().map(|c| c.id).unwrap_or(current);
        }

        if level > self.top_level {
            self.top_level = level;
            self.entry = Some(id);
        }
    }

    /// Remove a node and every edge pointing at it.
    pub fn remove(&mut self, id: u32) {
        if self.nodes.remove(&id).is_none() {
            return;
        }
        for node in self.nodes.values_mut() {
            for list in node.neighbors.iter_mut() {
                if let Ok(pos) = list.binary_search(&id) {
                    list.remove(pos);
                }
            }
        }
        if self.entry == Some(id) {
            // New entry: the surviving node with the tallest stack,
            // lowest id on ties for determinism.
            let mut best: Option<(usize, u32)> = None;
            for (&nid, node) in &self.nodes {
                let layer = node.max_layer();
                if best.map_or(true, |(bl, _)| layer > bl) {
                    best = Some((layer, nid));
                }
            }
            match best {
                Some((layer, nid)) => {
                    self.entry = Some(nid);
                    self.top_level = layer;
                }
                None => {
                    self.entry = None;
                    self.top_level = 0;
                }
            }
        }
    }

    /// Top-`k` search with beam width `ef`. `allow` filters which nodes may
    /// appear in results; the traversal still walks disallowed nodes as
    /// waypoints, so a sparse whitelist cannot strand the search.
    pub fn search(
        &self,
        backend: &dyn DistanceBackend,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        ef: usize,
        allow: Option<&dyn Fn(u32) -> bool>,
    ) -> Vec<(u32, f32)> {
        let entry = match self.entry {
            Some(e) => e,
            None => return Vec::new(),
        };
        let ef = ef.max(k);
        let base_entry = self.descend(backend, store, query, entry, self.top_level, 1);
        let found = self.search_layer(backend, store, query, base_entry, ef, 0);
        found
            .into_iter()
            .filter(|s| allow.map_or(true, |f| f(s.id)))
            .take(k)
            .map(|s| (s.id, s.sim))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::ScalarBackend;

    fn build(vectors: &[Vec<f32>]) -> (HnswGraph, VectorStore) {
        let mut graph = HnswGraph::new(
            HnswParams { m: 8, ef_construction: 50, ef_search: 32 },
            DistanceMetric::L2,
        );
        let mut store = VectorStore::new();
        for v in vectors {
            let id = store.insert(v.clone());
            graph.insert(&ScalarBackend, &store, id);
        }
        (graph, store)
    }

    fn grid(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![i as f32, (i * 7 % 13) as f32]).collect()
    }

    #[test]
    fn exact_match_is_first() {
        let (graph, store) = build(&grid(100));
        let hits = graph.search(&ScalarBackend, &store, &[42.0, (42 * 7 % 13) as f32], 5, 32, None);
        assert_eq!(hits[0].0, 42);
    }

    #[test]
    fn returns_at_most_k() {
        let (graph, store) = build(&grid(50));
        let hits = graph.search(&ScalarBackend, &store, &[10.0, 10.0], 7, 64, None);
        assert_eq!(hits.len(), 7);
    }

    #[test]
    fn recall_against_brute_force() {
        let vectors = grid(200);
        let (graph, store) = build(&vectors);
        let query = [57.3, 4.2];

        let mut exact: Vec<(u32, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32, ScalarBackend.similarity(&query, v, DistanceMetric::L2)))
            .collect();
        exact.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let exact_top: Vec<u32> = exact[..10].iter().map(|(id, _)| *id).collect();

        let hits = graph.search(&ScalarBackend, &store, &query, 10, 100, None);
        let found = hits.iter().filter(|(id, _)| exact_top.contains(id)).count();
        assert!(found >= 8, "recall too low: {found}/10");
    }

    #[test]
    fn results_sorted_best_first() {
        let (graph, store) = build(&grid(80));
        let hits = graph.search(&ScalarBackend, &store, &[30.0, 5.0], 10, 64, None);
        assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn layer0_respects_connection_cap() {
        let (graph, _) = build(&grid(120));
        let cap0 = graph.params.cap(0);
        for node in graph.nodes.values() {
            assert!(node.neighbors[0].len() <= cap0);
        }
    }

    #[test]
    fn filter_restricts_results_but_not_traversal() {
        let (graph, store) = build(&grid(100));
        let allow = |id: u32| id % 2 == 0;
        let hits = graph.search(&ScalarBackend, &store, &[50.0, 3.0], 10, 100, Some(&allow));
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|(id, _)| id % 2 == 0));
    }

    #[test]
    fn remove_node_excludes_it() {
        let (mut graph, mut store) = build(&grid(60));
        graph.remove(13);
        store.remove(13);
        let hits = graph.search(
            &ScalarBackend,
            &store,
            &[13.0, (13 * 7 % 13) as f32],
            5,
            64,
            None,
        );
        assert!(hits.iter().all(|(id, _)| *id != 13));
        assert!(!hits.is_empty());
    }

    #[test]
    fn remove_entry_point_recovers() {
        let (mut graph, mut store) = build(&grid(40));
        let entry = graph.entry.unwrap();
        graph.remove(entry);
        store.remove(entry);
        let hits = graph.search(&ScalarBackend, &store, &[5.0, 9.0], 3, 32, None);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn identical_insert_sequences_build_identical_graphs() {
        let (a, _) = build(&grid(64));
        let (b, _) = build(&grid(64));
        assert_eq!(
            bincode::serialize(&a).unwrap(),
            bincode::serialize(&b).unwrap()
        );
    }

    #[test]
    fn empty_graph_returns_empty() {
        let graph = HnswGraph::new(HnswParams::default(), DistanceMetric::Cosine);
        let store = VectorStore::new();
        assert!(graph
            .search(&ScalarBackend, &store, &[1.0, 0.0], 5, 32, None)
            .is_empty());
    }
}
