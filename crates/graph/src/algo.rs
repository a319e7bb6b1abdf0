//! Graph traversals and analytics.
//!
//! Everything reads adjacency through a `KvRead`, so traversals see exactly
//! the caller's snapshot. The optional geo filter restricts traversal to
//! edges whose *both* endpoints fall inside a circle; vertex locations come
//! from a caller-supplied lookup because entity access belongs to the
//! engine, not this crate.

use crate::store::{self, EdgeRef};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use themis_core::{GeoPoint, Result, Value};
use themis_storage::KvRead;

/// Damping factor for PageRank.
pub const PAGERANK_DAMPING: f64 = 0.85;

/// Restrict traversal to a circle on the sphere.
pub struct GeoCircleFilter<'a> {
    /// Circle centre.
    pub center: GeoPoint,
    /// Radius in metres.
    pub radius_m: f64,
    /// Vertex location lookup; `None` places the vertex outside the circle.
    pub locate: &'a dyn Fn(&str) -> Option<GeoPoint>,
}

impl GeoCircleFilter<'_> {
    fn contains(&self, vertex: &str) -> bool {
        (self.locate)(vertex)
            .map(|p| p.distance_m(&self.center) <= self.radius_m)
            .unwrap_or(false)
    }

    /// Both endpoints inside the circle.
    fn allows(&self, edge: &EdgeRef) -> bool {
        self.contains(&edge.from) && self.contains(&edge.to)
    }
}

fn edge_allowed(edge: &EdgeRef, label: Option<&str>, geo: Option<&GeoCircleFilter>) -> bool {
    label.map_or(true, |l| edge.label == l) && geo.map_or(true, |g| g.allows(edge))
}

/// Breadth-first traversal from `start`, following out-edges, up to
/// `max_depth` hops. Returns `(vertex, depth)` in visit order; the start
/// vertex is depth 0.
pub fn bfs(
    view: &dyn KvRead,
    graph: &str,
    start: &str,
    max_depth: usize,
    label: Option<&str>,
    geo: Option<&GeoCircleFilter>,
) -> Result<Vec<(String, usize)>> {
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut order = Vec::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    visited.insert(start.to_string());
    queue.push_back((start.to_string(), 0));
    while let Some((vertex, depth)) = queue.pop_front() {
        order.push((vertex.clone(), depth));
        if depth >= max_depth {
            continue;
        }
        for edge in store::neighbors_out(view, graph, &vertex, None)? {
            if !edge_allowed(&edge, label, geo) {
                continue;
            }
            if visited.insert(edge.to.clone()) {
                queue.push_back((edge.to, depth + 1));
            }
        }
    }
    Ok(order)
}

/// Depth-first traversal from `start`. Pre-order; neighbours expand in
/// adjacency (key) order.
pub fn dfs(
    view: &dyn KvRead,
    graph: &str,
    start: &str,
    max_depth: usize,
    label: Option<&str>,
    geo: Option<&GeoCircleFilter>,
) -> Result<Vec<String>> {
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut order = Vec::new();
    let mut stack: Vec<(String, usize)> = vec![(start.to_string(), 0)];
    while let Some((vertex, depth)) = stack.pop() {
        if !visited.insert(vertex.clone()) {
            continue;
        }
        order.push(vertex.clone());
        if depth >= max_depth {
            continue;
        }
        let mut edges = store::neighbors_out(view, graph, &vertex, None)?;
        edges.retain(|e| edge_allowed(e, label, geo));
        // Reverse so the first neighbour in key order is popped first.
        for edge in edges.into_iter().rev() {
            if !visited.contains(&edge.to) {
                stack.push((edge.to, depth + 1));
            }
        }
    }
    Ok(order)
}

/// A weighted path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    /// Vertices from source to target inclusive.
    pub vertices: Vec<String>,
    /// Sum of edge weights.
    pub total_weight: f64,
}

fn edge_weight(edge: &EdgeRef, weight_attr: &str) -> f64 {
    edge.props
        .get_path(weight_attr)
        .and_then(Value::as_float)
        .unwrap_or(1.0)
}

#[derive(Debug)]
struct QueueEntry {
    cost: f64,
    vertex: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.vertex == other.vertex
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on cost, vertex name as deterministic tie-break.
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.vertex.cmp(&self.vertex))
    }
}

/// Dijkstra shortest path over a per-edge weight attribute (missing weights
/// count as 1). Returns `None` when the target is unreachable under the
/// filters; negative weights are treated as unreachable edges.
pub fn shortest_path(
    view: &dyn KvRead,
    graph: &str,
    from: &str,
    to: &str,
    weight_attr: &str,
    label: Option<&str>,
    geo: Option<&GeoCircleFilter>,
) -> Result<Option<PathResult>> {
    let mut dist: FxHashMap<String, f64> = FxHashMap::default();
    let mut prev: FxHashMap<String, String> = FxHashMap::default();
    let mut heap = BinaryHeap::new();
    dist.insert(from.to_string(), 0.0);
    heap.push(QueueEntry { cost: 0.0, vertex: from.to_string() });

    while let Some(QueueEntry { cost, vertex }) = heap.pop() {
        if vertex == to {
            let mut path = vec![to.to_string()];
            let mut current = to.to_string();
            while let Some(p) = prev.get(&current) {
                path.push(p.clone());
                current = p.clone();
            }
            path.reverse();
            return Ok(Some(PathResult { vertices: path, total_weight: cost }));
        }
        if dist.get(&vertex).copied().unwrap_or(f64::INFINITY) < cost {
            continue;
        }
        for edge in store::neighbors_out(view, graph, &vertex, None)? {
            if !edge_allowed(&edge, label, geo) {
                continue;
            }
            let w = edge_weight(&edge, weight_attr);
            if w < 0.0 {
                continue;
            }
            let next_cost = cost + w;
            if next_cost < dist.get(&edge.to).copied().unwrap_or(f64::INFINITY) {
                dist.insert(edge.to.clone(), next_cost);
                prev.insert(edge.to.clone(), vertex.clone());
                heap.push(QueueEntry { cost: next_cost, vertex: edge.to });
            }
        }
    }
    Ok(None)
}

/// In- and out-degree per vertex over the whole graph.
pub fn degree_centrality(
    view: &dyn KvRead,
    graph: &str,
) -> Result<FxHashMap<String, (usize, usize)>> {
    let mut degrees: FxHashMap<String, (usize, usize)> = FxHashMap::default();
    for edge in store::all_edges(view, graph)? {
        degrees.entry(edge.from).or_default().1 += 1;
        degrees.entry(edge.to).or_default().0 += 1;
    }
    Ok(degrees)
}

/// Connected components, edges taken as undirected. Returns one sorted
/// vertex list per component, components sorted by their smallest member.
pub fn connected_components(view: &dyn KvRead, graph: &str) -> Result<Vec<Vec<String>>> {
    let mut adjacency: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for edge in store::all_edges(view, graph)? {
        adjacency
            .entry(edge.from.clone())
            .or_default()
            .push(edge.to.clone());
        adjacency.entry(edge.to).or_default().push(edge.from);
    }
    let mut vertices: Vec<&String> = adjacency.keys().collect();
    vertices.sort();

    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut components = Vec::new();
    for v in vertices {
        if seen.contains(v.as_str()) {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = VecDeque::from([v.clone()]);
        seen.insert(v.clone());
        while let Some(current) = queue.pop_front() {
            component.push(current.clone());
            if let Some(neighbors) = adjacency.get(&current) {
                for n in neighbors {
                    if seen.insert(n.clone()) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }
        component.sort();
        components.push(component);
    }
    Ok(components)
}

/// Power-iteration PageRank with damping 0.85.
///
/// Stops when the largest per-node delta drops under `tolerance` or after
/// `max_iterations`. Dangling mass is redistributed uniformly.
pub fn pagerank(
    view: &dyn KvRead,
    graph: &str,
    tolerance: f64,
    max_iterations: usize,
) -> Result<FxHashMap<String, f64>> {
    let edges = store::all_edges(view, graph)?;
    let mut vertices: FxHashSet<String> = FxHashSet::default();
    let mut out_edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for edge in edges {
        vertices.insert(edge.from.clone());
        vertices.insert(edge.to.clone());
        out_edges.entry(edge.from).or_default().push(edge.to);
    }
    let n = vertices.len();
    if n == 0 {
        return Ok(FxHashMap::default());
    }
    let uniform = 1.0 / n as f64;
    let mut rank: FxHashMap<String, f64> =
        vertices.iter().map(|v| (v.clone(), uniform)).collect();

    for _ in 0..max_iterations {
        let mut next: FxHashMap<String, f64> =
            vertices.iter().map(|v| (v.clone(), 0.0)).collect();
        let mut dangling = 0.0;
        for v in &vertices {
            let r = rank[v];
            match out_edges.get(v) {
                Some(targets) if !targets.is_empty() => {
                    let share = r / targets.len() as f64;
                    for t in targets {
                        if let Some(slot) = next.get_mut(t) {
                            *slot += share;
                        }
                    }
                }
                _ => dangling += r,
            }
        }
        let dangling_share = dangling / n as f64;
        let mut max_delta: f64 = 0.0;
        for v in &vertices {
            let inbound = next.get(v).copied().unwrap_or(0.0);
            let value = (1.0 - PAGERANK_DAMPING) * uniform
                + PAGERANK_DAMPING * (inbound + dangling_share);
            let delta = (value - rank.get(v).copied().unwrap_or(uniform)).abs();
            max_delta = max_delta.max(delta);
            next.insert(v.clone(), value);
        }
        rank = next;
        if max_delta < tolerance {
            break;
        }
    }
    Ok(rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{stage_add_edge, EdgeRef};
    use themis_storage::{KvEngine, WriteBatch};

    fn edge(from: &str, to: &str, weight: f64) -> EdgeRef {
        EdgeRef {
            from: from.into(),
            to: to.into(),
            edge_id: format!("{from}->{to}"),
            label: "road".into(),
            props: Value::object([("distance", Value::Float(weight))]),
        }
    }

    fn build(edges: &[(&str, &str, f64)]) -> KvEngine {
        let engine = KvEngine::new();
        let mut batch = WriteBatch::new();
        for (from, to, w) in edges {
            stage_add_edge("g", &edge(from, to, *w), &mut batch).unwrap();
        }
        engine.apply(&batch, 1);
        engine
    }

    #[test]
    fn bfs_levels() {
        let engine = build(&[("a", "b", 1.0), ("a", "c", 1.0), ("b", "d", 1.0)]);
        let snap = engine.snapshot();
        let order = bfs(&snap, "g", "a", 10, None, None).unwrap();
        assert_eq!(order[0], ("a".to_string(), 0));
        let depth_of = |v: &str| order.iter().find(|(x, _)| x == v).unwrap().1;
        assert_eq!(depth_of("b"), 1);
        assert_eq!(depth_of("c"), 1);
        assert_eq!(depth_of("d"), 2);

        // Depth bound stops expansion.
        let shallow = bfs(&snap, "g", "a", 1, None, None).unwrap();
        assert!(shallow.iter().all(|(_, d)| *d <= 1));
        assert_eq!(shallow.len(), 3);
    }

    #[test]
    fn dfs_preorder() {
        let engine = build(&[("a", "b", 1.0), ("b", "c", 1.0), ("a", "d", 1.0)]);
        let snap = engine.snapshot();
        let order = dfs(&snap, "g", "a", 10, None, None).unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn dijkstra_prefers_cheaper_detour() {
        let engine = build(&[
            ("a", "b", 10.0),
            ("a", "c", 1.0),
            ("c", "b", 2.0),
            ("b", "z", 1.0),
        ]);
        let snap = engine.snapshot();
        let path = shortest_path(&snap, "g", "a", "z", "distance", None, None)
            .unwrap()
            .expect("reachable");
        assert_eq!(path.vertices, vec!["a", "c", "b", "z"]);
        assert!((path.total_weight - 4.0).abs() < 1e-9);
    }

    #[test]
    fn dijkstra_unreachable_is_none() {
        let engine = build(&[("a", "b", 1.0), ("x", "y", 1.0)]);
        let snap = engine.snapshot();
        assert!(shortest_path(&snap, "g", "a", "y", "distance", None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_weight_defaults_to_one() {
        let engine = KvEngine::new();
        let mut batch = WriteBatch::new();
        let mut e = edge("a", "b", 0.0);
        e.props = Value::empty_object();
        stage_add_edge("g", &e, &mut batch).unwrap();
        engine.apply(&batch, 1);
        let snap = engine.snapshot();
        let path = shortest_path(&snap, "g", "a", "b", "distance", None, None)
            .unwrap()
            .unwrap();
        assert!((path.total_weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn geo_filter_blocks_outside_edges() {
        // a and b near the centre, far is ~500 km away.
        let engine = build(&[("a", "b", 1.0), ("b", "far", 1.0), ("far", "z", 1.0)]);
        let snap = engine.snapshot();
        let locate = |v: &str| match v {
            "a" => Some(GeoPoint::new(13.40, 52.52)),
            "b" => Some(GeoPoint::new(13.45, 52.50)),
            "far" => Some(GeoPoint::new(11.58, 48.14)),
            "z" => Some(GeoPoint::new(11.60, 48.15)),
            _ => None,
        };
        let filter = GeoCircleFilter {
            center: GeoPoint::new(13.4, 52.5),
            radius_m: 50_000.0,
            locate: &locate,
        };
        let reachable = bfs(&snap, "g", "a", 10, None, Some(&filter)).unwrap();
        let names: Vec<&str> = reachable.iter().map(|(v, _)| v.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(shortest_path(&snap, "g", "a", "z", "distance", None, Some(&filter))
            .unwrap()
            .is_none());
    }

    #[test]
    fn degrees() {
        let engine = build(&[("a", "b", 1.0), ("a", "c", 1.0), ("c", "b", 1.0)]);
        let snap = engine.snapshot();
        let degrees = degree_centrality(&snap, "g").unwrap();
        assert_eq!(degrees["a"], (0, 2));
        assert_eq!(degrees["b"], (2, 0));
        assert_eq!(degrees["c"], (1, 1));
    }

    #[test]
    fn components() {
        let engine = build(&[("a", "b", 1.0), ("b", "c", 1.0), ("x", "y", 1.0)]);
        let snap = engine.snapshot();
        let components = connected_components(&snap, "g").unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec!["a", "b", "c"]);
        assert_eq!(components[1], vec!["x", "y"]);
    }

    #[test]
    fn pagerank_favours_sinks_of_links() {
        let engine = build(&[
            ("a", "hub", 1.0),
            ("b", "hub", 1.0),
            ("c", "hub", 1.0),
            ("hub", "a", 1.0),
        ]);
        let snap = engine.snapshot();
        let ranks = pagerank(&snap, "g", 1e-9, 100).unwrap();
        assert!(ranks["hub"] > ranks["b"]);
        assert!(ranks["hub"] > ranks["c"]);
        // Ranks form a distribution.
        let total: f64 = ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pagerank_empty_graph() {
        let engine = KvEngine::new();
        let snap = engine.snapshot();
        assert!(pagerank(&snap, "g", 1e-6, 10).unwrap().is_empty());
    }
}
