//! Adjacency and label rows.

use serde::{Deserialize, Serialize};
use themis_core::key::{self, EdgeDir, KeyPrefix};
use themis_core::{Result, ThemisError, Value};
use themis_storage::{KvRead, WriteBatch};

/// Descriptor of a named graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Graph name; scopes every adjacency and label row.
    pub name: String,
}

/// One edge, as seen from a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRef {
    /// Source vertex.
    pub from: String,
    /// Target vertex.
    pub to: String,
    /// Edge id, unique per `(from, to)`.
    pub edge_id: String,
    /// Edge label (type).
    pub label: String,
    /// Edge properties (weights live here).
    pub props: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRow {
    label: String,
    props: Value,
}

/// Stage both directed rows of an edge.
pub fn stage_add_edge(
    graph: &str,
    edge: &EdgeRef,
    batch: &mut WriteBatch,
) -> Result<()> {
    if edge.from.is_empty() || edge.to.is_empty() || edge.edge_id.is_empty() {
        return Err(ThemisError::invalid_value(
            "edge endpoints and id must be non-empty",
        ));
    }
    let row = bincode::serialize(&EdgeRow {
        label: edge.label.clone(),
        props: edge.props.clone(),
    })?;
    batch.put(
        key::graph_adj_key(graph, EdgeDir::Out, &edge.from, &edge.to, &edge.edge_id),
        row.clone(),
    );
    batch.put(
        key::graph_adj_key(graph, EdgeDir::In, &edge.to, &edge.from, &edge.edge_id),
        row,
    );
    Ok(())
}

/// Stage removal of both directed rows of an edge.
pub fn stage_remove_edge(
    graph: &str,
    from: &str,
    to: &str,
    edge_id: &str,
    batch: &mut WriteBatch,
) {
    batch.delete(key::graph_adj_key(graph, EdgeDir::Out, from, to, edge_id));
    batch.delete(key::graph_adj_key(graph, EdgeDir::In, to, from, edge_id));
}

/// Stage a vertex label row.
pub fn stage_set_label(graph: &str, label: &str, vertex: &str, batch: &mut WriteBatch) {
    batch.put(key::graph_label_key(graph, label, vertex), Vec::new());
}

/// Stage removal of a vertex label row.
pub fn stage_remove_label(graph: &str, label: &str, vertex: &str, batch: &mut WriteBatch) {
    batch.delete(key::graph_label_key(graph, label, vertex));
}

fn decode_adj(entry_key: &[u8], bytes: &[u8], dir: EdgeDir) -> Result<EdgeRef> {
    let rest = entry_key
        .strip_prefix(KeyPrefix::IdxGraph.as_bytes())
        .ok_or_else(|| ThemisError::corruption("graph key family mismatch"))?;
    let fields = key::split_fields(rest)?;
    if fields.len() != 5 {
        return Err(ThemisError::corruption("graph adjacency key shape"));
    }
    let near = String::from_utf8(fields[2].clone())
        .map_err(|_| ThemisError::corruption("non-utf8 vertex"))?;
    let far = String::from_utf8(fields[3].clone())
        .map_err(|_| ThemisError::corruption("non-utf8 vertex"))?;
    let edge_id = String::from_utf8(fields[4].clone())
        .map_err(|_| ThemisError::corruption("non-utf8 edge id"))?;
    let row: EdgeRow = bincode::deserialize(bytes)?;
    let (from, to) = match dir {
        EdgeDir::Out => (near, far),
        EdgeDir::In => (far, near),
    };
    Ok(EdgeRef {
        from,
        to,
        edge_id,
        label: row.label,
        props: row.props,
    })
}

/// Outgoing edges of a vertex, optionally restricted to one label.
pub fn neighbors_out(
    view: &dyn KvRead,
    graph: &str,
    vertex: &str,
    label: Option<&str>,
) -> Result<Vec<EdgeRef>> {
    scan_adj(view, graph, vertex, EdgeDir::Out, label)
}

/// Incoming edges of a vertex, optionally restricted to one label.
pub fn neighbors_in(
    view: &dyn KvRead,
    graph: &str,
    vertex: &str,
    label: Option<&str>,
) -> Result<Vec<EdgeRef>> {
    scan_adj(view, graph, vertex, EdgeDir::In, label)
}

fn scan_adj(
    view: &dyn KvRead,
    graph: &str,
    vertex: &str,
    dir: EdgeDir,
    label: Option<&str>,
) -> Result<Vec<EdgeRef>> {
    let prefix = key::graph_adj_prefix(graph, dir, vertex);
    let mut out = Vec::new();
    for (entry_key, bytes) in view.scan_prefix(&prefix, usize::MAX) {
        let edge = decode_adj(&entry_key, &bytes, dir)?;
        if label.map_or(true, |l| edge.label == l) {
            out.push(edge);
        }
    }
    Ok(out)
}

/// Every edge of the graph, via the out-orientation rows.
pub fn all_edges(view: &dyn KvRead, graph: &str) -> Result<Vec<EdgeRef>> {
    let mut prefix = KeyPrefix::IdxGraph.as_bytes().to_vec();
    key::push_field(&mut prefix, graph.as_bytes());
    key::push_field(&mut prefix, b"o");
    let mut out = Vec::new();
    for (entry_key, bytes) in view.scan_prefix(&prefix, usize::MAX) {
        out.push(decode_adj(&entry_key, &bytes, EdgeDir::Out)?);
    }
    Ok(out)
}

/// Vertices carrying a label.
pub fn vertices_with_label(view: &dyn KvRead, graph: &str, label: &str) -> Result<Vec<String>> {
    let prefix = key::graph_label_prefix(graph, label);
    view.scan_prefix(&prefix, usize::MAX)
        .into_iter()
        .map(|(entry_key, _)| {
            let rest = entry_key
                .strip_prefix(KeyPrefix::IdxGraph.as_bytes())
                .ok_or_else(|| ThemisError::corruption("graph key family mismatch"))?;
            let fields = key::split_fields(rest)?;
            let vertex = fields
                .into_iter()
                .last()
                .ok_or_else(|| ThemisError::corruption("label key shape"))?;
            String::from_utf8(vertex).map_err(|_| ThemisError::corruption("non-utf8 vertex"))
        })
        .collect()
}
