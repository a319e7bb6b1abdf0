//! Shared key layout for the single KV namespace.
//!
//! Every component writes into one ordered keyspace. Keys are a short ASCII
//! prefix naming the family, followed by length-delimited fields:
//!
//! ```text
//! ent:<table><pk>                      entity value
//! idx:eq:<table><field><value><pk>     equality secondary
//! idx:rng:<table><field><value><pk>    range secondary
//! idx:cmp:<table><name><tuple..><pk>   composite
//! idx:spr:<table><field><value><pk>    sparse
//! idx:ttl:<table><expire><pk>          ttl
//! idx:ft:<table><field><term><pk>      full-text postings
//! idx:ftd:<table><field><pk>           full-text doc lengths
//! idx:vec:<table><field>...            vector graph pages + blobs
//! idx:spa:<table><field><pk>           spatial leaf entries
//! idx:gph:<graph><dir><from><to><eid>  graph adjacency
//! meta:<kind><name>                    catalog, stats, config
//! cdc:<seq_be_u64>                     changefeed
//! ```
//!
//! Fields use a 0x00-escaped, 0x00 0x00-terminated encoding rather than a
//! count prefix: escaping keeps byte-order comparison equal to field-order
//! comparison, so a prefix scan over `ent:<table>` yields entities in pk
//! order and a range index scan yields `(value, pk)` order. A count prefix
//! would sort short-but-large values before long-but-small ones.
//!
//! Scalar values embed with an order-preserving encoding: sign-flipped
//! big-endian two's-complement for integers, monotone bit transform for
//! floats, verbatim UTF-8 for strings, a single byte for booleans.

use crate::error::{Result, ThemisError};
use crate::value::Value;

/// Key family prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPrefix {
    /// Entity values.
    Entity,
    /// Equality secondary index.
    IdxEq,
    /// Range secondary index.
    IdxRange,
    /// Composite index.
    IdxComposite,
    /// Sparse index.
    IdxSparse,
    /// TTL index.
    IdxTtl,
    /// Full-text postings.
    IdxFullText,
    /// Full-text document lengths.
    IdxFullTextDoc,
    /// Vector index pages and blobs.
    IdxVector,
    /// Spatial index leaf entries.
    IdxSpatial,
    /// Graph adjacency.
    IdxGraph,
    /// Catalog, statistics and persisted config.
    Meta,
    /// Changefeed records.
    Cdc,
}

impl KeyPrefix {
    /// The literal prefix bytes.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            KeyPrefix::Entity => b"ent:",
            KeyPrefix::IdxEq => b"idx:eq:",
            KeyPrefix::IdxRange => b"idx:rng:",
            KeyPrefix::IdxComposite => b"idx:cmp:",
            KeyPrefix::IdxSparse => b"idx:spr:",
            KeyPrefix::IdxTtl => b"idx:ttl:",
            KeyPrefix::IdxFullText => b"idx:ft:",
            KeyPrefix::IdxFullTextDoc => b"idx:ftd:",
            KeyPrefix::IdxVector => b"idx:vec:",
            KeyPrefix::IdxSpatial => b"idx:spa:",
            KeyPrefix::IdxGraph => b"idx:gph:",
            KeyPrefix::Meta => b"meta:",
            KeyPrefix::Cdc => b"cdc:",
        }
    }
}

// ============================================================================
// Field encoding
// ============================================================================

/// Append one escaped, terminated field.
pub fn push_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            buf.push(0x00);
            buf.push(0xFF);
        } else {
            buf.push(b);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

/// Split the encoded fields following `prefix` back into raw byte fields.
///
/// Fails with `Corruption` on a dangling escape or missing terminator, which
/// only happens if a key was written outside this module.
pub fn split_fields(mut encoded: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut fields = Vec::new();
    while !encoded.is_empty() {
        let mut field = Vec::new();
        let mut i = 0;
        loop {
            match encoded.get(i) {
                Some(0x00) => match encoded.get(i + 1) {
                    Some(0xFF) => {
                        field.push(0x00);
                        i += 2;
                    }
                    Some(0x00) => {
                        i += 2;
                        break;
                    }
                    _ => {
                        return Err(ThemisError::corruption("dangling escape in key field"));
                    }
                },
                Some(&b) => {
                    field.push(b);
                    i += 1;
                }
                None => {
                    return Err(ThemisError::corruption("unterminated key field"));
                }
            }
        }
        fields.push(field);
        encoded = &encoded[i..];
    }
    Ok(fields)
}

/// The smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when the prefix is all 0xFF (scan to the end).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

// ============================================================================
// Sortable scalar encoding
// ============================================================================

const SIGN_BIT: u64 = 1 << 63;

/// Order-preserving encoding of an i64.
pub fn encode_i64(i: i64) -> [u8; 8] {
    ((i as u64) ^ SIGN_BIT).to_be_bytes()
}

/// Inverse of [`encode_i64`].
pub fn decode_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64
}

/// Order-preserving encoding of an f64.
///
/// Positive floats get the sign bit set; negative floats are fully inverted,
/// which reverses their bit order to match numeric order. `-0.0` sorts just
/// below `0.0`. NaN is rejected upstream by document validation.
pub fn encode_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let mapped = if bits & SIGN_BIT == 0 {
        bits | SIGN_BIT
    } else {
        !bits
    };
    mapped.to_be_bytes()
}

/// Inverse of [`encode_f64`].
pub fn decode_f64(bytes: [u8; 8]) -> f64 {
    let mapped = u64::from_be_bytes(bytes);
    let bits = if mapped & SIGN_BIT != 0 {
        mapped ^ SIGN_BIT
    } else {
        !mapped
    };
    f64::from_bits(bits)
}

/// Encode a scalar into its order-preserving byte form.
///
/// Only scalars can appear in index positions; arrays, objects and vectors
/// are `Unsupported`.
pub fn encode_sortable(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Bool(b) => Ok(vec![u8::from(*b)]),
        Value::Int(i) => Ok(encode_i64(*i).to_vec()),
        Value::Float(f) => Ok(encode_f64(*f).to_vec()),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(ThemisError::unsupported(format!(
            "{} in index position",
            other.type_name()
        ))),
    }
}

// ============================================================================
// Tuple encoding (composite indices)
// ============================================================================

/// Type tags giving tuples a total cross-type order:
/// null < bool < int < float < string < bytes.
mod tag {
    pub const NULL: u8 = 0x01;
    pub const BOOL: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const STRING: u8 = 0x05;
    pub const BYTES: u8 = 0x06;
}

/// Self-delimiting encoding of an ordered list of scalar values.
///
/// Each element is a type tag plus its sortable form, wrapped in one escaped
/// field, so an equality prefix of the tuple is a byte prefix of the encoding
/// and range scans over the encoded form follow element order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTuple(Vec<Vec<u8>>);

impl FieldTuple {
    /// Encode a list of scalar values.
    pub fn encode(values: &[Value]) -> Result<FieldTuple> {
        let mut elements = Vec::with_capacity(values.len());
        for value in values {
            let t = match value {
                Value::Null => tag::NULL,
                Value::Bool(_) => tag::BOOL,
                Value::Int(_) => tag::INT,
                Value::Float(_) => tag::FLOAT,
                Value::String(_) => tag::STRING,
                Value::Bytes(_) => tag::BYTES,
                other => {
                    return Err(ThemisError::unsupported(format!(
                        "{} in composite index position",
                        other.type_name()
                    )))
                }
            };
            let mut element = Vec::with_capacity(9);
            element.push(t);
            element.extend_from_slice(&encode_sortable(value)?);
            elements.push(element);
        }
        Ok(FieldTuple(elements))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the tuple is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append the first `n` elements as escaped fields. Used for prefix scans.
    pub fn push_prefix(&self, buf: &mut Vec<u8>, n: usize) {
        for element in self.0.iter().take(n) {
            push_field(buf, element);
        }
    }

    /// Append every element as an escaped field.
    pub fn push_all(&self, buf: &mut Vec<u8>) {
        self.push_prefix(buf, self.0.len());
    }
}

// ============================================================================
// Key builders
// ============================================================================

fn base(prefix: KeyPrefix) -> Vec<u8> {
    prefix.as_bytes().to_vec()
}

/// `ent:<table><pk>`.
pub fn entity_key(table: &str, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::Entity);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering all entities of a table.
pub fn entity_prefix(table: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::Entity);
    push_field(&mut k, table.as_bytes());
    k
}

/// Primary key of an entity key. Fails on keys from other families.
pub fn entity_pk(key: &[u8]) -> Result<String> {
    let prefix = KeyPrefix::Entity.as_bytes();
    let rest = key
        .strip_prefix(prefix)
        .ok_or_else(|| ThemisError::corruption("not an entity key"))?;
    let fields = split_fields(rest)?;
    let pk = fields
        .into_iter()
        .nth(1)
        .ok_or_else(|| ThemisError::corruption("entity key missing pk field"))?;
    String::from_utf8(pk).map_err(|_| ThemisError::corruption("non-utf8 pk"))
}

/// Scalar index entry key (`idx:eq:` / `idx:rng:` / `idx:spr:`).
pub fn scalar_index_key(
    prefix: KeyPrefix,
    table: &str,
    field: &str,
    sortable_value: &[u8],
    pk: &str,
) -> Vec<u8> {
    let mut k = base(prefix);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, sortable_value);
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering every entry of one scalar index.
pub fn scalar_index_prefix(prefix: KeyPrefix, table: &str, field: &str) -> Vec<u8> {
    let mut k = base(prefix);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    k
}

/// Prefix covering every entry of one scalar index with one value.
pub fn scalar_index_value_prefix(
    prefix: KeyPrefix,
    table: &str,
    field: &str,
    sortable_value: &[u8],
) -> Vec<u8> {
    let mut k = scalar_index_prefix(prefix, table, field);
    push_field(&mut k, sortable_value);
    k
}

/// Last field of an index entry key: the primary key.
pub fn index_entry_pk(prefix: KeyPrefix, key: &[u8]) -> Result<String> {
    let rest = key
        .strip_prefix(prefix.as_bytes())
        .ok_or_else(|| ThemisError::corruption("index key family mismatch"))?;
    let fields = split_fields(rest)?;
    let pk = fields
        .into_iter()
        .last()
        .ok_or_else(|| ThemisError::corruption("index key missing pk field"))?;
    String::from_utf8(pk).map_err(|_| ThemisError::corruption("non-utf8 pk in index key"))
}

/// Composite index entry key: `idx:cmp:<table><name><tuple..><pk>`.
pub fn composite_index_key(table: &str, name: &str, tuple: &FieldTuple, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxComposite);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, name.as_bytes());
    tuple.push_all(&mut k);
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering composite entries matching the first `n` tuple elements.
pub fn composite_index_prefix(table: &str, name: &str, tuple: &FieldTuple, n: usize) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxComposite);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, name.as_bytes());
    tuple.push_prefix(&mut k, n);
    k
}

/// TTL index entry key: `idx:ttl:<table><expire_be_u64><pk>`.
pub fn ttl_index_key(table: &str, expire_at_ms: u64, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxTtl);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, &expire_at_ms.to_be_bytes());
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering a table's TTL entries.
pub fn ttl_index_prefix(table: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxTtl);
    push_field(&mut k, table.as_bytes());
    k
}

/// Full-text posting key: `idx:ft:<table><field><term><pk>`.
pub fn ft_posting_key(table: &str, field: &str, term: &str, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxFullText);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, term.as_bytes());
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering one term's postings.
pub fn ft_term_prefix(table: &str, field: &str, term: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxFullText);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, term.as_bytes());
    k
}

/// Full-text doc-length key: `idx:ftd:<table><field><pk>`.
pub fn ft_doc_key(table: &str, field: &str, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxFullTextDoc);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering one full-text field's doc-length rows.
pub fn ft_doc_prefix(table: &str, field: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxFullTextDoc);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    k
}

/// Vector index graph page: `idx:vec:<table><field>g`.
pub fn vec_graph_key(table: &str, field: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxVector);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, b"g");
    k
}

/// Vector blob key: `idx:vec:<table><field>v<pk>`.
pub fn vec_blob_key(table: &str, field: &str, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxVector);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, b"v");
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering one vector index's blobs.
pub fn vec_blob_prefix(table: &str, field: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxVector);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, b"v");
    k
}

/// Prefix covering everything a vector index persisted.
pub fn vec_index_prefix(table: &str, field: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxVector);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    k
}

/// Spatial leaf entry key: `idx:spa:<table><field><pk>`.
pub fn spatial_entry_key(table: &str, field: &str, pk: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxSpatial);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    push_field(&mut k, pk.as_bytes());
    k
}

/// Prefix covering one spatial index's leaf entries.
pub fn spatial_index_prefix(table: &str, field: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxSpatial);
    push_field(&mut k, table.as_bytes());
    push_field(&mut k, field.as_bytes());
    k
}

/// Edge direction marker inside graph keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDir {
    /// Stored under the source vertex.
    Out,
    /// Stored under the target vertex.
    In,
}

impl EdgeDir {
    fn tag(self) -> &'static [u8] {
        match self {
            EdgeDir::Out => b"o",
            EdgeDir::In => b"i",
        }
    }
}

/// Adjacency key: `idx:gph:<graph><dir><from><to><edge_id>`.
///
/// For `EdgeDir::In` the `from` position holds the target vertex so both
/// orientations scan as a prefix of one vertex.
pub fn graph_adj_key(graph: &str, dir: EdgeDir, near: &str, far: &str, edge_id: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxGraph);
    push_field(&mut k, graph.as_bytes());
    push_field(&mut k, dir.tag());
    push_field(&mut k, near.as_bytes());
    push_field(&mut k, far.as_bytes());
    push_field(&mut k, edge_id.as_bytes());
    k
}

/// Prefix covering one vertex's adjacency in one direction.
pub fn graph_adj_prefix(graph: &str, dir: EdgeDir, near: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxGraph);
    push_field(&mut k, graph.as_bytes());
    push_field(&mut k, dir.tag());
    push_field(&mut k, near.as_bytes());
    k
}

/// Vertex label row: `idx:gph:<graph>l<label><vertex>`.
pub fn graph_label_key(graph: &str, label: &str, vertex: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxGraph);
    push_field(&mut k, graph.as_bytes());
    push_field(&mut k, b"l");
    push_field(&mut k, label.as_bytes());
    push_field(&mut k, vertex.as_bytes());
    k
}

/// Prefix covering one graph label's vertices.
pub fn graph_label_prefix(graph: &str, label: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::IdxGraph);
    push_field(&mut k, graph.as_bytes());
    push_field(&mut k, b"l");
    push_field(&mut k, label.as_bytes());
    k
}

/// Catalog/stats key: `meta:<kind><name>`.
pub fn meta_key(kind: &str, name: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::Meta);
    push_field(&mut k, kind.as_bytes());
    push_field(&mut k, name.as_bytes());
    k
}

/// Prefix covering one meta kind.
pub fn meta_prefix(kind: &str) -> Vec<u8> {
    let mut k = base(KeyPrefix::Meta);
    push_field(&mut k, kind.as_bytes());
    k
}

/// Changefeed key: `cdc:<seq_be_u64>`. Fixed-width, so byte order is seq order.
pub fn cdc_key(seq: u64) -> Vec<u8> {
    let mut k = base(KeyPrefix::Cdc);
    k.extend_from_slice(&seq.to_be_bytes());
    k
}

/// Sequence number of a changefeed key.
pub fn cdc_seq(key: &[u8]) -> Result<u64> {
    let rest = key
        .strip_prefix(KeyPrefix::Cdc.as_bytes())
        .ok_or_else(|| ThemisError::corruption("not a cdc key"))?;
    let bytes: [u8; 8] = rest
        .try_into()
        .map_err(|_| ThemisError::corruption("cdc key length"))?;
    Ok(u64::from_be_bytes(bytes))
}
