//! JSON-typed document model.
//!
//! Every entity value is a `Value`: a scalar (string / int64 / float64 /
//! bool / null), a binary blob, a fixed-width f32 vector, an ordered array,
//! or a string-keyed object. Documents are validated once at the entity-store
//! boundary so index paths downstream stay monomorphic.

use crate::error::{Result, ThemisError};
use crate::limits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A JSON-typed value.
///
/// Binary blobs and f32 vectors are first-class scalar kinds, not encoded
/// arrays: the vector index and the blob paths never touch `Array`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Binary blob.
    Bytes(Vec<u8>),
    /// Fixed-width f32 vector (embedding).
    Vector(Vec<f32>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// String-keyed mapping. BTreeMap keeps field iteration deterministic.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Vector(_) => "vector",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow as f64. Integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Borrow as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as f32 vector.
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Look up a dotted field path (`"address.city"`).
    ///
    /// Array segments are numeric indices. Returns `None` when any segment is
    /// absent, which is how sparse indices detect missing fields.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(segment)?;
                }
                Value::Array(items) => {
                    let idx: usize = segment.parse().ok()?;
                    current = items.get(idx)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// Validate a document against the entity-store limits.
    ///
    /// Rejects non-finite vector components, over-deep nesting and oversized
    /// vectors. Plain floats may be non-finite only inside documents, never
    /// inside vectors; NaN in a scalar field is rejected as well because the
    /// sortable encoding has no total order for it.
    pub fn validate(&self) -> Result<()> {
        self.validate_at_depth(0)
    }

    fn validate_at_depth(&self, depth: usize) -> Result<()> {
        if depth > limits::MAX_NESTING_DEPTH {
            return Err(ThemisError::invalid_value(format!(
                "nesting deeper than {} levels",
                limits::MAX_NESTING_DEPTH
            )));
        }
        match self {
            Value::Float(f) if !f.is_finite() => {
                Err(ThemisError::invalid_value("non-finite float"))
            }
            Value::Vector(v) => {
                if v.len() > limits::MAX_VECTOR_DIM {
                    return Err(ThemisError::invalid_value(format!(
                        "vector dimension {} over limit {}",
                        v.len(),
                        limits::MAX_VECTOR_DIM
                    )));
                }
                if v.iter().any(|c| !c.is_finite()) {
                    return Err(ThemisError::invalid_value("non-finite vector component"));
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    item.validate_at_depth(depth + 1)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                for value in map.values() {
                    value.validate_at_depth(depth + 1)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Convert from `serde_json::Value`.
    ///
    /// JSON numbers become `Int` when they are exact integers, `Float`
    /// otherwise. There is no JSON syntax for blobs or vectors; those arrive
    /// through the typed API.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to `serde_json::Value` for the changefeed's JSON rendering.
    ///
    /// Blobs render as arrays of byte values and vectors as float arrays;
    /// consumers that need the typed forms use the binary encoding instead.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::Vector(v) => serde_json::Value::Array(
                v.iter()
                    .map(|c| {
                        serde_json::Number::from_f64(*c as f64)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Serialize to the persisted binary form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    /// Deserialize from the persisted binary form.
    pub fn decode(bytes: &[u8]) -> Result<Value> {
        bincode::deserialize(bytes).map_err(Into::into)
    }

    /// Build an object from key/value pairs. Test and example convenience.
    pub fn object<I, K>(fields: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An object with no fields.
    pub fn empty_object() -> Value {
        Value::Object(BTreeMap::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Vector(v) => write!(f, "<vector dim {}>", v.len()),
            Value::Array(a) => write!(f, "<array len {}>", a.len()),
            Value::Object(m) => write!(f, "<object {} fields>", m.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Value {
        Value::object([
            ("name", Value::from("Hotel Adlon")),
            ("stars", Value::from(5i64)),
            (
                "address",
                Value::object([("city", Value::from("Berlin"))]),
            ),
            (
                "tags",
                Value::Array(vec![Value::from("luxury"), Value::from("historic")]),
            ),
        ])
    }

    #[test]
    fn path_lookup() {
        let d = doc();
        assert_eq!(d.get_path("name").and_then(Value::as_str), Some("Hotel Adlon"));
        assert_eq!(d.get_path("address.city").and_then(Value::as_str), Some("Berlin"));
        assert_eq!(d.get_path("tags.1").and_then(Value::as_str), Some("historic"));
        assert!(d.get_path("address.zip").is_none());
        assert!(d.get_path("tags.9").is_none());
    }

    #[test]
    fn binary_round_trip() {
        let d = doc();
        let bytes = d.encode().unwrap();
        assert_eq!(Value::decode(&bytes).unwrap(), d);
    }

    #[test]
    fn json_round_trip_preserves_scalars() {
        let json = serde_json::json!({"a": 1, "b": 2.5, "c": "x", "d": null, "e": [true]});
        let v = Value::from_json(json.clone());
        assert_eq!(v.get_path("a"), Some(&Value::Int(1)));
        assert_eq!(v.get_path("b"), Some(&Value::Float(2.5)));
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn rejects_nan_vector() {
        let v = Value::object([("emb", Value::Vector(vec![1.0, f32::NAN]))]);
        let err = v.validate().unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn rejects_non_finite_float() {
        let v = Value::object([("x", Value::Float(f64::INFINITY))]);
        assert!(v.validate().is_err());
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut v = Value::Int(0);
        for _ in 0..(limits::MAX_NESTING_DEPTH + 2) {
            v = Value::Array(vec![v]);
        }
        assert!(v.validate().is_err());
    }
}
