//! Equality, range, composite, sparse and TTL indices.
//!
//! Entry layout (see `themis_core::key`):
//! - scalar kinds: `<prefix><table><field><sortable_value><pk>` with an empty
//!   value; equality, range and sparse share the shape and differ in prefix
//!   and in how absent fields are handled.
//! - composite: `idx:cmp:<table><name><tuple..><pk>`.
//! - ttl: `idx:ttl:<table><expire_be_u64><pk>`.
//!
//! Equality and range indices map an absent or null field to the Null
//! sortable form so every row is reachable through them; sparse indices skip
//! those rows, which is the point of being sparse.

use serde::{Deserialize, Serialize};
use themis_core::key::{self, FieldTuple, KeyPrefix};
use themis_core::{Result, ThemisError, Value};
use themis_storage::{KvRead, WriteBatch};

/// Scalar index flavours sharing one entry shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarIndexKind {
    /// Point lookups by value.
    Equality,
    /// Ordered scans over the sortable encoding.
    Range,
    /// Like equality, but absent/null fields emit nothing.
    Sparse,
}

impl ScalarIndexKind {
    /// The key family this kind writes into.
    pub fn prefix(self) -> KeyPrefix {
        match self {
            ScalarIndexKind::Equality => KeyPrefix::IdxEq,
            ScalarIndexKind::Range => KeyPrefix::IdxRange,
            ScalarIndexKind::Sparse => KeyPrefix::IdxSparse,
        }
    }
}

/// Descriptor of a single-field scalar index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarIndexSpec {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Dotted field path.
    pub field: String,
    /// Flavour.
    pub kind: ScalarIndexKind,
    /// Reject duplicate values across distinct primary keys.
    pub unique: bool,
}

/// Descriptor of a composite index over an ordered field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeIndexSpec {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Ordered dotted field paths.
    pub fields: Vec<String>,
}

/// Descriptor of a TTL index. The field holds an expire-at timestamp in
/// milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlIndexSpec {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Dotted field path of the expire-at timestamp.
    pub field: String,
}

/// One decoded index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The order-preserving encoded value (or encoded tuple remainder).
    pub sortable: Vec<u8>,
    /// Primary key.
    pub pk: String,
}

// ============================================================================
// Maintenance
// ============================================================================

fn indexed_value(doc: Option<&Value>, field: &str) -> Option<Value> {
    doc.and_then(|d| d.get_path(field)).cloned()
}

/// Re-derive one scalar index for a document transition `old -> new`.
///
/// Either side may be `None` (insert / delete). Unique enforcement reads
/// through the transactional view, so duplicates staged earlier in the same
/// transaction are caught too.
pub fn apply_scalar(
    spec: &ScalarIndexSpec,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    view: &dyn KvRead,
    batch: &mut WriteBatch,
) -> Result<()> {
    let prefix = spec.kind.prefix();
    if let Some(sortable) = entry_value(spec.kind, indexed_value(old, &spec.field))? {
        batch.delete(key::scalar_index_key(
            prefix,
            &spec.table,
            &spec.field,
            &sortable,
            pk,
        ));
    }
    if new.is_none() {
        return Ok(());
    }
    if let Some(sortable) = entry_value(spec.kind, indexed_value(new, &spec.field))? {
        if spec.unique {
            check_unique(spec, &sortable, pk, view)?;
        }
        batch.put(
            key::scalar_index_key(prefix, &spec.table, &spec.field, &sortable, pk),
            Vec::new(),
        );
    }
    Ok(())
}

fn entry_value(kind: ScalarIndexKind, value: Option<Value>) -> Result<Option<Vec<u8>>> {
    match (kind, value) {
        (ScalarIndexKind::Sparse, None) | (ScalarIndexKind::Sparse, Some(Value::Null)) => Ok(None),
        (_, None) => Ok(Some(key::encode_sortable(&Value::Null)?)),
        (_, Some(v)) => Ok(Some(key::encode_sortable(&v)?)),
    }
}

fn check_unique(
    spec: &ScalarIndexSpec,
    sortable: &[u8],
    pk: &str,
    view: &dyn KvRead,
) -> Result<()> {
    let prefix =
        key::scalar_index_value_prefix(spec.kind.prefix(), &spec.table, &spec.field, sortable);
    for (entry_key, _) in view.scan_prefix(&prefix, 2) {
        let existing = key::index_entry_pk(spec.kind.prefix(), &entry_key)?;
        if existing != pk {
            return Err(ThemisError::unique_violation(
                format!("{}.{}", spec.table, spec.name),
                String::from_utf8_lossy(sortable),
            ));
        }
    }
    Ok(())
}

/// Re-derive a composite index for a document transition.
pub fn apply_composite(
    spec: &CompositeIndexSpec,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    batch: &mut WriteBatch,
) -> Result<()> {
    if let Some(old_doc) = old {
        let tuple = composite_tuple(spec, old_doc)?;
        batch.delete(key::composite_index_key(&spec.table, &spec.name, &tuple, pk));
    }
    if let Some(new_doc) = new {
        let tuple = composite_tuple(spec, new_doc)?;
        batch.put(
            key::composite_index_key(&spec.table, &spec.name, &tuple, pk),
            Vec::new(),
        );
    }
    Ok(())
}

fn composite_tuple(spec: &CompositeIndexSpec, doc: &Value) -> Result<FieldTuple> {
    let values: Vec<Value> = spec
        .fields
        .iter()
        .map(|f| doc.get_path(f).cloned().unwrap_or(Value::Null))
        .collect();
    FieldTuple::encode(&values)
}

/// Re-derive a TTL index for a document transition. Fields that are absent
/// or not integers emit no entry; the row then simply never expires.
pub fn apply_ttl(
    spec: &TtlIndexSpec,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    batch: &mut WriteBatch,
) -> Result<()> {
    if let Some(expire) = ttl_of(old, &spec.field) {
        batch.delete(key::ttl_index_key(&spec.table, expire, pk));
    }
    if let Some(expire) = ttl_of(new, &spec.field) {
        batch.put(key::ttl_index_key(&spec.table, expire, pk), Vec::new());
    }
    Ok(())
}

/// Expire-at of a document under a TTL spec, when present and integral.
pub fn ttl_of(doc: Option<&Value>, field: &str) -> Option<u64> {
    doc.and_then(|d| d.get_path(field))
        .and_then(Value::as_int)
        .and_then(|i| u64::try_from(i).ok())
}

// ============================================================================
// Scans
// ============================================================================

/// One end of a range scan.
#[derive(Debug, Clone, Default)]
pub struct RangeBound {
    /// Bounding value; `None` leaves this end open.
    pub value: Option<Value>,
    /// Whether the bound itself is included.
    pub inclusive: bool,
}

/// A (possibly cursor-resumed) range scan request.
#[derive(Debug, Clone)]
pub struct RangeScan {
    /// Lower end in value order.
    pub start: RangeBound,
    /// Upper end in value order.
    pub end: RangeBound,
    /// Maximum entries returned.
    pub limit: usize,
    /// Descending value order.
    pub reverse: bool,
    /// Resume strictly after this `(value, pk)` anchor, in scan direction.
    pub anchor: Option<(Value, String)>,
}

impl Default for RangeScan {
    fn default() -> Self {
        RangeScan {
            start: RangeBound::default(),
            end: RangeBound::default(),
            limit: usize::MAX,
            reverse: false,
            anchor: None,
        }
    }
}

/// All primary keys holding `value` in an equality-shaped index.
pub fn scan_eq(
    view: &dyn KvRead,
    kind: ScalarIndexKind,
    table: &str,
    field: &str,
    value: &Value,
    limit: usize,
) -> Result<Vec<String>> {
    let sortable = key::encode_sortable(value)?;
    let prefix = key::scalar_index_value_prefix(kind.prefix(), table, field, &sortable);
    view.scan_prefix(&prefix, limit)
        .into_iter()
        .map(|(k, _)| key::index_entry_pk(kind.prefix(), &k))
        .collect()
}

/// Ordered scan of a range index, newest-anchor pagination included.
///
/// Entries come back in `(value, pk)` order, reversed when requested. The
/// anchor resumes strictly past `(value, pk)` in scan direction, which keeps
/// pages stable under concurrent inserts: a row inserted behind the anchor
/// is simply never revisited.
pub fn scan_range(
    view: &dyn KvRead,
    table: &str,
    field: &str,
    scan: &RangeScan,
) -> Result<Vec<IndexEntry>> {
    let kind = ScalarIndexKind::Range;
    let family = kind.prefix();
    let index_prefix = key::scalar_index_prefix(family, table, field);

    let mut low = match &scan.start.value {
        Some(v) => {
            let vp = key::scalar_index_value_prefix(family, table, field, &key::encode_sortable(v)?);
            if scan.start.inclusive {
                vp
            } else {
                key::prefix_end(&vp).unwrap_or_default()
            }
        }
        None => index_prefix.clone(),
    };
    let mut high = match &scan.end.value {
        Some(v) => {
            let vp = key::scalar_index_value_prefix(family, table, field, &key::encode_sortable(v)?);
            if scan.end.inclusive {
                key::prefix_end(&vp)
            } else {
                Some(vp)
            }
        }
        None => key::prefix_end(&index_prefix),
    };

    if let Some((anchor_value, anchor_pk)) = &scan.anchor {
        let anchor_key = key::scalar_index_key(
            family,
            table,
            field,
            &key::encode_sortable(anchor_value)?,
            anchor_pk,
        );
        if scan.reverse {
            // Resume strictly below the anchor.
            high = Some(anchor_key);
        } else {
            // Resume strictly above the anchor.
            let mut after = anchor_key;
            after.push(0);
            low = after;
        }
    }

    let rows = view.scan(&low, high.as_deref(), scan.reverse, scan.limit);
    rows.into_iter()
        .map(|(k, _)| decode_entry(family, &k))
        .collect()
}

/// Scan a composite index by equality prefix. `values` binds the first
/// `values.len()` fields; entries return in tuple order.
pub fn scan_composite_prefix(
    view: &dyn KvRead,
    spec: &CompositeIndexSpec,
    values: &[Value],
    limit: usize,
) -> Result<Vec<IndexEntry>> {
    if values.len() > spec.fields.len() {
        return Err(ThemisError::invalid_query(format!(
            "composite {} binds {} fields, got {}",
            spec.name,
            spec.fields.len(),
            values.len()
        )));
    }
    let tuple = FieldTuple::encode(values)?;
    let prefix = key::composite_index_prefix(&spec.table, &spec.name, &tuple, values.len());
    view.scan_prefix(&prefix, limit)
        .into_iter()
        .map(|(k, _)| decode_entry(KeyPrefix::IdxComposite, &k))
        .collect()
}

/// TTL entries with `expire_at <= now_ms`, oldest first.
pub fn scan_expired(
    view: &dyn KvRead,
    table: &str,
    now_ms: u64,
    limit: usize,
) -> Result<Vec<(u64, String)>> {
    let prefix = key::ttl_index_prefix(table);
    let mut out = Vec::new();
    for (entry_key, _) in view.scan_prefix(&prefix, limit) {
        let rest = entry_key
            .strip_prefix(KeyPrefix::IdxTtl.as_bytes())
            .ok_or_else(|| ThemisError::corruption("ttl key family mismatch"))?;
        let fields = key::split_fields(rest)?;
        if fields.len() != 3 || fields[1].len() != 8 {
            return Err(ThemisError::corruption("ttl key shape"));
        }
        let expire = u64::from_be_bytes(fields[1].as_slice().try_into().unwrap_or([0; 8]));
        if expire > now_ms {
            break;
        }
        let pk = String::from_utf8(fields[2].clone())
            .map_err(|_| ThemisError::corruption("non-utf8 pk in ttl key"))?;
        out.push((expire, pk));
    }
    Ok(out)
}

fn decode_entry(family: KeyPrefix, entry_key: &[u8]) -> Result<IndexEntry> {
    let rest = entry_key
        .strip_prefix(family.as_bytes())
        .ok_or_else(|| ThemisError::corruption("index key family mismatch"))?;
    let mut fields = key::split_fields(rest)?;
    if fields.len() < 3 {
        return Err(ThemisError::corruption("index key shape"));
    }
    let pk_bytes = fields.pop().unwrap_or_default();
    let pk = String::from_utf8(pk_bytes)
        .map_err(|_| ThemisError::corruption("non-utf8 pk in index key"))?;
    // Everything between the two leading name fields and the pk is the
    // value (single field) or tuple remainder (composite).
    let sortable = fields.drain(2..).flatten().collect();
    Ok(IndexEntry { sortable, pk })
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_storage::KvEngine;

    fn range_spec() -> ScalarIndexSpec {
        ScalarIndexSpec {
            name: "age".into(),
            table: "users".into(),
            field: "age".into(),
            kind: ScalarIndexKind::Range,
            unique: false,
        }
    }

    fn commit(engine: &KvEngine, batch: WriteBatch) {
        engine.apply(&batch, engine.committed_seq() + 1);
    }

    fn doc_age(age: i64) -> Value {
        Value::object([("age", Value::from(age))])
    }

    fn seed_ages(engine: &KvEngine, ages: &[(i64, &str)]) {
        let spec = range_spec();
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        for (age, pk) in ages {
            let view = themis_storage::OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_scalar(&spec, pk, None, Some(&doc_age(*age)), &view, &mut staged).unwrap();
            batch.merge(staged);
        }
        commit(engine, batch);
    }

    #[test]
    fn equality_lookup_finds_all_pks() {
        let engine = KvEngine::new();
        let spec = ScalarIndexSpec {
            name: "city".into(),
            table: "hotels".into(),
            field: "city".into(),
            kind: ScalarIndexKind::Equality,
            unique: false,
        };
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        for pk in ["h-1", "h-2"] {
            let doc = Value::object([("city", Value::from("Berlin"))]);
            let view = themis_storage::OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_scalar(&spec, pk, None, Some(&doc), &view, &mut staged).unwrap();
            batch.merge(staged);
        }
        let doc = Value::object([("city", Value::from("Munich"))]);
        {
            let view = themis_storage::OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_scalar(&spec, "h-3", None, Some(&doc), &view, &mut staged).unwrap();
            batch.merge(staged);
        }
        commit(&engine, batch);

        let snap = engine.snapshot();
        let pks = scan_eq(
            &snap,
            ScalarIndexKind::Equality,
            "hotels",
            "city",
            &Value::from("Berlin"),
            usize::MAX,
        )
        .unwrap();
        assert_eq!(pks, vec!["h-1".to_string(), "h-2".to_string()]);
    }

    #[test]
    fn update_moves_entry() {
        let engine = KvEngine::new();
        let spec = range_spec();
        seed_ages(&engine, &[(30, "u-1")]);

        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        {
            let view = themis_storage::OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_scalar(&spec, "u-1", Some(&doc_age(30)), Some(&doc_age(31)), &view, &mut staged)
                .unwrap();
            batch.merge(staged);
        }
        commit(&engine, batch);

        let snap = engine.snapshot();
        assert!(scan_eq(&snap, ScalarIndexKind::Range, "users", "age", &Value::from(30i64), 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            scan_eq(&snap, ScalarIndexKind::Range, "users", "age", &Value::from(31i64), 10)
                .unwrap(),
            vec!["u-1".to_string()]
        );
    }

    #[test]
    fn unique_violation_detected_through_overlay() {
        let engine = KvEngine::new();
        let spec = ScalarIndexSpec {
            name: "email".into(),
            table: "users".into(),
            field: "email".into(),
            kind: ScalarIndexKind::Equality,
            unique: true,
        };
        let doc = Value::object([("email", Value::from("a@b.c"))]);

        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        {
            let view = themis_storage::OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_scalar(&spec, "u-1", None, Some(&doc), &view, &mut staged).unwrap();
            batch.merge(staged);
        }
        // Same value for another pk inside the same transaction.
        let view = themis_storage::OverlayView::new(&snap, &batch);
        let mut staged = WriteBatch::new();
        let err = apply_scalar(&spec, "u-2", None, Some(&doc), &view, &mut staged).unwrap_err();
        assert!(matches!(err, ThemisError::UniqueViolation { .. }));
        // Re-writing the same pk is fine.
        let mut staged = WriteBatch::new();
        apply_scalar(&spec, "u-1", Some(&doc), Some(&doc), &view, &mut staged).unwrap();
    }

    #[test]
    fn sparse_skips_absent_and_null() {
        let engine = KvEngine::new();
        let spec = ScalarIndexSpec {
            name: "nick".into(),
            table: "users".into(),
            field: "nick".into(),
            kind: ScalarIndexKind::Sparse,
            unique: false,
        };
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        let view = themis_storage::OverlayView::new(&snap, &batch);
        let mut staged = WriteBatch::new();
        apply_scalar(&spec, "u-1", None, Some(&Value::empty_object()), &view, &mut staged).unwrap();
        apply_scalar(
            &spec,
            "u-2",
            None,
            Some(&Value::object([("nick", Value::Null)])),
            &view,
            &mut staged,
        )
        .unwrap();
        assert!(staged.is_empty());
        batch.merge(staged);

        // Range index on the same shape indexes Null instead.
        let range = range_spec();
        let view = themis_storage::OverlayView::new(&snap, &batch);
        let mut staged = WriteBatch::new();
        apply_scalar(&range, "u-3", None, Some(&Value::empty_object()), &view, &mut staged).unwrap();
        assert_eq!(staged.len(), 1);
    }

    #[test]
    fn range_scan_bounds_and_order() {
        let engine = KvEngine::new();
        seed_ages(
            &engine,
            &[(10, "a"), (20, "b"), (20, "c"), (30, "d"), (40, "e")],
        );
        let snap = engine.snapshot();

        let entries = scan_range(
            &snap,
            "users",
            "age",
            &RangeScan {
                start: RangeBound { value: Some(Value::from(20i64)), inclusive: true },
                end: RangeBound { value: Some(Value::from(30i64)), inclusive: true },
                ..RangeScan::default()
            },
        )
        .unwrap();
        let pks: Vec<&str> = entries.iter().map(|e| e.pk.as_str()).collect();
        assert_eq!(pks, vec!["b", "c", "d"]);

        let entries = scan_range(
            &snap,
            "users",
            "age",
            &RangeScan {
                start: RangeBound { value: Some(Value::from(20i64)), inclusive: false },
                end: RangeBound { value: None, inclusive: false },
                reverse: true,
                ..RangeScan::default()
            },
        )
        .unwrap();
        let pks: Vec<&str> = entries.iter().map(|e| e.pk.as_str()).collect();
        assert_eq!(pks, vec!["e", "d"]);
    }

    #[test]
    fn anchor_resumes_strictly_after() {
        let engine = KvEngine::new();
        seed_ages(&engine, &[(10, "a"), (20, "b"), (20, "c"), (30, "d")]);
        let snap = engine.snapshot();

        let entries = scan_range(
            &snap,
            "users",
            "age",
            &RangeScan {
                anchor: Some((Value::from(20i64), "b".to_string())),
                ..RangeScan::default()
            },
        )
        .unwrap();
        let pks: Vec<&str> = entries.iter().map(|e| e.pk.as_str()).collect();
        assert_eq!(pks, vec!["c", "d"]);

        // Reverse: strictly before the anchor in value order.
        let entries = scan_range(
            &snap,
            "users",
            "age",
            &RangeScan {
                reverse: true,
                anchor: Some((Value::from(20i64), "b".to_string())),
                ..RangeScan::default()
            },
        )
        .unwrap();
        let pks: Vec<&str> = entries.iter().map(|e| e.pk.as_str()).collect();
        assert_eq!(pks, vec!["a"]);
    }

    #[test]
    fn anchor_past_last_row_returns_empty() {
        let engine = KvEngine::new();
        seed_ages(&engine, &[(10, "a")]);
        let snap = engine.snapshot();
        let entries = scan_range(
            &snap,
            "users",
            "age",
            &RangeScan {
                anchor: Some((Value::from(99i64), "zzz".to_string())),
                ..RangeScan::default()
            },
        )
        .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn composite_prefix_scan() {
        let engine = KvEngine::new();
        let spec = CompositeIndexSpec {
            name: "city_cat".into(),
            table: "hotels".into(),
            fields: vec!["city".into(), "category".into()],
        };
        let mut batch = WriteBatch::new();
        for (pk, city, cat) in [
            ("h-1", "Berlin", "boutique"),
            ("h-2", "Berlin", "hostel"),
            ("h-3", "Munich", "boutique"),
        ] {
            let doc = Value::object([("city", Value::from(city)), ("category", Value::from(cat))]);
            apply_composite(&spec, pk, None, Some(&doc), &mut batch).unwrap();
        }
        commit(&engine, batch);

        let snap = engine.snapshot();
        let berlin =
            scan_composite_prefix(&snap, &spec, &[Value::from("Berlin")], usize::MAX).unwrap();
        let pks: Vec<&str> = berlin.iter().map(|e| e.pk.as_str()).collect();
        assert_eq!(pks, vec!["h-1", "h-2"]);

        let exact = scan_composite_prefix(
            &snap,
            &spec,
            &[Value::from("Berlin"), Value::from("hostel")],
            usize::MAX,
        )
        .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].pk, "h-2");

        assert!(scan_composite_prefix(
            &snap,
            &spec,
            &[Value::from("x"), Value::from("y"), Value::from("z")],
            10
        )
        .is_err());
    }

    #[test]
    fn ttl_entries_and_expiry_scan() {
        let engine = KvEngine::new();
        let spec = TtlIndexSpec {
            name: "expiry".into(),
            table: "sessions".into(),
            field: "expire_at".into(),
        };
        let mut batch = WriteBatch::new();
        for (pk, at) in [("s-1", 100i64), ("s-2", 200), ("s-3", 300)] {
            let doc = Value::object([("expire_at", Value::from(at))]);
            apply_ttl(&spec, pk, None, Some(&doc), &mut batch).unwrap();
        }
        commit(&engine, batch);

        let snap = engine.snapshot();
        let expired = scan_expired(&snap, "sessions", 200, usize::MAX).unwrap();
        assert_eq!(
            expired,
            vec![(100, "s-1".to_string()), (200, "s-2".to_string())]
        );
    }
}
