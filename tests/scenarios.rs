//! End-to-end scenarios over the public facade.

use std::collections::HashSet;
use tempfile::TempDir;
use themisdb::{
    Cursor, Database, DbConfig, DistanceMetric, FieldFilter, FilterOp, GeoPoint, HnswParams,
    IndexDescriptor, Mbr, OrderBy, PlanKind, Query, QueryExt, ScalarIndexKind, ScalarIndexSpec,
    SpatialPredicate, ThemisError, Value, VectorScorer, WalFsync,
};

fn memory_db() -> Database {
    Database::memory(DbConfig::default()).unwrap()
}

/// Scenario 1: hybrid geo + vector over 1000 hotels.
#[test]
fn hybrid_geo_vector_query() {
    let db = memory_db();
    db.create_index(IndexDescriptor::Scalar(ScalarIndexSpec {
        name: "city_eq".into(),
        table: "hotels".into(),
        field: "city".into(),
        kind: ScalarIndexKind::Equality,
        unique: false,
    }))
    .unwrap();
    db.create_index(IndexDescriptor::Scalar(ScalarIndexSpec {
        name: "stars_rng".into(),
        table: "hotels".into(),
        field: "stars".into(),
        kind: ScalarIndexKind::Range,
        unique: false,
    }))
    .unwrap();
    db.create_index(IndexDescriptor::Composite(themisdb::CompositeIndexSpec {
        name: "city_category".into(),
        table: "hotels".into(),
        fields: vec!["city".into(), "category".into()],
    }))
    .unwrap();
    db.create_index(IndexDescriptor::Spatial(themisdb::SpatialIndexSpec {
        name: "location_spatial".into(),
        table: "hotels".into(),
        field: "location".into(),
    }))
    .unwrap();
    db.create_index(IndexDescriptor::Vector(themisdb::VectorIndexSpec {
        name: "embedding_hnsw".into(),
        table: "hotels".into(),
        field: "embedding".into(),
        dim: 128,
        metric: DistanceMetric::Cosine,
        params: HnswParams { m: 16, ef_construction: 100, ef_search: 64 },
    }))
    .unwrap();

    // 1000 hotels: 200 in the Berlin bbox, the rest spread far outside it.
    let mut txn = db.begin();
    for i in 0..1000usize {
        let berlin = i % 5 == 0;
        let (city, lon, lat) = if berlin {
            (
                "Berlin",
                13.32 + (i % 20) as f64 * 0.018,
                52.42 + (i % 10) as f64 * 0.017,
            )
        } else {
            ("Elsewhere", -20.0 + (i % 100) as f64 * 0.7, 10.0 + (i % 40) as f64)
        };
        let mut embedding = vec![0.0f32; 128];
        embedding[i % 128] = 1.0;
        embedding[(i + 1) % 128] = 0.5;
        let doc = Value::object([
            ("city", Value::from(city)),
            ("category", Value::from(if i % 2 == 0 { "business" } else { "leisure" })),
            ("stars", Value::from((i % 5 + 1) as i64)),
            (
                "location",
                Value::Array(vec![Value::Float(lon), Value::Float(lat)]),
            ),
            ("embedding", Value::Vector(embedding)),
        ]);
        txn.put("hotels", &format!("h-{i:04}"), doc, false).unwrap();
    }
    txn.commit().unwrap();

    let bbox = Mbr::new(13.3, 52.4, 13.7, 52.6);
    let mut query_vec = vec![0.0f32; 128];
    query_vec[5] = 1.0;
    query_vec[6] = 0.5;

    let mut q = Query::table("hotels");
    q.spatial = Some(SpatialPredicate::WithinBBox {
        field: "location".into(),
        mbr: bbox,
    });
    q.filters.push(FieldFilter {
        field: "city".into(),
        op: FilterOp::Eq,
        value: Value::from("Berlin"),
    });
    q.vector = Some(VectorScorer {
        field: "embedding".into(),
        query: query_vec,
        k: 10,
        ef_search: None,
    });
    q.limit = Some(10);

    let result = db.query(q).unwrap();
    assert_eq!(result.plan, PlanKind::SpatialFirst);
    assert_eq!(result.rows.len(), 10);
    for row in &result.rows {
        assert_eq!(row.value.get_path("city").and_then(Value::as_str), Some("Berlin"));
        let loc = row.value.get_path("location").and_then(Value::as_array).unwrap();
        let (lon, lat) = (loc[0].as_float().unwrap(), loc[1].as_float().unwrap());
        assert!(bbox.contains_point(&GeoPoint::new(lon, lat)));
    }
    let scores: Vec<f32> = result.rows.iter().map(|r| r.score.unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "cosine descending");
    // The exact-match hotel (i = 5 pattern) ranks first.
    assert!(scores[0] > 0.9);
}

/// Scenario 2: two concurrent writers on one key; the second committer
/// fails with Conflict.
#[test]
fn write_conflict_second_committer_loses() {
    let db = memory_db();
    let mut setup = db.begin();
    setup
        .put("user", "42", Value::object([("balance", Value::from(100i64))]), false)
        .unwrap();
    setup.commit().unwrap();

    let mut a = db.begin();
    let mut b = db.begin();
    let read_a = a.get("user", "42").unwrap().unwrap();
    let read_b = b.get("user", "42").unwrap().unwrap();
    assert_eq!(read_a.get_path("balance"), Some(&Value::Int(100)));
    assert_eq!(read_b.get_path("balance"), Some(&Value::Int(100)));

    a.put("user", "42", Value::object([("balance", Value::from(90i64))]), true)
        .unwrap();
    b.put("user", "42", Value::object([("balance", Value::from(110i64))]), true)
        .unwrap();

    a.commit().unwrap();
    let err = b.commit().unwrap_err();
    assert!(matches!(err, ThemisError::Conflict { .. }));
}

/// Scenario 3: checkpoint, more writes, restore; the restored state holds
/// exactly the first batch and sequences continue past the checkpoint's.
#[test]
fn checkpoint_restore_scenario() {
    let dir = TempDir::new().unwrap();
    let config = DbConfig {
        wal_fsync: WalFsync::Off,
        ..DbConfig::default()
    };
    let db = Database::open(dir.path().join("db"), config.clone()).unwrap();

    for chunk in 0..10 {
        let mut txn = db.begin();
        for i in 0..1000 {
            let n = chunk * 1000 + i;
            txn.put(
                "items",
                &format!("i-{n:05}"),
                Value::object([("n", Value::from(n as i64))]),
                false,
            )
            .unwrap();
        }
        txn.commit().unwrap();
    }
    let checkpoint = db.checkpoint().unwrap();
    let highest_before = db.engine().committed_seq();

    for chunk in 0..5 {
        let mut txn = db.begin();
        for i in 0..1000 {
            let n = 10_000 + chunk * 1000 + i;
            txn.put(
                "items",
                &format!("i-{n:05}"),
                Value::object([("n", Value::from(n as i64))]),
                false,
            )
            .unwrap();
        }
        txn.commit().unwrap();
    }
    assert_eq!(db.scan("items", None, None, usize::MAX).unwrap().len(), 15_000);

    let restored = Database::restore(
        &checkpoint,
        &dir.path().join("restored"),
        config,
        Some(highest_before),
    )
    .unwrap();
    let rows = restored.scan("items", None, None, usize::MAX).unwrap();
    assert_eq!(rows.len(), 10_000);
    // pk order, exactly the first 10k.
    assert_eq!(rows.first().unwrap().0, "i-00000");
    assert_eq!(rows.last().unwrap().0, "i-09999");

    let mut txn = restored.begin();
    txn.put("items", "next", Value::empty_object(), false).unwrap();
    let seq = txn.commit().unwrap();
    assert_eq!(seq, highest_before + 1);
}

/// Scenario 4: BM25 ranking over three docs; only the two quick-bearing
/// docs return.
#[test]
fn fulltext_bm25_scenario() {
    let db = memory_db();
    db.create_index(IndexDescriptor::FullText(themisdb::FullTextSpec {
        name: "bio_ft".into(),
        table: "people".into(),
        field: "bio".into(),
    }))
    .unwrap();

    let mut txn = db.begin();
    for (pk, bio) in [
        ("p-1", "quick brown fox"),
        ("p-2", "quick fox jumps"),
        ("p-3", "lazy dog"),
    ] {
        txn.put("people", pk, Value::object([("bio", Value::from(bio))]), false)
            .unwrap();
    }
    txn.commit().unwrap();

    let hits = db.search_text("people", "bio", "quick fox", 10).unwrap();
    let pks: Vec<&str> = hits.iter().map(|h| h.pk.as_str()).collect();
    assert_eq!(pks.len(), 2);
    assert!(pks.contains(&"p-1") && pks.contains(&"p-2"));
    assert!(!pks.contains(&"p-3"));
    assert!(hits[0].score >= hits[1].score);

    // Determinism: same query, same order.
    let again = db.search_text("people", "bio", "quick fox", 10).unwrap();
    assert_eq!(hits, again);
}

/// Scenario 5: cursor pagination stays stable under a concurrent insert
/// behind the anchor.
#[test]
fn cursor_pagination_under_concurrent_insert() {
    let db = memory_db();
    db.create_index(IndexDescriptor::Scalar(ScalarIndexSpec {
        name: "age_rng".into(),
        table: "people".into(),
        field: "age".into(),
        kind: ScalarIndexKind::Range,
        unique: false,
    }))
    .unwrap();

    let mut txn = db.begin();
    for age in 0..100i64 {
        txn.put(
            "people",
            &format!("p-{age:03}"),
            Value::object([("age", Value::from(age))]),
            false,
        )
        .unwrap();
    }
    txn.commit().unwrap();

    let mut pages: Vec<Vec<String>> = Vec::new();
    let mut cursor: Option<Cursor> = None;
    for page_no in 0..10 {
        if page_no == 3 {
            // Concurrent insert behind the anchor.
            let mut txn = db.begin();
            txn.put(
                "people",
                "p-new",
                Value::object([("age", Value::from(5i64))]),
                false,
            )
            .unwrap();
            txn.commit().unwrap();
        }
        let mut q = Query::table("people");
        q.order_by = Some(OrderBy::Column { field: "age".into(), descending: false });
        q.limit = Some(10);
        q.cursor = cursor.clone();
        let result = db.query(q).unwrap();
        assert_eq!(result.rows.len(), 10, "page {page_no}");
        cursor = result.next_cursor.clone();
        pages.push(result.rows.iter().map(|r| r.pk.clone()).collect());
    }

    let mut seen = HashSet::new();
    for page in &pages {
        for pk in page {
            assert!(seen.insert(pk.clone()), "duplicate {pk}");
        }
    }
    assert_eq!(seen.len(), 100);
    // The row inserted behind the anchor never appears before it: pages
    // past page 3 only carry ages >= 30.
    for page in &pages[3..] {
        assert!(!page.contains(&"p-new".to_string()));
    }
}

/// Scenario 6: shortest path with a geo circle; edges with an endpoint
/// outside the circle are untraversable.
#[test]
fn graph_shortest_path_with_geo_filter() {
    let db = memory_db();
    let cities = [
        ("berlin", 13.405, 52.52),
        ("potsdam", 13.06, 52.40),
        ("leipzig", 12.37, 51.34),
        ("munich", 11.58, 48.14),
    ];
    let mut txn = db.begin();
    for (pk, lon, lat) in cities {
        txn.put(
            "cities",
            pk,
            Value::object([(
                "location",
                Value::Array(vec![Value::Float(lon), Value::Float(lat)]),
            )]),
            false,
        )
        .unwrap();
    }
    for (from, to, km) in [
        ("berlin", "potsdam", 36.0),
        ("potsdam", "leipzig", 120.0),
        ("leipzig", "munich", 360.0),
        ("berlin", "munich", 600.0),
    ] {
        txn.add_edge(
            "roads",
            from,
            to,
            &format!("{from}-{to}"),
            "road",
            Value::object([("distance", Value::Float(km))]),
        )
        .unwrap();
    }
    txn.commit().unwrap();

    // Unfiltered: the cheaper detour wins.
    let path = db
        .graph_shortest_path("roads", "berlin", "munich", "distance", "cities", "location", None)
        .unwrap();
    assert_eq!(path.vertices, vec!["berlin", "potsdam", "leipzig", "munich"]);
    assert!((path.total_weight - 516.0).abs() < 1e-9);

    // A 50km circle around Berlin keeps only berlin and potsdam inside;
    // munich is unreachable.
    let err = db
        .graph_shortest_path(
            "roads",
            "berlin",
            "munich",
            "distance",
            "cities",
            "location",
            Some((GeoPoint::new(13.4, 52.5), 50_000.0)),
        )
        .unwrap_err();
    assert!(matches!(err, ThemisError::NotFound { .. }));

    // Within the circle, paths still resolve.
    let local = db
        .graph_shortest_path(
            "roads",
            "berlin",
            "potsdam",
            "distance",
            "cities",
            "location",
            Some((GeoPoint::new(13.4, 52.5), 50_000.0)),
        )
        .unwrap();
    assert_eq!(local.vertices, vec!["berlin", "potsdam"]);
}
