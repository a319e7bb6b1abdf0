//! Planner statistics.
//!
//! Selectivity estimates come from bounded probes against the live
//! keyspace: a capped count under the entity prefix for table cardinality
//! and a capped count under a composite equality prefix for the matched
//! rows. Probes are cheap (they stop at the cap) and honest (they read the
//! same snapshot the query will), so there is no separate statistics
//! refresh to go stale.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use themis_core::key::{self, FieldTuple};
use themis_core::{Result, Value};
use themis_index::CompositeIndexSpec;
use themis_storage::KvEngine;

/// Probe cap for table cardinality.
const ROWS_CAP: usize = 100_000;
/// Probe cap for prefix matches.
const PREFIX_CAP: usize = 10_000;
/// Reuse a cached row count while the commit sequence moved less than this.
const ROWS_STALE_SEQS: u64 = 64;

/// Cached, probe-based statistics.
#[derive(Default)]
pub struct StatsCache {
    rows: Mutex<FxHashMap<String, (u64, usize)>>,
}

impl StatsCache {
    /// Approximate row count of a table (exact up to the probe cap).
    pub fn table_rows(&self, engine: &KvEngine, seq: u64, table: &str) -> usize {
        {
            let rows = self.rows.lock();
            if let Some((cached_seq, count)) = rows.get(table) {
                if seq.saturating_sub(*cached_seq) < ROWS_STALE_SEQS {
                    return *count;
                }
            }
        }
        let count = engine.count_prefix(&key::entity_prefix(table), seq, ROWS_CAP);
        self.rows.lock().insert(table.to_string(), (seq, count));
        count
    }

    /// Rows matching a composite equality prefix (exact up to the cap).
    pub fn composite_prefix_rows(
        &self,
        engine: &KvEngine,
        seq: u64,
        spec: &CompositeIndexSpec,
        values: &[Value],
    ) -> Result<usize> {
        let tuple = FieldTuple::encode(values)?;
        let prefix = key::composite_index_prefix(&spec.table, &spec.name, &tuple, values.len());
        Ok(engine.count_prefix(&prefix, seq, PREFIX_CAP))
    }

    /// Matched-over-total selectivity of a composite equality prefix.
    pub fn composite_selectivity(
        &self,
        engine: &KvEngine,
        seq: u64,
        spec: &CompositeIndexSpec,
        values: &[Value],
    ) -> Result<f64> {
        let total = self.table_rows(engine, seq, &spec.table).max(1);
        let matched = self.composite_prefix_rows(engine, seq, spec, values)?;
        Ok(matched as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_storage::WriteBatch;

    #[test]
    fn row_count_probe_and_cache() {
        let engine = KvEngine::new();
        let stats = StatsCache::default();
        let mut batch = WriteBatch::new();
        for i in 0..100 {
            batch.put(key::entity_key("users", &format!("u{i:03}")), vec![1]);
        }
        engine.apply(&batch, 1);

        let seq = engine.committed_seq();
        assert_eq!(stats.table_rows(&engine, seq, "users"), 100);
        // Within the staleness window the cached value is reused.
        let mut batch = WriteBatch::new();
        batch.put(key::entity_key("users", "u999"), vec![1]);
        engine.apply(&batch, 2);
        assert_eq!(stats.table_rows(&engine, 2, "users"), 100);
    }

    #[test]
    fn composite_selectivity_probe() {
        let engine = KvEngine::new();
        let stats = StatsCache::default();
        let spec = CompositeIndexSpec {
            name: "city_cat".into(),
            table: "hotels".into(),
            fields: vec!["city".into(), "cat".into()],
        };
        let mut batch = WriteBatch::new();
        for i in 0..200 {
            batch.put(key::entity_key("hotels", &format!("h{i:03}")), vec![1]);
            let city = if i < 10 { "Berlin" } else { "Elsewhere" };
            let tuple =
                FieldTuple::encode(&[Value::from(city), Value::from(i as i64)]).unwrap();
            batch.put(
                key::composite_index_key("hotels", "city_cat", &tuple, &format!("h{i:03}")),
                Vec::new(),
            );
        }
        engine.apply(&batch, 1);

        let seq = engine.committed_seq();
        let s = stats
            .composite_selectivity(&engine, seq, &spec, &[Value::from("Berlin")])
            .unwrap();
        assert!((s - 0.05).abs() < 1e-9, "got {s}");
    }
}
