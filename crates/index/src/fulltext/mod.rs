//! Full-text inverted index with BM25 ranking.
//!
//! Per indexed field:
//! - postings `idx:ft:<table><field><term><pk> -> term_freq (u32)`
//! - doc lengths `idx:ftd:<table><field><pk> -> token_count (u32)`
//! - corpus totals `meta:ftstats:<table>.<field> -> (doc_count, total_len)`
//!
//! Scoring is Okapi BM25, `k1 = 1.2`, `b = 0.75`, with
//! `idf = ln((N - df + 0.5) / (df + 0.5) + 1)`. Ranking is a pure function
//! of the posting lists and doc lengths; ties break by pk ascending, so two
//! identical queries against an unchanged index return identical order.

pub mod tokenizer;

use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use themis_core::key;
use themis_core::{Result, ThemisError, Value};
use themis_storage::{KvRead, WriteBatch};

/// BM25 term-frequency saturation.
pub const BM25_K1: f32 = 1.2;
/// BM25 length normalisation.
pub const BM25_B: f32 = 0.75;

/// Descriptor of a full-text index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTextSpec {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Dotted path of the text field.
    pub field: String,
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    /// Primary key.
    pub pk: String,
    /// BM25 score; higher is better.
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct CorpusStats {
    doc_count: u64,
    total_len: u64,
}

fn stats_key(spec: &FullTextSpec) -> Vec<u8> {
    key::meta_key("ftstats", &format!("{}.{}", spec.table, spec.field))
}

fn read_stats(view: &dyn KvRead, spec: &FullTextSpec) -> Result<CorpusStats> {
    match view.get(&stats_key(spec)) {
        Some(bytes) => bincode::deserialize(&bytes).map_err(Into::into),
        None => Ok(CorpusStats::default()),
    }
}

fn term_counts(text: &str) -> FxHashMap<String, u32> {
    let mut counts = FxHashMap::default();
    for term in tokenizer::tokenize(text) {
        *counts.entry(term).or_insert(0u32) += 1;
    }
    counts
}

fn text_of<'v>(doc: Option<&'v Value>, field: &str) -> Option<&'v str> {
    doc.and_then(|d| d.get_path(field)).and_then(Value::as_str)
}

/// Re-derive the inverted index for a document transition `old -> new`.
///
/// Postings and doc-length rows for the old text are deleted, rows for the
/// new text staged, and the corpus totals updated through the transactional
/// view so concurrent staged documents in the same transaction are counted.
pub fn apply_fulltext(
    spec: &FullTextSpec,
    pk: &str,
    old: Option<&Value>,
    new: Option<&Value>,
    view: &dyn KvRead,
    batch: &mut WriteBatch,
) -> Result<()> {
    let old_text = text_of(old, &spec.field);
    let new_text = text_of(new, &spec.field);
    if old_text.is_none() && new_text.is_none() {
        return Ok(());
    }
    let mut stats = read_stats(view, spec)?;

    if let Some(text) = old_text {
        let counts = term_counts(text);
        let len: u32 = counts.values().sum();
        for term in counts.keys() {
            batch.delete(key::ft_posting_key(&spec.table, &spec.field, term, pk));
        }
        batch.delete(key::ft_doc_key(&spec.table, &spec.field, pk));
        stats.doc_count = stats.doc_count.saturating_sub(1);
        stats.total_len = stats.total_len.saturating_sub(len as u64);
    }
    if let Some(text) = new_text {
        let counts = term_counts(text);
        let len: u32 = counts.values().sum();
        for (term, tf) in &counts {
            let mut value = [0u8; 4];
            BigEndian::write_u32(&mut value, *tf);
            batch.put(
                key::ft_posting_key(&spec.table, &spec.field, term, pk),
                value.to_vec(),
            );
        }
        let mut len_bytes = [0u8; 4];
        BigEndian::write_u32(&mut len_bytes, len);
        batch.put(
            key::ft_doc_key(&spec.table, &spec.field, pk),
            len_bytes.to_vec(),
        );
        stats.doc_count += 1;
        stats.total_len += len as u64;
    }
    batch.put(stats_key(spec), bincode::serialize(&stats)?);
    Ok(())
}

/// BM25 top-`limit` search.
///
/// `require_all` demands every query term in a matching document
/// (intersection of posting lists); otherwise any term suffices (union).
/// Results sort by score descending, then pk ascending.
pub fn search(
    view: &dyn KvRead,
    spec: &FullTextSpec,
    query: &str,
    limit: usize,
    require_all: bool,
) -> Result<Vec<TextMatch>> {
    let terms = tokenizer::tokenize_unique(query);
    if terms.is_empty() {
        return Err(ThemisError::invalid_query("full-text query has no terms"));
    }
    let stats = read_stats(view, spec)?;
    if stats.doc_count == 0 {
        return Ok(Vec::new());
    }
    let n = stats.doc_count as f32;
    let avg_len = (stats.total_len as f32 / n).max(1.0);

    // term -> postings (pk -> tf)
    let mut accumulated: FxHashMap<String, (f32, usize)> = FxHashMap::default();
    let term_count = terms.len();
    for term in &terms {
        let prefix = key::ft_term_prefix(&spec.table, &spec.field, term);
        let postings = view.scan_prefix(&prefix, usize::MAX);
        if postings.is_empty() {
            if require_all {
                return Ok(Vec::new());
            }
            continue;
        }
        let df = postings.len() as f32;
        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        for (entry_key, tf_bytes) in postings {
            let pk = key::index_entry_pk(themis_core::key::KeyPrefix::IdxFullText, &entry_key)?;
            if tf_bytes.len() != 4 {
                return Err(ThemisError::corruption("posting value shape"));
            }
            let tf = BigEndian::read_u32(&tf_bytes) as f32;
            let dl = doc_len(view, spec, &pk)? as f32;
            let tf_component =
                (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_len));
            let slot = accumulated.entry(pk).or_insert((0.0, 0));
            slot.0 += idf * tf_component;
            slot.1 += 1;
        }
    }

    let mut hits: Vec<TextMatch> = accumulated
        .into_iter()
        .filter(|(_, (_, matched))| !require_all || *matched == term_count)
        .map(|(pk, (score, _))| TextMatch { pk, score })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pk.cmp(&b.pk))
    });
    hits.truncate(limit);
    Ok(hits)
}

fn doc_len(view: &dyn KvRead, spec: &FullTextSpec, pk: &str) -> Result<u32> {
    let bytes = view
        .get(&key::ft_doc_key(&spec.table, &spec.field, pk))
        .ok_or_else(|| ThemisError::corruption(format!("missing doc length for {pk}")))?;
    if bytes.len() != 4 {
        return Err(ThemisError::corruption("doc length shape"));
    }
    Ok(BigEndian::read_u32(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_storage::{KvEngine, OverlayView};

    fn spec() -> FullTextSpec {
        FullTextSpec {
            name: "bio_ft".into(),
            table: "docs".into(),
            field: "bio".into(),
        }
    }

    fn index_docs(engine: &KvEngine, docs: &[(&str, &str)]) {
        let spec = spec();
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        for (pk, text) in docs {
            let doc = Value::object([("bio", Value::from(*text))]);
            let view = OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_fulltext(&spec, pk, None, Some(&doc), &view, &mut staged).unwrap();
            batch.merge(staged);
        }
        engine.apply(&batch, engine.committed_seq() + 1);
    }

    #[test]
    fn scenario_quick_fox() {
        let engine = KvEngine::new();
        index_docs(
            &engine,
            &[
                ("d-1", "quick brown fox"),
                ("d-2", "quick fox jumps"),
                ("d-3", "lazy dog"),
            ],
        );
        let snap = engine.snapshot();
        let hits = search(&snap, &spec(), "quick fox", 10, true).unwrap();
        let pks: Vec<&str> = hits.iter().map(|h| h.pk.as_str()).collect();
        assert_eq!(pks.len(), 2);
        assert!(pks.contains(&"d-1"));
        assert!(pks.contains(&"d-2"));
        assert!(!pks.contains(&"d-3"));
        // Shorter matching doc scores at least as high under length
        // normalisation with equal tf.
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn ranking_is_stable_across_queries() {
        let engine = KvEngine::new();
        index_docs(
            &engine,
            &[
                ("a", "storage engine with a log structured core"),
                ("b", "the engine of the storage layer"),
                ("c", "unrelated text about gardens"),
            ],
        );
        let snap = engine.snapshot();
        let first = search(&snap, &spec(), "storage engine", 10, true).unwrap();
        let second = search(&snap, &spec(), "storage engine", 10, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rarer_term_scores_higher() {
        let engine = KvEngine::new();
        index_docs(
            &engine,
            &[
                ("common-1", "alpha beta"),
                ("common-2", "alpha gamma"),
                ("common-3", "alpha delta"),
                ("rare", "zeta alpha"),
            ],
        );
        let snap = engine.snapshot();
        // "zeta" appears once in the corpus; it dominates "alpha".
        let hits = search(&snap, &spec(), "zeta", 10, false).unwrap();
        assert_eq!(hits[0].pk, "rare");
        let zeta_score = hits[0].score;
        let alpha_hits = search(&snap, &spec(), "alpha", 10, false).unwrap();
        assert!(zeta_score > alpha_hits[0].score);
    }

    #[test]
    fn delete_removes_postings_and_totals() {
        let engine = KvEngine::new();
        index_docs(&engine, &[("d-1", "quick fox"), ("d-2", "slow fox")]);

        let spec = spec();
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        let doc = Value::object([("bio", Value::from("quick fox"))]);
        {
            let view = OverlayView::new(&snap, &batch);
            let mut staged = WriteBatch::new();
            apply_fulltext(&spec, "d-1", Some(&doc), None, &view, &mut staged).unwrap();
            batch.merge(staged);
        }
        engine.apply(&batch, engine.committed_seq() + 1);

        let snap = engine.snapshot();
        let hits = search(&snap, &spec, "quick", 10, true).unwrap();
        assert!(hits.is_empty());
        let hits = search(&snap, &spec, "fox", 10, true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pk, "d-2");
    }

    #[test]
    fn require_all_vs_any() {
        let engine = KvEngine::new();
        index_docs(&engine, &[("d-1", "quick fox"), ("d-2", "quick dog")]);
        let snap = engine.snapshot();

        let all = search(&snap, &spec(), "quick fox", 10, true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pk, "d-1");

        let any = search(&snap, &spec(), "quick fox", 10, false).unwrap();
        assert_eq!(any.len(), 2);
    }

    #[test]
    fn empty_query_is_invalid() {
        let engine = KvEngine::new();
        let snap = engine.snapshot();
        let err = search(&snap, &spec(), "the of and", 10, true).unwrap_err();
        assert!(matches!(err, ThemisError::InvalidQuery { .. }));
    }

    #[test]
    fn empty_corpus_returns_empty() {
        let engine = KvEngine::new();
        let snap = engine.snapshot();
        assert!(search(&snap, &spec(), "anything", 10, true).unwrap().is_empty());
    }
}
