//! Snapshots and read views.
//!
//! A `Snapshot` pins a commit sequence and reads the engine as of that
//! sequence from any thread. Scans take the map lock in bounded pages so a
//! long iteration never starves writers.
//!
//! `OverlayView` layers a transaction's pending batch over a snapshot: the
//! transaction's own writes win, its tombstones hide base rows, and scans
//! merge both sides in key order. This is the read-your-writes view handed
//! to the index managers.

use crate::batch::WriteBatch;
use crate::engine::{EngineInner, KvEngine};
use std::sync::Arc;
use themis_core::key::prefix_end;

/// Page size for lock-bounded scan chunks.
const SCAN_PAGE: usize = 1024;

/// Read interface shared by snapshots and transactional overlay views.
pub trait KvRead {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Ordered scan of `[start, end)`, up to `limit` entries. `reverse`
    /// yields descending key order (still within the same bounds).
    fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Ordered scan of every key under `prefix`, up to `limit` entries.
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let end = prefix_end(prefix);
        self.scan(prefix, end.as_deref(), false, limit)
    }
}

/// An immutable view of the engine at one commit sequence.
pub struct Snapshot {
    inner: Arc<EngineInner>,
    seq: u64,
}

impl Snapshot {
    pub(crate) fn new(inner: Arc<EngineInner>, seq: u64) -> Self {
        Snapshot { inner, seq }
    }

    /// The pinned commit sequence.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn scan_page(
        &self,
        cursor: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
        cap: usize,
    ) -> (Vec<(Vec<u8>, Vec<u8>)>, Option<Vec<u8>>) {
        let map = self.inner.map.read();
        let mut out = Vec::new();
        let mut resume = None;

        if !reverse {
            let iter: Box<dyn Iterator<Item = _>> = match end {
                Some(end) => Box::new(map.range(cursor.to_vec()..end.to_vec())),
                None => Box::new(map.range(cursor.to_vec()..)),
            };
            let mut walked = 0;
            for (key, chain) in iter {
                walked += 1;
                if let Some(value) = chain.visible_at(self.seq) {
                    out.push((key.clone(), value.as_ref().clone()));
                }
                if out.len() >= cap || walked >= SCAN_PAGE {
                    // Successor of `key`: the next page starts strictly after it.
                    let mut next = key.clone();
                    next.push(0);
                    resume = Some(next);
                    break;
                }
            }
            (out, resume)
        } else {
            // Reverse pages walk from the top; `cursor` is the exclusive
            // upper bound for continuation pages, empty meaning open-ended.
            let iter: Box<dyn Iterator<Item = _>> = if cursor.is_empty() {
                Box::new(map.range::<Vec<u8>, _>(..).rev())
            } else {
                Box::new(map.range::<Vec<u8>, _>(..cursor.to_vec()).rev())
            };
            let lower = end;
            let mut walked = 0;
            for (key, chain) in iter {
                if let Some(lower) = lower {
                    if key.as_slice() < lower {
                        break;
                    }
                }
                walked += 1;
                if let Some(value) = chain.visible_at(self.seq) {
                    out.push((key.clone(), value.as_ref().clone()));
                }
                if out.len() >= cap || walked >= SCAN_PAGE {
                    resume = Some(key.clone()); // next page scans strictly below
                    break;
                }
            }
            (out, resume)
        }
    }
}

impl KvRead for Snapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let map = self.inner.map.read();
        map.get(key)
            .and_then(|chain| chain.visible_at(self.seq))
            .map(|v| v.as_ref().clone())
    }

    fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        if limit == 0 {
            return out;
        }
        if !reverse {
            let mut cursor = start.to_vec();
            loop {
                let (page, resume) =
                    self.scan_page(&cursor, end, false, limit - out.len());
                out.extend(page);
                match resume {
                    Some(next) if out.len() < limit => cursor = next,
                    _ => break,
                }
            }
        } else {
            // Start paging from the upper bound; the lower bound is `start`.
            let mut cursor = match end {
                Some(end) => end.to_vec(),
                None => Vec::new(), // open top: page from the map's end
            };
            loop {
                let (page, resume) =
                    self.scan_page(&cursor, Some(start), true, limit - out.len());
                out.extend(page);
                match resume {
                    Some(next) if out.len() < limit => cursor = next,
                    _ => break,
                }
            }
        }
        out
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        KvEngine::register_snapshot(&self.inner, self.seq);
        Snapshot {
            inner: Arc::clone(&self.inner),
            seq: self.seq,
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        KvEngine::release_snapshot(&self.inner, self.seq);
    }
}

// ============================================================================
// OverlayView
// ============================================================================

/// A snapshot with a pending write batch layered on top.
pub struct OverlayView<'a> {
    base: &'a Snapshot,
    overlay: &'a WriteBatch,
}

impl<'a> OverlayView<'a> {
    /// Build a read-your-writes view.
    pub fn new(base: &'a Snapshot, overlay: &'a WriteBatch) -> Self {
        OverlayView { base, overlay }
    }

    /// The underlying snapshot.
    pub fn snapshot(&self) -> &Snapshot {
        self.base
    }
}

impl KvRead for OverlayView<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.overlay.get(key) {
            Some(Some(value)) => Some(value.clone()),
            Some(None) => None,
            None => self.base.get(key),
        }
    }

    fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut staged = self.overlay.range_ops(start, end);
        if reverse {
            staged.reverse();
        }
        // Staged tombstones can hide up to `staged.len()` base rows.
        let base_limit = limit.saturating_add(staged.len());
        let base = self.base.scan(start, end, reverse, base_limit);

        let mut out = Vec::with_capacity(limit.min(base.len() + staged.len()));
        let mut bi = base.into_iter().peekable();
        let mut si = staged.into_iter().peekable();
        while out.len() < limit {
            let take_staged = match (bi.peek(), si.peek()) {
                (None, None) => break,
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some((bk, _)), Some((sk, _))) => {
                    if bk == sk {
                        bi.next(); // overlay supersedes the base version
                        true
                    } else if reverse {
                        sk > bk
                    } else {
                        sk < bk
                    }
                }
            };
            if take_staged {
                if let Some((key, op)) = si.next() {
                    if let Some(value) = op {
                        out.push((key, value));
                    }
                }
            } else if let Some(pair) = bi.next() {
                out.push(pair);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KvEngine;

    fn seeded_engine(pairs: &[(&str, &str)]) -> KvEngine {
        let engine = KvEngine::new();
        let mut batch = WriteBatch::new();
        for (k, v) in pairs {
            batch.put(k.as_bytes().to_vec(), v.as_bytes().to_vec());
        }
        engine.apply(&batch, 1);
        engine
    }

    #[test]
    fn scan_forward_and_reverse() {
        let engine = seeded_engine(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let snap = engine.snapshot();

        let fwd = snap.scan(b"b", Some(b"d"), false, usize::MAX);
        assert_eq!(
            fwd.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );

        let rev = snap.scan(b"a", Some(b"d"), true, usize::MAX);
        assert_eq!(
            rev.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
    }

    #[test]
    fn scan_respects_limit() {
        let engine = seeded_engine(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let snap = engine.snapshot();
        assert_eq!(snap.scan(b"a", None, false, 2).len(), 2);
        assert_eq!(snap.scan(b"a", None, true, 1).len(), 1);
    }

    #[test]
    fn scan_pages_across_large_ranges() {
        let engine = KvEngine::new();
        let mut batch = WriteBatch::new();
        for i in 0..(super::SCAN_PAGE * 2 + 10) {
            batch.put(format!("k{i:06}").into_bytes(), vec![1]);
        }
        engine.apply(&batch, 1);
        let snap = engine.snapshot();
        let all = snap.scan_prefix(b"k", usize::MAX);
        assert_eq!(all.len(), super::SCAN_PAGE * 2 + 10);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn empty_range_scan_is_empty() {
        let engine = KvEngine::new();
        let snap = engine.snapshot();
        assert!(snap.scan_prefix(b"anything", usize::MAX).is_empty());
    }

    #[test]
    fn overlay_read_your_writes() {
        let engine = seeded_engine(&[("a", "old"), ("b", "old")]);
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"new".to_vec());
        batch.delete(b"b".to_vec());
        batch.put(b"c".to_vec(), b"staged".to_vec());

        let view = OverlayView::new(&snap, &batch);
        assert_eq!(view.get(b"a"), Some(b"new".to_vec()));
        assert_eq!(view.get(b"b"), None);
        assert_eq!(view.get(b"c"), Some(b"staged".to_vec()));
    }

    #[test]
    fn overlay_scan_merges_in_order() {
        let engine = seeded_engine(&[("a", "1"), ("c", "3"), ("e", "5")]);
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"c".to_vec());
        batch.put(b"f".to_vec(), b"6".to_vec());

        let view = OverlayView::new(&snap, &batch);
        let keys: Vec<_> = view
            .scan(b"a", None, false, usize::MAX)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"e".to_vec(), b"f".to_vec()]
        );

        let rev_keys: Vec<_> = view
            .scan(b"a", None, true, usize::MAX)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            rev_keys,
            vec![b"f".to_vec(), b"e".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
    }

    #[test]
    fn overlay_tombstones_do_not_shrink_limited_scans() {
        let engine = seeded_engine(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let snap = engine.snapshot();
        let mut batch = WriteBatch::new();
        batch.delete(b"a".to_vec());
        batch.delete(b"b".to_vec());

        let view = OverlayView::new(&snap, &batch);
        let rows = view.scan(b"a", None, false, 2);
        let keys: Vec<_> = rows.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"d".to_vec()]);
    }
}
