//! The R*-tree.
//!
//! Bulk of the Beckmann et al. design:
//! - choose-subtree: least overlap enlargement at the level above the
//!   leaves, least area enlargement higher up
//! - split: choose the axis with the smallest margin sum over the legal
//!   distributions, then the distribution with the least overlap (area on
//!   ties)
//! - forced reinsertion: the first overflow on a level during one insertion
//!   evicts the entries farthest from the node centre and re-inserts them,
//!   which re-shapes the tree instead of splitting eagerly; the second
//!   overflow on the same level splits
//!
//! Levels count from the leaves: leaf nodes are level 0. The tree is a
//! plain owned structure; concurrent publication is the manager's job.

use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use themis_core::{GeoPoint, Mbr};

const MAX_ENTRIES: usize = 16;
const MIN_ENTRIES: usize = 6; // 40% fill, per the paper's recommendation
const REINSERT_COUNT: usize = 5; // ~30% of MAX

/// One leaf entry: a rectangle and the primary key it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    /// Minimum bounding rectangle of the stored geometry.
    pub mbr: Mbr,
    /// Primary key.
    pub pk: String,
}

#[derive(Debug, Clone)]
enum Entries {
    Leaf(Vec<LeafEntry>),
    Children(Vec<Node>),
}

#[derive(Debug, Clone)]
struct Node {
    mbr: Mbr,
    entries: Entries,
}

impl Node {
    fn empty_leaf() -> Node {
        Node {
            mbr: Mbr::empty(),
            entries: Entries::Leaf(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match &self.entries {
            Entries::Leaf(v) => v.len(),
            Entries::Children(v) => v.len(),
        }
    }

    fn recompute_mbr(&mut self) {
        let mut mbr = Mbr::empty();
        match &self.entries {
            Entries::Leaf(v) => {
                for e in v {
                    mbr = mbr.union(&e.mbr);
                }
            }
            Entries::Children(v) => {
                for c in v {
                    mbr = mbr.union(&c.mbr);
                }
            }
        }
        self.mbr = mbr;
    }
}

/// Something waiting to be (re-)inserted: a leaf entry (placed in a leaf
/// node at level 0) or a whole subtree tagged with the level of the node
/// that should adopt it (the subtree's own level plus one).
enum Pending {
    Leaf(LeafEntry),
    Subtree(Node, usize),
}

/// The tree.
#[derive(Debug, Clone)]
pub struct RTree {
    root: Node,
    /// Level of the root (leaves are 0).
    height: usize,
    size: usize,
}

impl Default for RTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RTree {
    /// Empty tree.
    pub fn new() -> Self {
        RTree {
            root: Node::empty_leaf(),
            height: 0,
            size: 0,
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Union of every stored rectangle.
    pub fn bounds(&self) -> Mbr {
        self.root.mbr
    }

    /// Insert one entry.
    pub fn insert(&mut self, mbr: Mbr, pk: String) {
        self.size += 1;
        let mut reinserted: FxHashSet<usize> = FxHashSet::default();
        let mut queue: Vec<Pending> = vec![Pending::Leaf(LeafEntry { mbr, pk })];
        while let Some(pending) = queue.pop() {
            let (entry_level, pending) = match pending {
                Pending::Leaf(e) => (0usize, Pending::Leaf(e)),
                Pending::Subtree(n, l) => (l, Pending::Subtree(n, l)),
            };
            let height = self.height;
            let split = Self::insert_rec(
                &mut self.root,
                pending,
                entry_level,
                height,
                &mut reinserted,
                &mut queue,
            );
            if let Some(sibling) = split {
                // Grow the root.
                let old_root = std::mem::replace(&mut self.root, Node::empty_leaf());
                let mut root = Node {
                    mbr: old_root.mbr.union(&sibling.mbr),
                    entries: Entries::Children(vec![old_root, sibling]),
                };
                root.recompute_mbr();
                self.root = root;
                self.height += 1;
            }
        }
    }

    /// Remove the entry `(mbr, pk)`. Returns whether it was present.
    pub fn remove(&mut self, mbr: &Mbr, pk: &str) -> bool {
        let mut orphans: Vec<Pending> = Vec::new();
        let height = self.height;
        let removed = Self::remove_rec(&mut self.root, mbr, pk, height, &mut orphans);
        if !removed {
            return false;
        }
        self.size -= 1;

        // Collapse a childless or single-child root.
        loop {
            match &mut self.root.entries {
                Entries::Children(children) if children.len() == 1 => {
                    if let Some(child) = children.pop() {
                        self.root = child;
                        self.height -= 1;
                    }
                }
                Entries::Children(children) if children.is_empty() => {
                    self.root = Node::empty_leaf();
                    self.height = 0;
                    break;
                }
                _ => break,
            }
        }

        // Reinsert orphaned entries and subtrees.
        let mut reinserted: FxHashSet<usize> = FxHashSet::default();
        let mut queue = orphans;
        while let Some(pending) = queue.pop() {
            let entry_level = match &pending {
                Pending::Leaf(_) => 0,
                Pending::Subtree(_, l) => *l,
            };
            if matches!(&pending, Pending::Subtree(_, l) if *l > self.height) {
                // The subtree is as tall as the whole tree; merge its
                // entries one level down instead.
                if let Pending::Subtree(node, level) = pending {
                    match node.entries {
                        Entries::Leaf(leaves) => {
                            queue.extend(leaves.into_iter().map(Pending::Leaf));
                        }
                        Entries::Children(children) => {
                            queue.extend(
                                children
                                    .into_iter()
                                    .map(|c| Pending::Subtree(c, level - 1)),
                            );
                        }
                    }
                }
                continue;
            }
            let height = self.height;
            let split = Self::insert_rec(
                &mut self.root,
                pending,
                entry_level,
                height,
                &mut reinserted,
                &mut queue,
            );
            if let Some(sibling) = split {
                let old_root = std::mem::replace(&mut self.root, Node::empty_leaf());
                let mut root = Node {
                    mbr: old_root.mbr.union(&sibling.mbr),
                    entries: Entries::Children(vec![old_root, sibling]),
                };
                root.recompute_mbr();
                self.root = root;
                self.height += 1;
            }
        }
        true
    }

    /// All pks whose rectangle intersects `query`.
    pub fn search_intersects(&self, query: &Mbr) -> Vec<String> {
        let mut out = Vec::new();
        if self.size > 0 {
            Self::search_rec(&self.root, query, &mut out);
        }
        out
    }

    /// All entries whose rectangle intersects `query`, rectangles included.
    pub fn search_entries(&self, query: &Mbr) -> Vec<LeafEntry> {
        let mut out = Vec::new();
        if self.size > 0 {
            Self::entries_rec(&self.root, query, &mut out);
        }
        out
    }

    /// The `k` entries nearest to `point` by great-circle distance to their
    /// rectangles (exact for point entries). Best-first branch and bound.
    pub fn nearest_k(&self, point: &GeoPoint, k: usize) -> Vec<(LeafEntry, f64)> {
        #[derive(Debug)]
        enum Item<'t> {
            Node(&'t Node),
            Entry(&'t LeafEntry),
        }
        struct Queued<'t> {
            dist: f64,
            item: Item<'t>,
        }
        impl PartialEq for Queued<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for Queued<'_> {}
        impl PartialOrd for Queued<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Queued<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                // Min-heap: smaller distance first.
                other.dist.total_cmp(&self.dist)
            }
        }

        let mut out = Vec::new();
        if self.size == 0 || k == 0 {
            return out;
        }
        let mut heap = BinaryHeap::new();
        heap.push(Queued {
            dist: self.root.mbr.min_distance_m(point),
            item: Item::Node(&self.root),
        });
        while let Some(Queued { dist, item }) = heap.pop() {
            match item {
                Item::Node(node) => match &node.entries {
                    Entries::Leaf(entries) => {
                        for e in entries {
                            heap.push(Queued {
                                dist: e.mbr.min_distance_m(point),
                                item: Item::Entry(e),
                            });
                        }
                    }
                    Entries::Children(children) => {
                        for c in children {
                            heap.push(Queued {
                                dist: c.mbr.min_distance_m(point),
                                item: Item::Node(c),
                            });
                        }
                    }
                },
                Item::Entry(entry) => {
                    out.push((entry.clone(), dist));
                    if out.len() >= k {
                        break;
                    }
                }
            }
        }
        out
    }

    // ========================================================================
    // Insertion internals
    // ========================================================================

    fn insert_rec(
        node: &mut Node,
        pending: Pending,
        entry_level: usize,
        node_level: usize,
        reinserted: &mut FxHashSet<usize>,
        queue: &mut Vec<Pending>,
    ) -> Option<Node> {
        if node_level == entry_level {
            match (&mut node.entries, pending) {
                (Entries::Leaf(entries), Pending::Leaf(entry)) => {
                    node.mbr = node.mbr.union(&entry.mbr);
                    entries.push(entry);
                }
                (Entries::Children(children), Pending::Subtree(subtree, _)) => {
                    node.mbr = node.mbr.union(&subtree.mbr);
                    children.push(subtree);
                }
                // A subtree landing at leaf level means the tree shrank
                // under it; dissolve into leaf entries.
                (_, Pending::Subtree(subtree, _)) => {
                    let mut leaves = Vec::new();
                    collect_leaves(subtree, &mut leaves);
                    queue.extend(leaves.into_iter().map(Pending::Leaf));
                    return None;
                }
                (Entries::Children(_), Pending::Leaf(entry)) => {
                    // Level accounting went wrong; recover by queueing.
                    queue.push(Pending::Leaf(entry));
                    return None;
                }
            }
        } else {
            let target_mbr = match &pending {
                Pending::Leaf(e) => e.mbr,
                Pending::Subtree(n, _) => n.mbr,
            };
            let children = match &mut node.entries {
                Entries::Children(c) => c,
                Entries::Leaf(_) => {
                    // Cannot descend below a leaf; queue at leaf level.
                    queue.push(pending);
                    return None;
                }
            };
            let idx = choose_subtree(children, &target_mbr, node_level == entry_level + 1);
            let split = Self::insert_rec(
                &mut children[idx],
                pending,
                entry_level,
                node_level - 1,
                reinserted,
                queue,
            );
            if let Some(sibling) = split {
                children.push(sibling);
            }
            node.recompute_mbr();
        }

        if node.len() > MAX_ENTRIES {
            Self::overflow(node, node_level, reinserted, queue)
        } else {
            None
        }
    }

    /// R* overflow treatment: reinsert on the first overflow per level,
    /// split on the second.
    fn overflow(
        node: &mut Node,
        node_level: usize,
        reinserted: &mut FxHashSet<usize>,
        queue: &mut Vec<Pending>,
    ) -> Option<Node> {
        if reinserted.insert(node_level) {
            let center = node.mbr.center();
            match &mut node.entries {
                Entries::Leaf(entries) => {
                    entries.sort_by(|a, b| {
                        let da = a.mbr.center().distance_m(&center);
                        let db = b.mbr.center().distance_m(&center);
                        db.total_cmp(&da)
                    });
                    let evicted: Vec<LeafEntry> = entries.drain(..REINSERT_COUNT).collect();
                    queue.extend(evicted.into_iter().map(Pending::Leaf));
                }
                Entries::Children(children) => {
                    children.sort_by(|a, b| {
                        let da = a.mbr.center().distance_m(&center);
                        let db = b.mbr.center().distance_m(&center);
                        db.total_cmp(&da)
                    });
                    let evicted: Vec<Node> = children.drain(..REINSERT_COUNT).collect();
                    queue.extend(
                        evicted
                            .into_iter()
                            .map(|n| Pending::Subtree(n, node_level)),
                    );
                }
            }
            node.recompute_mbr();
            None
        } else {
            Some(split_node(node))
        }
    }

    // ========================================================================
    // Removal internals
    // ========================================================================

    fn remove_rec(
        node: &mut Node,
        mbr: &Mbr,
        pk: &str,
        node_level: usize,
        orphans: &mut Vec<Pending>,
    ) -> bool {
        match &mut node.entries {
            Entries::Leaf(entries) => {
                let before = entries.len();
                entries.retain(|e| !(e.pk == pk && e.mbr == *mbr));
                if entries.len() == before {
                    return false;
                }
                node.recompute_mbr();
                true
            }
            Entries::Children(children) => {
                let mut removed = false;
                let mut condense: Option<usize> = None;
                for (i, child) in children.iter_mut().enumerate() {
                    if child.mbr.intersects(mbr)
                        && Self::remove_rec(child, mbr, pk, node_level - 1, orphans)
                    {
                        removed = true;
                        if child.len() < MIN_ENTRIES {
                            condense = Some(i);
                        }
                        break;
                    }
                }
                if let Some(i) = condense {
                    let child = children.remove(i);
                    let child_level = node_level - 1;
                    match child.entries {
                        Entries::Leaf(leaves) => {
                            orphans.extend(leaves.into_iter().map(Pending::Leaf));
                        }
                        Entries::Children(grand) => {
                            orphans.extend(
                                grand.into_iter().map(|n| Pending::Subtree(n, child_level)),
                            );
                        }
                    }
                }
                if removed {
                    node.recompute_mbr();
                }
                removed
            }
        }
    }

    // ========================================================================
    // Search internals
    // ========================================================================

    fn search_rec(node: &Node, query: &Mbr, out: &mut Vec<String>) {
        if !node.mbr.intersects(query) {
            return;
        }
        match &node.entries {
            Entries::Leaf(entries) => {
                for e in entries {
                    if e.mbr.intersects(query) {
                        out.push(e.pk.clone());
                    }
                }
            }
            Entries::Children(children) => {
                for c in children {
                    Self::search_rec(c, query, out);
                }
            }
        }
    }

    fn entries_rec(node: &Node, query: &Mbr, out: &mut Vec<LeafEntry>) {
        if !node.mbr.intersects(query) {
            return;
        }
        match &node.entries {
            Entries::Leaf(entries) => {
                for e in entries {
                    if e.mbr.intersects(query) {
                        out.push(e.clone());
                    }
                }
            }
            Entries::Children(children) => {
                for c in children {
                    Self::entries_rec(c, query, out);
                }
            }
        }
    }
}

fn collect_leaves(node: Node, out: &mut Vec<LeafEntry>) {
    match node.entries {
        Entries::Leaf(mut entries) => out.append(&mut entries),
        Entries::Children(children) => {
            for c in children {
                collect_leaves(c, out);
            }
        }
    }
}

/// R* choose-subtree: least overlap enlargement just above the leaves,
/// least area enlargement higher up. Ties fall through to area enlargement,
/// then plain area, then index for determinism.
fn choose_subtree(children: &[Node], target: &Mbr, leaf_parent: bool) -> usize {
    let mut best = 0usize;
    let mut best_key = (f64::INFINITY, f64::INFINITY, f64::INFINITY);
    for (i, child) in children.iter().enumerate() {
        let enlarged = child.mbr.union(target);
        let area_enlargement = enlarged.area() - child.mbr.area();
        let overlap_enlargement = if leaf_parent {
            let mut before = 0.0;
            let mut after = 0.0;
            for (j, other) in children.iter().enumerate() {
                if i == j {
                    continue;
                }
                before += child.mbr.overlap_area(&other.mbr);
                after += enlarged.overlap_area(&other.mbr);
            }
            after - before
        } else {
            0.0
        };
        let key = (overlap_enlargement, area_enlargement, child.mbr.area());
        if key < best_key {
            best_key = key;
            best = i;
        }
    }
    best
}

/// R* split: pick the axis with the smallest margin sum over the legal
/// distributions, then the distribution with minimum overlap (area on ties).
fn split_node(node: &mut Node) -> Node {
    match &mut node.entries {
        Entries::Leaf(entries) => {
            let moved = split_entries(entries, |e| e.mbr);
            let mut sibling = Node {
                mbr: Mbr::empty(),
                entries: Entries::Leaf(moved),
            };
            node.recompute_mbr();
            sibling.recompute_mbr();
            sibling
        }
        Entries::Children(children) => {
            let moved = split_entries(children, |n| n.mbr);
            let mut sibling = Node {
                mbr: Mbr::empty(),
                entries: Entries::Children(moved),
            };
            node.recompute_mbr();
            sibling.recompute_mbr();
            sibling
        }
    }
}

fn split_entries<T: Clone>(entries: &mut Vec<T>, mbr_of: impl Fn(&T) -> Mbr) -> Vec<T> {
    // Evaluate both axes: sort by (min, max) per axis and sum margins over
    // every legal split point.
    let mut best: Option<(f64, f64, usize, Vec<usize>)> = None; // (overlap, area, split_at, order)
    for axis in 0..2 {
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by(|&a, &b| {
            let (ma, mb) = (mbr_of(&entries[a]), mbr_of(&entries[b]));
            let ka = if axis == 0 {
                (ma.min_lon, ma.max_lon)
            } else {
                (ma.min_lat, ma.max_lat)
            };
            let kb = if axis == 0 {
                (mb.min_lon, mb.max_lon)
            } else {
                (mb.min_lat, mb.max_lat)
            };
            ka.partial_cmp(&kb).unwrap_or(Ordering::Equal)
        });

        let mut margin_sum = 0.0;
        let mut axis_best: Option<(f64, f64, usize)> = None;
        for split_at in MIN_ENTRIES..=(entries.len() - MIN_ENTRIES) {
            let mut left = Mbr::empty();
            for &i in &order[..split_at] {
                left = left.union(&mbr_of(&entries[i]));
            }
            let mut right = Mbr::empty();
            for &i in &order[split_at..] {
                right = right.union(&mbr_of(&entries[i]));
            }
            margin_sum += left.margin() + right.margin();
            let overlap = left.overlap_area(&right);
            let area = left.area() + right.area();
            if axis_best.map_or(true, |(o, a, _)| (overlap, area) < (o, a)) {
                axis_best = Some((overlap, area, split_at));
            }
        }
        // Splits only run past MAX_ENTRIES, so at least one legal
        // distribution always exists.
        let (overlap, _area, split_at) = axis_best.unwrap_or((0.0, 0.0, entries.len() / 2));
        // Margin sum picks the axis; carry the axis winner forward.
        match &best {
            Some((best_margin, _, _, _)) if margin_sum >= *best_margin => {}
            _ => best = Some((margin_sum, overlap, split_at, order)),
        }
    }

    let (_, _, split_at, order) = match best {
        Some(b) => b,
        None => (0.0, 0.0, entries.len() / 2, (0..entries.len()).collect()),
    };
    let keep: FxHashSet<usize> = order[..split_at].iter().copied().collect();
    let mut kept = Vec::with_capacity(split_at);
    let mut moved = Vec::with_capacity(entries.len() - split_at);
    for (i, entry) in entries.drain(..).enumerate() {
        if keep.contains(&i) {
            kept.push(entry);
        } else {
            moved.push(entry);
        }
    }
    *entries = kept;
    moved
}
