//! Per-partition read view.
//!
//! A shard is the opened form of one manifest `ShardEntry`: the partition's
//! node and edge segments (oldest first) plus its tombstone exclusions. It
//! is immutable; a new manifest version produces a new `Shard` that reuses
//! the already-mapped segments it shares with the old one.
//!
//! Within a shard at most one live copy of any node id or edge key exists:
//! every commit that re-supplies an identity tombstones the older copy.
//! Point reads still walk newest to oldest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::storage::manifest::ShardEntry;
use crate::storage::segment::{EdgeSegment, NodeSegment};
use crate::storage::store::SegmentStore;
use crate::storage::types::{EdgeRecord, NodeRecord};
use crate::storage::zone_map::ZoneMap;

// ── Tombstone Set ────────────────────────────────────────────────────

/// Watermarked exclusions for one partition.
///
/// A copy of an identity stored in segment `s` is dead when the identity
/// has a tombstone with `s < before_segment`. Copies written at or after
/// the watermark are unaffected, which is how re-added records survive.
#[derive(Debug, Default)]
pub struct TombstoneSet {
    nodes: HashMap<u128, u64>,
    edges: HashMap<(u128, u128), Vec<(String, u64)>>,
}

impl TombstoneSet {
    pub fn from_entry(entry: &ShardEntry) -> Self {
        let mut set = Self::default();
        for t in &entry.node_tombstones {
            let w = set.nodes.entry(t.id).or_insert(0);
            *w = (*w).max(t.before_segment);
        }
        for t in &entry.edge_tombstones {
            let slot = set.edges.entry((t.src, t.dst)).or_default();
            match slot.iter_mut().find(|(ty, _)| *ty == t.edge_type) {
                Some((_, w)) => *w = (*w).max(t.before_segment),
                None => slot.push((t.edge_type.clone(), t.before_segment)),
            }
        }
        set
    }

    #[inline]
    pub fn node_dead(&self, id: u128, segment_id: u64) -> bool {
        self.nodes.get(&id).is_some_and(|&before| segment_id < before)
    }

    #[inline]
    pub fn edge_dead(&self, src: u128, dst: u128, edge_type: &str, segment_id: u64) -> bool {
        self.edges
            .get(&(src, dst))
            .and_then(|types| types.iter().find(|(ty, _)| ty == edge_type))
            .is_some_and(|&(_, before)| segment_id < before)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

// ── Shard ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Shard {
    partition: String,
    /// Oldest first.
    node_segments: Vec<(u64, Arc<NodeSegment>)>,
    /// Oldest first.
    edge_segments: Vec<(u64, Arc<EdgeSegment>)>,
    tombstones: TombstoneSet,
}

impl Shard {
    /// Open the segments named by `entry`. Segments already mapped by
    /// `previous` are shared instead of reopened.
    pub fn open(
        partition: &str,
        entry: &ShardEntry,
        store: &SegmentStore,
        previous: Option<&Shard>,
    ) -> Result<Self> {
        let mut node_segments = Vec::with_capacity(entry.node_segments.len());
        for &id in &entry.node_segments {
            let seg = match previous.and_then(|p| p.node_segment(id)) {
                Some(seg) => seg,
                None => store.open_nodes(id)?,
            };
            node_segments.push((id, seg));
        }
        let mut edge_segments = Vec::with_capacity(entry.edge_segments.len());
        for &id in &entry.edge_segments {
            let seg = match previous.and_then(|p| p.edge_segment(id)) {
                Some(seg) => seg,
                None => store.open_edges(id)?,
            };
            edge_segments.push((id, seg));
        }
        Ok(Self {
            partition: partition.to_string(),
            node_segments,
            edge_segments,
            tombstones: TombstoneSet::from_entry(entry),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn tombstones(&self) -> &TombstoneSet {
        &self.tombstones
    }

    fn node_segment(&self, id: u64) -> Option<Arc<NodeSegment>> {
        self.node_segments
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, seg)| seg.clone())
    }

    fn edge_segment(&self, id: u64) -> Option<Arc<EdgeSegment>> {
        self.edge_segments
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, seg)| seg.clone())
    }

    /// Segments newest first, for merging.
    pub fn node_segments_newest_first(&self) -> impl Iterator<Item = (u64, &NodeSegment)> {
        self.node_segments.iter().rev().map(|(id, s)| (*id, s.as_ref()))
    }

    pub fn edge_segments_newest_first(&self) -> impl Iterator<Item = (u64, &EdgeSegment)> {
        self.edge_segments.iter().rev().map(|(id, s)| (*id, s.as_ref()))
    }

    // -- Point lookup ---------------------------------------------------

    /// Newest copy of `id`, unless it is tombstoned.
    pub fn get_node(&self, id: u128) -> Option<NodeRecord> {
        for (sid, seg) in self.node_segments.iter().rev() {
            if let Some(idx) = seg.find(id) {
                if self.tombstones.node_dead(id, *sid) {
                    return None;
                }
                return Some(seg.get_record(idx));
            }
        }
        None
    }

    pub fn contains_node(&self, id: u128) -> bool {
        for (sid, seg) in self.node_segments.iter().rev() {
            if seg.find(id).is_some() {
                return !self.tombstones.node_dead(id, *sid);
            }
        }
        false
    }

    pub fn get_edge(&self, src: u128, dst: u128, edge_type: &str) -> Option<EdgeRecord> {
        for (sid, seg) in self.edge_segments.iter().rev() {
            if let Some(idx) = seg.find(src, dst, edge_type) {
                if self.tombstones.edge_dead(src, dst, edge_type, *sid) {
                    return None;
                }
                return Some(seg.get_record(idx));
            }
        }
        None
    }

    // -- Scans ------------------------------------------------------------

    /// Live nodes of segments whose zone map passes `segment_filter` and
    /// whose columns pass `pred`.
    pub fn scan_nodes<'a, P>(&'a self, segment_filter: impl Fn(&ZoneMap) -> bool, pred: P) -> NodeScan<'a, P>
    where
        P: Fn(&NodeSegment, usize) -> bool,
    {
        let segments = self
            .node_segments
            .iter()
            .rev()
            .filter(|(_, seg)| seg.record_count() > 0 && segment_filter(seg.zone_map()))
            .map(|(id, seg)| (*id, seg.as_ref()))
            .collect();
        NodeScan {
            tombstones: &self.tombstones,
            segments,
            seg_pos: 0,
            rec_pos: 0,
            pred,
        }
    }

    /// All live nodes.
    pub fn nodes(&self) -> impl Iterator<Item = NodeRecord> + '_ {
        self.scan_nodes(|_| true, |_, _| true)
    }

    /// Ids of all live nodes, without materializing records.
    pub fn live_node_ids(&self) -> Vec<u128> {
        let mut out = Vec::new();
        for (sid, seg) in self.node_segments.iter().rev() {
            for i in 0..seg.record_count() {
                let id = seg.get_id(i);
                if !self.tombstones.node_dead(id, *sid) {
                    out.push(id);
                }
            }
        }
        out
    }

    pub fn scan_edges<'a, P>(&'a self, segment_filter: impl Fn(&ZoneMap) -> bool, pred: P) -> EdgeScan<'a, P>
    where
        P: Fn(&EdgeSegment, usize) -> bool,
    {
        let segments = self
            .edge_segments
            .iter()
            .rev()
            .filter(|(_, seg)| seg.record_count() > 0 && segment_filter(seg.zone_map()))
            .map(|(id, seg)| (*id, seg.as_ref()))
            .collect();
        EdgeScan {
            tombstones: &self.tombstones,
            segments,
            seg_pos: 0,
            rec_pos: 0,
            pred,
        }
    }

    pub fn edges(&self) -> impl Iterator<Item = EdgeRecord> + '_ {
        self.scan_edges(|_| true, |_, _| true)
    }

    /// Live edges leaving `src`. Uses the src bloom and the sort order.
    pub fn outgoing(&self, src: u128) -> Vec<EdgeRecord> {
        let mut out = Vec::new();
        for (sid, seg) in self.edge_segments.iter().rev() {
            for i in seg.outgoing(src) {
                if !self.tombstones.edge_dead(src, seg.get_dst(i), seg.get_edge_type(i), *sid) {
                    out.push(seg.get_record(i));
                }
            }
        }
        out
    }

    /// Live edges entering `dst`. Uses the dst bloom.
    pub fn incoming(&self, dst: u128) -> Vec<EdgeRecord> {
        let mut out = Vec::new();
        for (sid, seg) in self.edge_segments.iter().rev() {
            for i in seg.incoming(dst) {
                if !self.tombstones.edge_dead(seg.get_src(i), dst, seg.get_edge_type(i), *sid) {
                    out.push(seg.get_record(i));
                }
            }
        }
        out
    }

    /// Live edges with either endpoint in `ids`. Segments are skipped when
    /// neither bloom admits any of the ids.
    pub fn edges_touching(&self, ids: &HashSet<u128>) -> Vec<EdgeRecord> {
        let mut out = Vec::new();
        if ids.is_empty() {
            return out;
        }
        for (sid, seg) in self.edge_segments.iter().rev() {
            let candidate = ids
                .iter()
                .any(|&id| seg.maybe_contains_src(id) || seg.maybe_contains_dst(id));
            if !candidate {
                continue;
            }
            for i in 0..seg.record_count() {
                let (src, dst) = (seg.get_src(i), seg.get_dst(i));
                if (ids.contains(&src) || ids.contains(&dst))
                    && !self.tombstones.edge_dead(src, dst, seg.get_edge_type(i), *sid)
                {
                    out.push(seg.get_record(i));
                }
            }
        }
        out
    }

    /// Whether any live edge of this shard points into `ids`. Probes the
    /// dst bloom per id first and only scans segments with a hit.
    pub fn has_edge_into(&self, ids: &HashSet<u128>) -> bool {
        for (sid, seg) in self.edge_segments.iter().rev() {
            if !ids.iter().any(|&id| seg.maybe_contains_dst(id)) {
                continue;
            }
            for i in 0..seg.record_count() {
                let dst = seg.get_dst(i);
                if ids.contains(&dst)
                    && !self.tombstones.edge_dead(seg.get_src(i), dst, seg.get_edge_type(i), *sid)
                {
                    return true;
                }
            }
        }
        false
    }

    pub fn node_segment_count(&self) -> usize {
        self.node_segments.len()
    }

    pub fn edge_segment_count(&self) -> usize {
        self.edge_segments.len()
    }
}

// ── Scan iterators ───────────────────────────────────────────────────

/// Lazy scan over live node records, newest segment first.
pub struct NodeScan<'a, P> {
    tombstones: &'a TombstoneSet,
    segments: Vec<(u64, &'a NodeSegment)>,
    seg_pos: usize,
    rec_pos: usize,
    pred: P,
}

impl<P: Fn(&NodeSegment, usize) -> bool> Iterator for NodeScan<'_, P> {
    type Item = NodeRecord;

    fn next(&mut self) -> Option<NodeRecord> {
        loop {
            let &(sid, seg) = self.segments.get(self.seg_pos)?;
            while self.rec_pos < seg.record_count() {
                let i = self.rec_pos;
                self.rec_pos += 1;
                if self.tombstones.node_dead(seg.get_id(i), sid) {
                    continue;
                }
                if (self.pred)(seg, i) {
                    return Some(seg.get_record(i));
                }
            }
            self.seg_pos += 1;
            self.rec_pos = 0;
        }
    }
}

/// Lazy scan over live edge records, newest segment first.
pub struct EdgeScan<'a, P> {
    tombstones: &'a TombstoneSet,
    segments: Vec<(u64, &'a EdgeSegment)>,
    seg_pos: usize,
    rec_pos: usize,
    pred: P,
}

impl<P: Fn(&EdgeSegment, usize) -> bool> Iterator for EdgeScan<'_, P> {
    type Item = EdgeRecord;

    fn next(&mut self) -> Option<EdgeRecord> {
        loop {
            let &(sid, seg) = self.segments.get(self.seg_pos)?;
            while self.rec_pos < seg.record_count() {
                let i = self.rec_pos;
                self.rec_pos += 1;
                if self
                    .tombstones
                    .edge_dead(seg.get_src(i), seg.get_dst(i), seg.get_edge_type(i), sid)
                {
                    continue;
                }
                if (self.pred)(seg, i) {
                    return Some(seg.get_record(i));
                }
            }
            self.seg_pos += 1;
            self.rec_pos = 0;
        }
    }
}
