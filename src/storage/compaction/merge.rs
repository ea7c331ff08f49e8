//! Merge algorithms for compaction.
//!
//! Merges a shard's segments into a single sorted, deduplicated record list,
//! dropping every copy the shard's tombstones exclude. The output feeds one
//! fresh segment that replaces all inputs.

use std::collections::HashMap;

use crate::storage::shard::TombstoneSet;
use crate::storage::segment::{EdgeSegment, NodeSegment};
use crate::storage::types::{EdgeKey, EdgeRecord, NodeRecord};

/// Merge node segments into one sorted list.
///
/// `segments` must be newest first, each paired with its segment id so
/// the tombstone watermarks can be applied. The first live copy of an id
/// wins.
pub fn merge_node_segments(segments: &[(u64, &NodeSegment)], tombstones: &TombstoneSet) -> Vec<NodeRecord> {
    let mut records: HashMap<u128, NodeRecord> = HashMap::new();
    for &(segment_id, seg) in segments {
        for i in 0..seg.record_count() {
            let id = seg.get_id(i);
            if records.contains_key(&id) || tombstones.node_dead(id, segment_id) {
                continue;
            }
            records.insert(id, seg.get_record(i));
        }
    }
    let mut sorted: Vec<NodeRecord> = records.into_values().collect();
    sorted.sort_by_key(|r| r.id);
    sorted
}

/// Merge edge segments into one list sorted by `(src, dst, edge_type)`.
/// Same ordering contract as [`merge_node_segments`].
pub fn merge_edge_segments(segments: &[(u64, &EdgeSegment)], tombstones: &TombstoneSet) -> Vec<EdgeRecord> {
    let mut records: HashMap<EdgeKey, EdgeRecord> = HashMap::new();
    for &(segment_id, seg) in segments {
        for i in 0..seg.record_count() {
            let (src, dst, edge_type) = (seg.get_src(i), seg.get_dst(i), seg.get_edge_type(i));
            if tombstones.edge_dead(src, dst, edge_type, segment_id) {
                continue;
            }
            records
                .entry((src, dst, edge_type.to_string()))
                .or_insert_with(|| seg.get_record(i));
        }
    }
    let mut sorted: Vec<EdgeRecord> = records.into_values().collect();
    sorted.sort_by(|a, b| {
        a.src
            .cmp(&b.src)
            .then(a.dst.cmp(&b.dst))
            .then_with(|| a.edge_type.cmp(&b.edge_type))
    });
    sorted
}

// ── Tests ──────────────────────────────────────────────────────────
