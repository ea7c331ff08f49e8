//! Compaction: fold a partition's segments into one.
//!
//! Each flush adds one node and one edge segment to every partition it
//! touches, and every commit may add tombstone entries. Compaction merges a
//! shard's segments newest-wins, drops the copies its tombstones exclude,
//! and publishes a manifest in which the shard holds a single segment of
//! each kind and no tombstones. Visible contents are unchanged, so a diff
//! across a compaction is empty.
//!
//! Partitions are merged in parallel with rayon. Segment ids are allocated
//! up front by the caller, which holds the engine's writer lock and owns
//! manifest publication.

pub mod merge;
pub mod types;

use rayon::prelude::*;

use crate::config::CompactionConfig;
use crate::error::{GraphError, Result};
use crate::storage::manifest::{Manifest, SegmentDescriptor};
use crate::storage::shard::Shard;
use crate::storage::store::SegmentStore;
use crate::storage::types::{SegmentMeta, SegmentType};

pub use merge::{merge_edge_segments, merge_node_segments};
pub use types::{CompactionInfo, CompactionResult};

// ── Policy ──────────────────────────────────────────────────────────

/// True when either segment run of the shard is longer than the threshold.
pub fn should_compact(shard: &Shard, config: &CompactionConfig) -> bool {
    shard.node_segment_count() > config.segment_threshold
        || shard.edge_segment_count() > config.segment_threshold
}

/// Forced compaction still skips shards that are already minimal.
pub fn can_compact(shard: &Shard) -> bool {
    shard.node_segment_count() > 1 || shard.edge_segment_count() > 1 || !shard.tombstones().is_empty()
}

// ── Compact Shard ───────────────────────────────────────────────────

/// Output ids reserved for one shard.
#[derive(Debug, Clone, Copy)]
pub struct CompactionTarget {
    pub node_segment_id: u64,
    pub edge_segment_id: u64,
}

/// A merged shard, written to the store but not yet published.
#[derive(Debug)]
pub struct ShardCompaction {
    pub partition: String,
    pub node_segment: Option<(u64, SegmentMeta)>,
    pub edge_segment: Option<(u64, SegmentMeta)>,
    pub input_segments: Vec<(u64, SegmentType)>,
    pub tombstones_removed: u64,
}

impl ShardCompaction {
    pub fn written_segments(&self) -> impl Iterator<Item = (u64, SegmentType)> + '_ {
        self.node_segment
            .iter()
            .map(|(id, _)| (*id, SegmentType::Nodes))
            .chain(self.edge_segment.iter().map(|(id, _)| (*id, SegmentType::Edges)))
    }
}

/// Merge one shard and write the result to `store`.
///
/// An empty merge result writes no segment for that kind.
pub fn compact_shard(shard: &Shard, store: &SegmentStore, target: CompactionTarget) -> Result<ShardCompaction> {
    let tombstones = shard.tombstones();

    let node_segs: Vec<_> = shard.node_segments_newest_first().collect();
    let edge_segs: Vec<_> = shard.edge_segments_newest_first().collect();
    let mut input_segments: Vec<(u64, SegmentType)> = node_segs
        .iter()
        .map(|(id, _)| (*id, SegmentType::Nodes))
        .chain(edge_segs.iter().map(|(id, _)| (*id, SegmentType::Edges)))
        .collect();
    input_segments.sort();

    let merged_nodes = merge_node_segments(&node_segs, tombstones);
    let merged_edges = merge_edge_segments(&edge_segs, tombstones);

    let mut written = ShardCompaction {
        partition: shard.partition().to_string(),
        node_segment: None,
        edge_segment: None,
        input_segments,
        tombstones_removed: (tombstones.node_count() + tombstones.edge_count()) as u64,
    };

    if !merged_nodes.is_empty() {
        let meta = store.write_nodes(target.node_segment_id, merged_nodes)?;
        written.node_segment = Some((target.node_segment_id, meta));
    }
    if !merged_edges.is_empty() {
        match store.write_edges(target.edge_segment_id, merged_edges) {
            Ok(meta) => written.edge_segment = Some((target.edge_segment_id, meta)),
            Err(e) => {
                discard(store, written.written_segments());
                return Err(e);
            }
        }
    }
    Ok(written)
}

/// Compact several shards in parallel. On any failure every segment
/// written by this call is removed again and the first error is returned.
pub fn compact_shards(
    jobs: Vec<(&Shard, CompactionTarget)>,
    store: &SegmentStore,
) -> Result<Vec<ShardCompaction>> {
    let results: Vec<Result<ShardCompaction>> = jobs
        .into_par_iter()
        .map(|(shard, target)| compact_shard(shard, store, target))
        .collect();

    let mut done = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(c) => done.push(c),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        for c in &done {
            discard(store, c.written_segments());
        }
        return Err(GraphError::Compaction(e.to_string()));
    }
    store.sync()?;
    Ok(done)
}

/// Replace the shard's segments and tombstones in a draft manifest.
pub fn apply_to_manifest(manifest: &mut Manifest, compaction: &ShardCompaction) {
    let inputs = compaction.input_segments.iter().map(|(id, _)| *id).collect();
    manifest.remove_segments(&compaction.partition, &inputs);
    if let Some(shard) = manifest.shards.get_mut(&compaction.partition) {
        shard.node_tombstones.clear();
        shard.edge_tombstones.clear();
    }
    if let Some((id, meta)) = &compaction.node_segment {
        manifest.add_segment(SegmentDescriptor::from_meta(*id, &compaction.partition, meta.clone()));
    }
    if let Some((id, meta)) = &compaction.edge_segment {
        manifest.add_segment(SegmentDescriptor::from_meta(*id, &compaction.partition, meta.clone()));
    }
}

pub(crate) fn discard(store: &SegmentStore, segments: impl Iterator<Item = (u64, SegmentType)>) {
    for (id, kind) in segments {
        if let Err(e) = store.remove(id, kind) {
            tracing::warn!(segment = id, error = %e, "failed to remove unpublished segment");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
