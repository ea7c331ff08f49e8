//! Snapshot-to-snapshot deltas.
//!
//! Compares the visible record sets of two versions partition by partition.
//! Partitions whose shard entries are identical in both manifests cannot
//! differ and are skipped without touching their segments, so the cost
//! follows the size of the change rather than the size of the graph.
//!
//! Node identity is global, so nodes are matched across every changed
//! partition at once: a node that moved between partitions is modified, not
//! removed and re-added. Edge identity is per partition.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::graph::snapshot::Snapshot;
use crate::storage::shard::Shard;
use crate::storage::types::{EdgeKey, EdgeRecord, NodeRecord};

/// Records added, removed or modified going from `from_version` to
/// `to_version`. Modified entries carry the `to_version` copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    pub from_version: u64,
    pub to_version: u64,
    pub added_nodes: Vec<NodeRecord>,
    pub removed_nodes: Vec<NodeRecord>,
    pub modified_nodes: Vec<NodeRecord>,
    pub added_edges: Vec<EdgeRecord>,
    pub removed_edges: Vec<EdgeRecord>,
    pub modified_edges: Vec<EdgeRecord>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.modified_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
            && self.modified_edges.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            from_version: self.from_version,
            to_version: self.to_version,
            nodes_added: self.added_nodes.len(),
            nodes_removed: self.removed_nodes.len(),
            nodes_modified: self.modified_nodes.len(),
            edges_added: self.added_edges.len(),
            edges_removed: self.removed_edges.len(),
            edges_modified: self.modified_edges.len(),
        }
    }
}

/// Counts only, for logs and wire replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub from_version: u64,
    pub to_version: u64,
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub nodes_modified: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub edges_modified: usize,
}

pub fn diff(from: &Snapshot, to: &Snapshot) -> SnapshotDiff {
    let mut out = SnapshotDiff {
        from_version: from.version(),
        to_version: to.version(),
        ..Default::default()
    };
    if from.version() == to.version() {
        return out;
    }

    let partitions: BTreeSet<&str> = from.partitions().chain(to.partitions()).collect();
    let mut changed: Vec<&str> = Vec::new();
    let mut skipped = 0usize;
    for p in partitions {
        let before_entry = from.manifest().shards.get(p);
        if before_entry.is_some() && before_entry == to.manifest().shards.get(p) {
            skipped += 1;
            continue;
        }
        changed.push(p);
    }

    diff_nodes(
        changed.iter().filter_map(|p| from.shard(p)),
        changed.iter().filter_map(|p| to.shard(p)),
        &mut out,
    );
    for p in &changed {
        diff_edges(from.shard(p), to.shard(p), &mut out);
    }

    out.added_nodes.sort_by_key(|n| n.id);
    out.removed_nodes.sort_by_key(|n| n.id);
    out.modified_nodes.sort_by_key(|n| n.id);
    for edges in [&mut out.added_edges, &mut out.removed_edges, &mut out.modified_edges] {
        edges.sort_by(|a, b| (&a.partition, a.src, a.dst, &a.edge_type).cmp(&(&b.partition, b.src, b.dst, &b.edge_type)));
    }
    tracing::debug!(
        from = out.from_version,
        to = out.to_version,
        skipped_partitions = skipped,
        "snapshot diff computed"
    );
    out
}

fn diff_nodes<'a>(
    before: impl Iterator<Item = &'a Shard>,
    after: impl Iterator<Item = &'a Shard>,
    out: &mut SnapshotDiff,
) {
    let mut old: HashMap<u128, NodeRecord> = before.flat_map(|s| s.nodes()).map(|n| (n.id, n)).collect();
    for node in after.flat_map(|s| s.nodes()) {
        match old.remove(&node.id) {
            Some(prev) if prev.partition == node.partition && prev.same_content(&node) => {}
            Some(_) => out.modified_nodes.push(node),
            None => out.added_nodes.push(node),
        }
    }
    out.removed_nodes.extend(old.into_values());
}

fn diff_edges(before: Option<&Shard>, after: Option<&Shard>, out: &mut SnapshotDiff) {
    let mut old: HashMap<EdgeKey, EdgeRecord> = before
        .map(|s| s.edges().map(|e| (e.key(), e)).collect())
        .unwrap_or_default();
    if let Some(after) = after {
        for edge in after.edges() {
            match old.remove(&edge.key()) {
                Some(prev) if prev.metadata == edge.metadata => {}
                Some(_) => out.modified_edges.push(edge),
                None => out.added_edges.push(edge),
            }
        }
    }
    out.removed_edges.extend(old.into_values());
}
