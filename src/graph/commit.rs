//! The batched commit: compute tombstones, flush, publish.
//!
//! Runs under the engine's writer lock against the snapshot current at the
//! time the lock was taken. Nothing becomes visible until the new manifest
//! is published, and any failure before that removes the segments this
//! commit wrote, leaving the prior version authoritative.
//!
//! Replacement is expressed with watermark tombstones: every identity
//! excluded by this commit is excluded below the id of the first segment
//! the commit writes, so fresh copies of re-supplied records stay visible.
//! Every visible copy of a re-supplied identity is excluded too, which
//! keeps at most one live copy of any identity per partition.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::graph::snapshot::Snapshot;
use crate::storage::compaction::discard;
use crate::storage::manifest::{ManifestStore, SegmentDescriptor};
use crate::storage::store::SegmentStore;
use crate::storage::types::{CommitDelta, EdgeKey, EdgeRecord, NodeRecord, SegmentType};
use crate::storage::write_buffer::WriteBuffer;

/// What a successful commit produced. `snapshot` is `None` when nothing
/// visible changed and no manifest was published.
pub(crate) struct CommitOutcome {
    pub delta: CommitDelta,
    pub snapshot: Option<Arc<Snapshot>>,
}

pub(crate) fn commit(
    snapshot: &Snapshot,
    store: &SegmentStore,
    manifests: &ManifestStore,
    mut buffer: WriteBuffer,
    partitions: &[&str],
    protected_types: &[&str],
) -> Result<CommitOutcome> {
    let listed: BTreeSet<&str> = partitions.iter().copied().collect();
    let protected: HashSet<&str> = protected_types.iter().copied().collect();

    let mut node_tombs: BTreeMap<String, BTreeSet<u128>> = BTreeMap::new();
    let mut edge_tombs: BTreeMap<String, HashMap<EdgeKey, EdgeRecord>> = BTreeMap::new();
    let mut prior_nodes: HashMap<u128, NodeRecord> = HashMap::new();

    // ── Phase 1: Visible records of the committed partitions ──
    // Every edge goes. Nodes go unless their type is protected; a protected
    // node that is re-supplied still loses its old copy.
    for &p in &listed {
        let Some(shard) = snapshot.shard(p) else {
            continue;
        };
        for node in shard.nodes() {
            if protected.contains(node.node_type.as_str()) && buffer.get_node(node.id).is_none() {
                continue;
            }
            node_tombs.entry(p.to_string()).or_default().insert(node.id);
            prior_nodes.insert(node.id, node);
        }
        let edges = edge_tombs.entry(p.to_string()).or_default();
        for edge in shard.edges() {
            edges.insert(edge.key(), edge);
        }
    }

    // ── Phase 2: Re-supplied nodes ──
    let mut delta = CommitDelta {
        partitions: listed.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    };
    // Records whose fingerprint matches but whose stored fields differ are
    // not counted as modified, yet must still be written.
    let mut rewritten = 0usize;
    for node in buffer.nodes() {
        let prior = match prior_nodes.get(&node.id) {
            Some(prior) => Some(prior.clone()),
            None => snapshot.locate_node(node.id),
        };
        let Some(prior) = prior else {
            delta.nodes_added += 1;
            delta.changed_node_types.insert(node.node_type.clone());
            continue;
        };
        let leaving_old_partition = node_tombs
            .get(&prior.partition)
            .is_some_and(|ids| ids.contains(&node.id));
        if prior.partition != node.partition && !leaving_old_partition {
            return Err(GraphError::Protocol(format!(
                "node {} ({}) belongs to partition {}, not {}",
                node.semantic_id, node.id, prior.partition, node.partition
            )));
        }
        node_tombs.entry(prior.partition.clone()).or_default().insert(node.id);
        if !node.same_content(&prior) || prior.partition != node.partition {
            delta.nodes_modified += 1;
            delta.changed_node_types.insert(prior.node_type.clone());
            delta.changed_node_types.insert(node.node_type.clone());
        } else if *node != prior {
            rewritten += 1;
        }
        prior_nodes.insert(node.id, prior);
    }

    let destroyed: HashSet<u128> = node_tombs
        .values()
        .flatten()
        .copied()
        .filter(|id| buffer.get_node(*id).is_none())
        .collect();
    let mut removed_ids: Vec<u128> = destroyed.iter().copied().collect();
    removed_ids.sort_unstable();
    for id in &removed_ids {
        if let Some(prior) = prior_nodes.get(id) {
            delta.changed_node_types.insert(prior.node_type.clone());
        }
    }
    delta.nodes_removed = removed_ids.len() as u64;
    delta.removed_node_ids = removed_ids;

    // ── Phase 3: Edges ──
    // Edges elsewhere that touch a destroyed node go with it, staged ones
    // included; re-supplied edges in partitions outside the commit replace
    // their old copy.
    if !destroyed.is_empty() {
        let dropped = buffer.retain_edges(|e| !destroyed.contains(&e.src) && !destroyed.contains(&e.dst));
        if dropped > 0 {
            tracing::debug!(dropped, "staged edges touching removed nodes discarded");
        }
    }
    if !destroyed.is_empty() {
        for shard in snapshot.shards() {
            if listed.contains(shard.partition()) {
                continue;
            }
            let touching = shard.edges_touching(&destroyed);
            if touching.is_empty() {
                continue;
            }
            let edges = edge_tombs.entry(shard.partition().to_string()).or_default();
            for edge in touching {
                edges.insert(edge.key(), edge);
            }
        }
    }
    for edge in buffer.edges() {
        if listed.contains(edge.partition.as_str()) {
            continue;
        }
        if let Some(old) = snapshot
            .shard(&edge.partition)
            .and_then(|s| s.get_edge(edge.src, edge.dst, &edge.edge_type))
        {
            edge_tombs
                .entry(edge.partition.clone())
                .or_default()
                .insert(old.key(), old);
        }
    }

    let mut resupplied: HashSet<(&str, EdgeKey)> = HashSet::new();
    for edge in buffer.edges() {
        let key = edge.key();
        match edge_tombs.get(&edge.partition).and_then(|m| m.get(&key)) {
            Some(old) if old.metadata == edge.metadata => {}
            Some(_) => {
                delta.edges_modified += 1;
                delta.changed_edge_types.insert(edge.edge_type.clone());
            }
            None => {
                delta.edges_added += 1;
                delta.changed_edge_types.insert(edge.edge_type.clone());
            }
        }
        resupplied.insert((edge.partition.as_str(), key));
    }
    for (p, edges) in &edge_tombs {
        for (key, old) in edges {
            if !resupplied.contains(&(p.as_str(), key.clone())) {
                delta.edges_removed += 1;
                delta.changed_edge_types.insert(old.edge_type.clone());
            }
        }
    }
    drop(resupplied);

    let current = snapshot.manifest();
    if delta.is_empty() && rewritten == 0 {
        delta.manifest_version = current.version;
        tracing::debug!(version = current.version, "commit changed nothing; no manifest published");
        return Ok(CommitOutcome { delta, snapshot: None });
    }

    // ── Phase 4: Flush ──
    let mut draft = current.successor();
    let watermark = draft.next_segment_id;
    let mut written: Vec<(u64, SegmentType)> = Vec::new();

    let flushed = (|| -> Result<()> {
        for (partition, records) in buffer.drain_by_partition() {
            if !records.nodes.is_empty() {
                let id = draft.allocate_segment_id();
                let meta = store.write_nodes(id, records.nodes)?;
                written.push((id, SegmentType::Nodes));
                draft.add_segment(SegmentDescriptor::from_meta(id, &partition, meta));
            }
            if !records.edges.is_empty() {
                let id = draft.allocate_segment_id();
                let meta = store.write_edges(id, records.edges)?;
                written.push((id, SegmentType::Edges));
                draft.add_segment(SegmentDescriptor::from_meta(id, &partition, meta));
            }
        }
        store.sync()
    })();
    if let Err(e) = flushed {
        discard(store, written.into_iter());
        return Err(e);
    }

    // ── Phase 5: Tombstones and totals ──
    for (partition, ids) in &node_tombs {
        draft
            .shards
            .entry(partition.clone())
            .or_default()
            .add_node_tombstones(ids.iter().copied(), watermark);
    }
    for (partition, edges) in &edge_tombs {
        if edges.is_empty() {
            continue;
        }
        draft
            .shards
            .entry(partition.clone())
            .or_default()
            .add_edge_tombstones(edges.keys(), watermark);
    }
    draft.prune_empty_shards();
    draft.stats.total_nodes = (current.stats.total_nodes + delta.nodes_added).saturating_sub(delta.nodes_removed);
    draft.stats.total_edges = (current.stats.total_edges + delta.edges_added).saturating_sub(delta.edges_removed);
    delta.manifest_version = draft.version;

    // ── Phase 6: Publish ──
    // The read view is opened before the pointer moves so a failure here
    // still leaves the prior version current.
    let published = Snapshot::open(Arc::new(draft.clone()), store, Some(snapshot))
        .and_then(|snap| manifests.publish(draft).map(|_| snap));
    let new_snapshot = match published {
        Ok(snap) => Arc::new(snap),
        Err(e) => {
            discard(store, written.into_iter());
            return Err(e);
        }
    };

    tracing::info!(
        version = delta.manifest_version,
        partitions = delta.partitions.len(),
        nodes_added = delta.nodes_added,
        nodes_removed = delta.nodes_removed,
        nodes_modified = delta.nodes_modified,
        nodes_rewritten = rewritten,
        edges_added = delta.edges_added,
        edges_removed = delta.edges_removed,
        segments = written.len(),
        "commit published"
    );
    Ok(CommitOutcome {
        delta,
        snapshot: Some(new_snapshot),
    })
}
