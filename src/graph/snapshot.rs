//! Immutable read views.
//!
//! A `Snapshot` is one manifest version plus its opened shards. Readers
//! capture an `Arc<Snapshot>` once per operation and are isolated from every
//! commit published afterwards: manifests and segments are never mutated in
//! place, so nothing a snapshot references can change under it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::GraphReader;
use crate::storage::manifest::{Manifest, ManifestStats};
use crate::storage::query::{EdgeQuery, NodeQuery};
use crate::storage::shard::Shard;
use crate::storage::store::SegmentStore;
use crate::storage::types::{EdgeRecord, NodeRecord};

#[derive(Debug)]
pub struct Snapshot {
    manifest: Arc<Manifest>,
    shards: BTreeMap<String, Arc<Shard>>,
}

impl Snapshot {
    /// Open every shard of `manifest`. Shards whose entry is unchanged
    /// since `previous` are shared; changed shards still reuse the
    /// segments they have in common with it.
    pub fn open(manifest: Arc<Manifest>, store: &SegmentStore, previous: Option<&Snapshot>) -> Result<Self> {
        let mut shards = BTreeMap::new();
        for (partition, entry) in &manifest.shards {
            let prev_shard = previous.and_then(|p| p.shards.get(partition));
            let unchanged = previous
                .and_then(|p| p.manifest.shards.get(partition))
                .is_some_and(|prev_entry| prev_entry == entry);
            let shard = match prev_shard {
                Some(shard) if unchanged => shard.clone(),
                _ => Arc::new(Shard::open(partition, entry, store, prev_shard.map(|s| s.as_ref()))?),
            };
            shards.insert(partition.clone(), shard);
        }
        Ok(Self { manifest, shards })
    }

    /// A view over a manifest with no shards.
    pub(crate) fn empty(manifest: Arc<Manifest>) -> Self {
        debug_assert!(manifest.shards.is_empty());
        Self {
            manifest,
            shards: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.manifest.version
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn stats(&self) -> ManifestStats {
        self.manifest.stats
    }

    pub fn shard(&self, partition: &str) -> Option<&Shard> {
        self.shards.get(partition).map(|s| s.as_ref())
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values().map(|s| s.as_ref())
    }

    pub fn partitions(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    /// Visible copy of `id`, from whichever partition holds it.
    pub fn locate_node(&self, id: u128) -> Option<NodeRecord> {
        self.shards.values().find_map(|shard| shard.get_node(id))
    }

    /// Lazily stream matching nodes, partition by partition.
    pub fn iter_nodes<'a>(&'a self, query: &'a NodeQuery) -> impl Iterator<Item = NodeRecord> + 'a {
        self.shards
            .values()
            .filter(move |shard| query.admits_partition(shard.partition()))
            .flat_map(move |shard| {
                shard.scan_nodes(|zm| query.segment_may_match(zm), move |seg, i| query.matches_row(seg, i))
            })
    }

    /// Lazily stream matching edges. A fixed `src` or `dst` uses the
    /// segment blooms and sort order instead of a scan.
    pub fn iter_edges<'a>(&'a self, query: &'a EdgeQuery) -> Box<dyn Iterator<Item = EdgeRecord> + 'a> {
        let shards = self
            .shards
            .values()
            .filter(move |shard| query.admits_partition(shard.partition()));
        match (query.src, query.dst) {
            (Some(src), _) => Box::new(
                shards
                    .flat_map(move |shard| shard.outgoing(src))
                    .filter(move |e| query.matches(e)),
            ),
            (None, Some(dst)) => Box::new(
                shards
                    .flat_map(move |shard| shard.incoming(dst))
                    .filter(move |e| query.matches(e)),
            ),
            (None, None) => Box::new(shards.flat_map(move |shard| {
                shard.scan_edges(|zm| query.segment_may_match(zm), move |seg, i| query.matches_row(seg, i))
            })),
        }
    }

    /// Ids of every visible node in `partitions`.
    pub fn node_ids_in<'a>(&self, partitions: impl IntoIterator<Item = &'a str>) -> HashSet<u128> {
        partitions
            .into_iter()
            .filter_map(|p| self.shard(p))
            .flat_map(|shard| shard.live_node_ids())
            .collect()
    }
}

impl GraphReader for Snapshot {
    fn get_node(&self, id: u128) -> Option<NodeRecord> {
        self.locate_node(id)
    }

    fn query_nodes(&self, query: &NodeQuery) -> Vec<NodeRecord> {
        self.iter_nodes(query).collect()
    }

    fn query_edges(&self, query: &EdgeQuery) -> Vec<EdgeRecord> {
        self.iter_edges(query).collect()
    }

    fn node_count(&self) -> u64 {
        self.manifest.stats.total_nodes
    }

    fn edge_count(&self) -> u64 {
        self.manifest.stats.total_edges
    }
}

/// One entry of [`GraphEngine::list_snapshots`](crate::graph::GraphEngine::list_snapshots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub version: u64,
    pub parent_version: Option<u64>,
    pub created_at_ms: u64,
    pub tags: Vec<String>,
    pub total_nodes: u64,
    pub total_edges: u64,
}

impl SnapshotInfo {
    pub(crate) fn from_manifest(manifest: &Manifest, tags: &BTreeMap<String, u64>) -> Self {
        Self {
            version: manifest.version,
            parent_version: manifest.parent_version,
            created_at_ms: manifest.created_at_ms,
            tags: tags
                .iter()
                .filter(|(_, v)| **v == manifest.version)
                .map(|(name, _)| name.clone())
                .collect(),
            total_nodes: manifest.stats.total_nodes,
            total_edges: manifest.stats.total_edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::id_from_semantic;
    use crate::storage::manifest::SegmentDescriptor;

    fn build() -> (SegmentStore, Arc<Manifest>) {
        let store = SegmentStore::memory();
        let mut m = Manifest::initial().successor();
        for (partition, names) in [("a.js", ["a1", "a2"]), ("b.js", ["b1", "b2"])] {
            let id = m.allocate_segment_id();
            let nodes = names
                .iter()
                .map(|n| NodeRecord::new(n, "FUNCTION", n, partition))
                .collect();
            let meta = store.write_nodes(id, nodes).unwrap();
            m.add_segment(SegmentDescriptor::from_meta(id, partition, meta));
        }
        let id = m.allocate_segment_id();
        let meta = store
            .write_edges(id, vec![EdgeRecord::new(id_from_semantic("b1"), id_from_semantic("a1"), "CALLS", "b.js")])
            .unwrap();
        m.add_segment(SegmentDescriptor::from_meta(id, "b.js", meta));
        (store, Arc::new(m))
    }

    #[test]
    fn test_queries_fan_out_and_prune() {
        let (store, m) = build();
        let snap = Snapshot::open(m, &store, None).unwrap();

        assert_eq!(snap.query_nodes(&NodeQuery::new()).len(), 4);
        assert_eq!(snap.query_nodes(&NodeQuery::new().partition("a.js")).len(), 2);
        assert_eq!(snap.query_nodes(&NodeQuery::new().name("b2")).len(), 1);
        assert_eq!(snap.get_node(id_from_semantic("a2")).unwrap().partition, "a.js");

        let calls = snap.query_edges(&EdgeQuery::new().dst(id_from_semantic("a1")));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].partition, "b.js");
        assert!(snap.query_edges(&EdgeQuery::new().partition("a.js")).is_empty());
        assert_eq!(snap.query_edges(&EdgeQuery::new().edge_type("CALLS")).len(), 1);
    }

    #[test]
    fn test_unchanged_shards_are_shared() {
        let (store, m) = build();
        let first = Snapshot::open(m.clone(), &store, None).unwrap();
        let mut next = m.successor();
        next.tags.insert("t".into(), m.version);
        let second = Snapshot::open(Arc::new(next), &store, Some(&first)).unwrap();
        assert!(Arc::ptr_eq(&first.shards["a.js"], &second.shards["a.js"]));
        assert_eq!(second.node_ids_in(["a.js", "missing"]).len(), 2);
    }

    #[test]
    fn test_snapshot_info_collects_tags() {
        let (_, m) = build();
        let tags = BTreeMap::from([("release".to_string(), m.version), ("old".to_string(), 1)]);
        let info = SnapshotInfo::from_manifest(&m, &tags);
        assert_eq!(info.tags, vec!["release".to_string()]);
        assert_eq!(info.parent_version, Some(1));
    }
}
