//! Graph API: engine, batches, snapshots and the queries built on them.

pub mod batch;
mod commit;
pub mod diff;
pub mod engine;
pub mod impact;
pub mod snapshot;
pub mod traversal;
pub mod worker;

pub use batch::Batch;
pub use diff::{DiffSummary, SnapshotDiff};
pub use engine::{EngineStats, GraphEngine, ReclaimResult, SnapshotPin};
pub use snapshot::{Snapshot, SnapshotInfo};
pub use traversal::Direction;
pub use worker::CompactionWorker;

use std::collections::BTreeMap;

use crate::storage::query::{EdgeQuery, NodeQuery, TypePattern};
use crate::storage::types::{EdgeRecord, NodeRecord};

/// Read access shared by the engine, snapshots and pins.
///
/// Implementors answer from one consistent version per call.
pub trait GraphReader {
    fn get_node(&self, id: u128) -> Option<NodeRecord>;

    fn node_exists(&self, id: u128) -> bool {
        self.get_node(id).is_some()
    }

    /// Nodes matching every set field of `query`.
    fn query_nodes(&self, query: &NodeQuery) -> Vec<NodeRecord>;

    fn query_edges(&self, query: &EdgeQuery) -> Vec<EdgeRecord>;

    fn outgoing_edges(&self, id: u128) -> Vec<EdgeRecord> {
        self.query_edges(&EdgeQuery::new().src(id))
    }

    fn incoming_edges(&self, id: u128) -> Vec<EdgeRecord> {
        self.query_edges(&EdgeQuery::new().dst(id))
    }

    fn node_count(&self) -> u64;

    fn edge_count(&self) -> u64;

    /// Visible nodes per type. `types` restricts the result to the listed
    /// types, where `"ns:*"` stands for every type under `ns:`; empty means
    /// every type.
    fn count_nodes_by_type(&self, types: &[String]) -> BTreeMap<String, u64> {
        let query = match types {
            [single] => NodeQuery::new().node_type(single.as_str()),
            _ => NodeQuery::new(),
        };
        count_types(self.query_nodes(&query).into_iter().map(|n| n.node_type), types)
    }

    /// Visible edges per type, filtered like [`count_nodes_by_type`].
    ///
    /// [`count_nodes_by_type`]: GraphReader::count_nodes_by_type
    fn count_edges_by_type(&self, types: &[String]) -> BTreeMap<String, u64> {
        let mut query = EdgeQuery::new();
        if !types.is_empty() && types.iter().all(|t| !t.ends_with('*')) {
            query.edge_types = types.to_vec();
        }
        count_types(self.query_edges(&query).into_iter().map(|e| e.edge_type), types)
    }
}

fn count_types(found: impl Iterator<Item = String>, filter: &[String]) -> BTreeMap<String, u64> {
    let patterns: Vec<TypePattern<'_>> = filter.iter().map(|t| TypePattern::parse(t)).collect();
    let mut counts = BTreeMap::new();
    for t in found {
        if patterns.is_empty() || patterns.iter().any(|p| p.matches(&t)) {
            *counts.entry(t).or_insert(0) += 1;
        }
    }
    counts
}
