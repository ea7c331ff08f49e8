//! Blast-radius queries.
//!
//! Answers "which other partitions hold an edge into these partitions",
//! so a caller can schedule re-analysis of dependents. It has to run before
//! the commit that replaces those partitions: afterwards the old nodes are
//! gone and the edges into them are tombstoned along with them.

use std::collections::{BTreeSet, HashSet};

use crate::graph::snapshot::Snapshot;

/// Partitions, other than `partitions` themselves, owning at least one
/// visible edge whose destination is a visible node of `partitions`.
pub fn find_dependents(snapshot: &Snapshot, partitions: &[&str]) -> BTreeSet<String> {
    let targets: HashSet<u128> = snapshot.node_ids_in(partitions.iter().copied());
    if targets.is_empty() {
        return BTreeSet::new();
    }
    let excluded: HashSet<&str> = partitions.iter().copied().collect();

    let dependents: BTreeSet<String> = snapshot
        .shards()
        .filter(|shard| !excluded.contains(shard.partition()))
        .filter(|shard| shard.has_edge_into(&targets))
        .map(|shard| shard.partition().to_string())
        .collect();

    tracing::debug!(
        partitions = partitions.len(),
        targets = targets.len(),
        dependents = dependents.len(),
        "dependent partitions resolved"
    );
    dependents
}
