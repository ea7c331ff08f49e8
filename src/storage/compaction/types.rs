//! Compaction results and the summary recorded in the manifest.

use serde::{Deserialize, Serialize};

/// Result of one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    /// Partitions whose segments were merged
    pub partitions_compacted: Vec<String>,
    /// Node records written to merged segments
    pub nodes_merged: u64,
    /// Edge records written to merged segments
    pub edges_merged: u64,
    /// Tombstone entries dropped from the manifest
    pub tombstones_removed: u64,
    /// Input segments replaced
    pub segments_merged: u64,
    /// Manifest version published, if anything was merged
    pub manifest_version: Option<u64>,
    pub duration_ms: u64,
}

impl CompactionResult {
    pub fn is_noop(&self) -> bool {
        self.partitions_compacted.is_empty()
    }
}

/// Compaction metadata stored in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionInfo {
    /// Manifest version the compaction published
    pub manifest_version: u64,
    /// Unix epoch ms
    pub timestamp_ms: u64,
    pub segments_merged: u32,
    pub partitions: u32,
}
