//! Engine configuration.
//!
//! Loaded from a JSON file that lives outside the database directory; every
//! field has a default so partial files are fine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How hard the engine works to make writes survive power loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// fsync segment files, manifests, the pointer file and their directories.
    #[default]
    Strict,
    /// Skip fsync. Rename ordering is kept, so a process crash is still
    /// safe; an OS crash may lose the latest commits.
    Relaxed,
}

/// When and how partitions get compacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// A partition with more segments than this (of one kind) is compacted.
    pub segment_threshold: usize,
    /// Schedule compaction in the background after each commit.
    pub auto_compact: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            segment_threshold: 4,
            auto_compact: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub durability: DurabilityMode,
    pub compaction: CompactionConfig,
    /// Reclaim unreferenced segments right after a compaction publishes.
    pub reclaim_after_compaction: bool,
}

impl EngineConfig {
    /// Relaxed durability, no auto compaction. For tests and benches.
    pub fn relaxed() -> Self {
        Self {
            durability: DurabilityMode::Relaxed,
            compaction: CompactionConfig {
                auto_compact: false,
                ..CompactionConfig::default()
            },
            reclaim_after_compaction: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_strict() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.durability, DurabilityMode::Strict);
        assert_eq!(cfg.compaction.segment_threshold, 4);
        assert!(cfg.compaction.auto_compact);
        assert!(!cfg.reclaim_after_compaction);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cgdb.json");
        std::fs::write(&path, r#"{"durability":"relaxed","compaction":{"segment_threshold":8}}"#).unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.durability, DurabilityMode::Relaxed);
        assert_eq!(cfg.compaction.segment_threshold, 8);
        assert!(cfg.compaction.auto_compact);
    }

    #[test]
    fn test_malformed_file_is_json_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cgdb.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
