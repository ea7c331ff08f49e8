//! cgdb: an embedded store for code graphs.
//!
//! Nodes and edges live in immutable columnar segments grouped by
//! partition (usually a source file). Every commit atomically replaces
//! the contents of the partitions it names and publishes a new manifest
//! version; readers hold `Arc<Snapshot>` views and never block writers.
//!
//! ```no_run
//! use cgdb::{EngineConfig, GraphEngine, GraphReader, NodeRecord};
//!
//! # fn main() -> cgdb::Result<()> {
//! let engine = GraphEngine::open_or_create("/tmp/graph.cgdb", EngineConfig::default())?;
//! let mut batch = engine.begin_batch()?;
//! batch.add_node(NodeRecord::new("src/a.js->FUNCTION->main", "FUNCTION", "main", "src/a.js"))?;
//! let delta = batch.commit(&["src/a.js"], &[])?;
//! assert_eq!(delta.nodes_added, 1);
//! assert_eq!(engine.node_count(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database_manager;
pub mod error;
pub mod graph;
pub mod identity;
pub mod metrics;
pub mod session;
pub mod storage;

pub use config::{CompactionConfig, DurabilityMode, EngineConfig};
pub use database_manager::{AccessMode, Database, DatabaseManager};
pub use error::{GraphError, Result};
pub use graph::{
    Batch, EngineStats, GraphEngine, GraphReader, ReclaimResult, Snapshot, SnapshotDiff,
    SnapshotInfo, SnapshotPin,
};
pub use identity::{id_from_semantic, IdentityResolver, StructuralPath};
pub use storage::{CommitDelta, EdgeQuery, EdgeRecord, NodeQuery, NodeRecord};
