//! Columnar segment storage.
//!
//! Bottom-up: `types` (layout and records), `bloom`, `zone_map` and
//! `string_table` (segment sections), `writer` and `segment` (encode and
//! validated zero-copy read), `store` (where segment bytes live), `manifest`
//! (versioned shard lists), `shard` (one partition's read view), `query`
//! (predicates) and `compaction`.

pub mod bloom;
pub mod compaction;
pub mod durable;
pub mod manifest;
pub mod query;
pub mod segment;
pub mod shard;
pub mod store;
pub mod string_table;
pub mod types;
pub mod write_buffer;
pub mod writer;
pub mod zone_map;

pub use manifest::{Manifest, ManifestStore, ShardEntry};
pub use query::{EdgeQuery, NodeQuery};
pub use segment::{EdgeSegment, NodeSegment};
pub use shard::Shard;
pub use store::SegmentStore;
pub use types::{
    enrichment_partition, is_enrichment_partition, CommitDelta, EdgeKey, EdgeRecord, NodeRecord,
    SegmentType,
};
