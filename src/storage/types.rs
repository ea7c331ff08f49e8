//! Segment format types and constants.
//!
//! Defines the binary layout for immutable columnar segments (the atomic
//! building block of storage) and the record types stored in them.

use std::collections::BTreeSet;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::identity::id_from_semantic;

// ── Constants ──────────────────────────────────────────────────────

/// Magic bytes for segment files
pub const SEGMENT_MAGIC: [u8; 4] = *b"CGSG";

/// Format version
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes (fixed, power-of-2, cache-line friendly)
pub const HEADER_SIZE: usize = 32;

/// Footer index magic (ASCII "CGFT")
pub const FOOTER_INDEX_MAGIC: u32 = 0x4347_4654;

/// Footer index size in bytes: 5 * u64 + u32(size) + u32(magic) = 48 bytes
pub const FOOTER_INDEX_SIZE: usize = 48;

/// Bloom filter: bits per key (10 → ~0.82% FPR with k=7)
pub const BLOOM_BITS_PER_KEY: usize = 10;

/// Bloom filter: number of hash functions (optimal for 10 bits/key)
pub const BLOOM_NUM_HASHES: usize = 7;

/// Zone map: max distinct values per field before omitting the field
pub const MAX_ZONE_MAP_VALUES_PER_FIELD: usize = 10_000;

/// Prefix shared by all enrichment partitions.
pub const ENRICHMENT_PREFIX: &str = "__enrichment__/";

// ── Segment Type ───────────────────────────────────────────────────

/// Type of segment (stored as u8 in header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SegmentType {
    Nodes = 0,
    Edges = 1,
}

impl SegmentType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Nodes),
            1 => Some(Self::Edges),
            _ => None,
        }
    }

    /// File name suffix used by the segment store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Edges => "edges",
        }
    }
}

// ── Header ─────────────────────────────────────────────────────────

/// Segment header, exactly 32 bytes on disk.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"CGSG"
/// 4       2     format version: u16 = 1
/// 6       1     segment type: u8
/// 7       1     zero
/// 8       8     record count: u64
/// 16      8     footer offset: u64
/// 24      8     zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_type: SegmentType,
    pub record_count: u64,
    pub footer_offset: u64,
}

impl SegmentHeader {
    pub fn new(segment_type: SegmentType, record_count: u64, footer_offset: u64) -> Self {
        Self {
            segment_type,
            record_count,
            footer_offset,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&SEGMENT_MAGIC);
        out[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[6] = self.segment_type as u8;
        out[8..16].copy_from_slice(&self.record_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.footer_offset.to_le_bytes());
        out
    }

    /// Decode and check the first `HEADER_SIZE` bytes of a segment.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(bytes) = bytes.get(..HEADER_SIZE) else {
            return Err(GraphError::Integrity("File too small for segment header".into()));
        };
        if bytes[0..4] != SEGMENT_MAGIC {
            return Err(GraphError::Integrity(format!(
                "Not a segment file: expected CGSG, got {:?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(GraphError::Integrity(format!("Unsupported segment version: {}", version)));
        }
        let segment_type = SegmentType::from_u8(bytes[6])
            .ok_or_else(|| GraphError::Integrity(format!("Unknown segment type: {}", bytes[6])))?;
        Ok(Self {
            segment_type,
            record_count: le_u64(&bytes[8..]),
            footer_offset: le_u64(&bytes[16..]),
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}

// ── Footer Index ───────────────────────────────────────────────────

/// Section offsets, stored in the last `FOOTER_INDEX_SIZE` bytes of a
/// segment. Offsets are relative to the start of the segment.
///
/// ```text
/// Offset  Size  Field
/// +0      8     bloom: u64         (ids for nodes, src for edges)
/// +8      8     dst bloom: u64     (0 for node segments)
/// +16     8     zone maps: u64
/// +24     8     string table: u64
/// +32     8     end of column data: u64
/// +40     4     footer size: u32 = 48
/// +44     4     magic: u32 = 0x43474654 ("CGFT")
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FooterIndex {
    pub bloom_offset: u64,
    pub dst_bloom_offset: u64,
    pub zone_maps_offset: u64,
    pub string_table_offset: u64,
    pub data_end_offset: u64,
}

impl FooterIndex {
    fn offsets(&self) -> [u64; 5] {
        [
            self.bloom_offset,
            self.dst_bloom_offset,
            self.zone_maps_offset,
            self.string_table_offset,
            self.data_end_offset,
        ]
    }

    pub fn encode(&self) -> [u8; FOOTER_INDEX_SIZE] {
        let mut out = [0u8; FOOTER_INDEX_SIZE];
        for (slot, offset) in out.chunks_exact_mut(8).zip(self.offsets()) {
            slot.copy_from_slice(&offset.to_le_bytes());
        }
        out[40..44].copy_from_slice(&(FOOTER_INDEX_SIZE as u32).to_le_bytes());
        out[44..48].copy_from_slice(&FOOTER_INDEX_MAGIC.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(bytes) = bytes.get(..FOOTER_INDEX_SIZE) else {
            return Err(GraphError::Integrity("Footer index too small".into()));
        };
        if le_u32(&bytes[44..]) != FOOTER_INDEX_MAGIC {
            return Err(GraphError::Integrity("Invalid footer index magic".into()));
        }
        let size = le_u32(&bytes[40..]);
        if size as usize != FOOTER_INDEX_SIZE {
            return Err(GraphError::Integrity(format!("Unexpected footer index size: {}", size)));
        }
        let at = |i: usize| le_u64(&bytes[i * 8..]);
        Ok(Self {
            bloom_offset: at(0),
            dst_bloom_offset: at(1),
            zone_maps_offset: at(2),
            string_table_offset: at(3),
            data_end_offset: at(4),
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}

// ── Record Types ───────────────────────────────────────────────────

/// Node record.
///
/// `semantic_id` is THE identity; `id` is derived from it and is what every
/// index and filter is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// BLAKE3(semantic_id) → u128.
    pub id: u128,
    /// Structural-path identity string (see `identity`).
    pub semantic_id: String,
    /// Node type: "MODULE", "FUNCTION", "http:route", etc.
    pub node_type: String,
    /// Declared name.
    pub name: String,
    /// Owning partition key (file path or virtual context). Immutable.
    pub partition: String,
    /// Content fingerprint. 0 = not computed.
    pub content_hash: u64,
    /// JSON metadata string. "" = no metadata (NOT "{}").
    pub metadata: String,
}

impl NodeRecord {
    pub fn new(semantic_id: &str, node_type: &str, name: &str, partition: &str) -> Self {
        Self {
            id: id_from_semantic(semantic_id),
            semantic_id: semantic_id.to_string(),
            node_type: node_type.to_string(),
            name: name.to_string(),
            partition: partition.to_string(),
            content_hash: 0,
            metadata: String::new(),
        }
    }

    pub fn with_content_hash(mut self, content_hash: u64) -> Self {
        self.content_hash = content_hash;
        self
    }

    pub fn with_metadata(mut self, metadata: &str) -> Self {
        self.metadata = metadata.to_string();
        self
    }

    /// Same identity, same content. Uses the fingerprints when both sides
    /// have one, otherwise compares the payload columns.
    pub fn same_content(&self, other: &NodeRecord) -> bool {
        if self.content_hash != 0 && other.content_hash != 0 {
            return self.content_hash == other.content_hash;
        }
        self.node_type == other.node_type
            && self.name == other.name
            && self.metadata == other.metadata
    }
}

/// Edge identity within a partition: (src, dst, edge_type).
pub type EdgeKey = (u128, u128, String);

/// Edge record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    /// Source node id.
    pub src: u128,
    /// Destination node id.
    pub dst: u128,
    /// Edge type: "CALLS", "CONTAINS", "IMPORTS_FROM", etc.
    pub edge_type: String,
    /// Owning partition key.
    pub partition: String,
    /// JSON metadata string. "" = no metadata.
    pub metadata: String,
}

impl EdgeRecord {
    pub fn new(src: u128, dst: u128, edge_type: &str, partition: &str) -> Self {
        Self {
            src,
            dst,
            edge_type: edge_type.to_string(),
            partition: partition.to_string(),
            metadata: String::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: &str) -> Self {
        self.metadata = metadata.to_string();
        self
    }

    pub fn key(&self) -> EdgeKey {
        (self.src, self.dst, self.edge_type.clone())
    }
}

// ── Segment Metadata ───────────────────────────────────────────────

/// Metadata about a written segment, returned by the writer for use
/// by the manifest.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub record_count: u64,
    pub byte_size: u64,
    pub segment_type: SegmentType,
    pub node_types: BTreeSet<String>,
    pub edge_types: BTreeSet<String>,
}

// ── Commit Delta ──────────────────────────────────────────────────

/// Structured summary returned by a batch commit.
///
/// Callers use the type sets to decide which downstream passes must re-run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitDelta {
    /// Partitions that were committed in this batch.
    pub partitions: Vec<String>,

    /// Nodes that were not visible before the commit.
    pub nodes_added: u64,

    /// Nodes tombstoned and not re-supplied.
    pub nodes_removed: u64,

    /// Nodes re-supplied with different content.
    pub nodes_modified: u64,

    pub edges_added: u64,

    pub edges_removed: u64,

    /// Edges re-supplied with different metadata.
    pub edges_modified: u64,

    /// IDs of removed nodes.
    pub removed_node_ids: Vec<u128>,

    /// Node types of added, removed and modified nodes.
    pub changed_node_types: BTreeSet<String>,

    /// Edge types of added and removed edges.
    pub changed_edge_types: BTreeSet<String>,

    /// Manifest version after this commit.
    pub manifest_version: u64,
}

impl CommitDelta {
    pub fn is_empty(&self) -> bool {
        self.nodes_added == 0
            && self.nodes_removed == 0
            && self.nodes_modified == 0
            && self.edges_added == 0
            && self.edges_removed == 0
            && self.edges_modified == 0
    }
}

// ── Enrichment Partitions ─────────────────────────────────────────

/// Construct the virtual partition key for enrichment data.
///
/// Convention: `__enrichment__/{enricher}/{source_file}`
///
/// An enricher commits its edges under this key, so re-running it replaces
/// only its own output and never the file's structural records.
///
/// # Examples
///
/// ```
/// use cgdb::storage::enrichment_partition;
/// assert_eq!(
///     enrichment_partition("data-flow", "src/utils.js"),
///     "__enrichment__/data-flow/src/utils.js"
/// );
/// ```
pub fn enrichment_partition(enricher: &str, source_file: &str) -> String {
    format!("{}{}/{}", ENRICHMENT_PREFIX, enricher, source_file)
}

/// Whether a partition key is an enrichment context.
pub fn is_enrichment_partition(partition: &str) -> bool {
    partition.starts_with(ENRICHMENT_PREFIX)
}

// ── Helpers ────────────────────────────────────────────────────────

/// Compute padding bytes needed to align `offset` to `alignment`.
/// Padding bytes are always 0x00.
pub fn compute_padding(offset: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return 0;
    }
    let rem = offset % alignment;
    if rem == 0 {
        0
    } else {
        alignment - rem
    }
}

/// Little-endian u32 from a 4-byte slice.
#[inline]
pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Little-endian u64 from an 8-byte slice.
#[inline]
pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Little-endian u128 from a 16-byte slice.
#[inline]
pub(crate) fn le_u128(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[..16]);
    u128::from_le_bytes(buf)
}
