//! Segment writers.
//!
//! `NodeSegmentWriter` and `EdgeSegmentWriter` collect records for one
//! partition and serialize them into an immutable columnar segment with its
//! bloom filters, zone map and string table. Records are sorted by key
//! before writing so readers can binary search; if the same key is added
//! twice, the last one wins.

use std::collections::BTreeSet;
use std::io::{Seek, SeekFrom, Write};

use crate::error::{GraphError, Result};
use crate::identity::id_from_semantic;
use crate::storage::bloom::BloomFilter;
use crate::storage::string_table::StringTableBuilder;
use crate::storage::types::*;
use crate::storage::zone_map::{
    id_key, ZoneMap, FIELD_EDGE_TYPE, FIELD_ID, FIELD_NAME, FIELD_NODE_TYPE, FIELD_PARTITION,
};

/// Sort by key and keep the most recently added record per key.
fn sort_last_wins<T, K: Ord>(mut records: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    records.reverse();
    records.sort_by(|a, b| key(a).cmp(&key(b)));
    records.dedup_by(|later, earlier| key(later) == key(earlier));
    records
}

fn write_u32s<W: Write>(writer: &mut W, values: &[u32]) -> Result<()> {
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Seek back into the header and record where the footer index lives.
fn patch_footer_offset<W: Write + Seek>(writer: &mut W, start: u64, footer_offset: u64) -> Result<u64> {
    let end = writer.stream_position()?;
    writer.seek(SeekFrom::Start(start + 16))?;
    writer.write_all(&footer_offset.to_le_bytes())?;
    writer.seek(SeekFrom::Start(end))?;
    writer.flush()?;
    Ok(end - start)
}

// ── NodeSegmentWriter ──────────────────────────────────────────────

/// Writer for node segments.
#[derive(Debug, Default)]
pub struct NodeSegmentWriter {
    records: Vec<NodeRecord>,
}

impl NodeSegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Its id must be derived from its semantic id.
    pub fn add(&mut self, record: NodeRecord) -> Result<()> {
        if record.id != id_from_semantic(&record.semantic_id) {
            return Err(GraphError::Protocol(format!(
                "Node id {:032x} does not match semantic id {:?}",
                record.id, record.semantic_id
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize the segment. Offsets in the file are relative to the
    /// writer's position at the time of the call.
    ///
    /// ## Binary layout
    ///
    /// ```text
    /// [Header 32 bytes]
    /// [semantic_id: u32 × N][node_type: u32 × N][name: u32 × N]
    /// [partition: u32 × N][metadata: u32 × N]
    /// [padding to 16-byte boundary]
    /// [id: u128 × N]            // ascending
    /// [content_hash: u64 × N]
    /// [id bloom][zone map][string table]
    /// [footer index 48 bytes]
    /// ```
    pub fn finish<W: Write + Seek>(self, writer: &mut W) -> Result<SegmentMeta> {
        let start = writer.stream_position()?;
        let records = sort_last_wins(self.records, |r| r.id);
        let n = records.len();

        // Step 1: intern strings, collect columns and summaries.
        let mut strings = StringTableBuilder::new();
        let mut str_cols: [Vec<u32>; 5] = Default::default();
        let mut zone_map = ZoneMap::new();
        let mut node_types = BTreeSet::new();

        for r in &records {
            str_cols[0].push(strings.intern(&r.semantic_id)?);
            str_cols[1].push(strings.intern(&r.node_type)?);
            str_cols[2].push(strings.intern(&r.name)?);
            str_cols[3].push(strings.intern(&r.partition)?);
            str_cols[4].push(strings.intern(&r.metadata)?);

            zone_map.add_value(FIELD_NODE_TYPE, &r.node_type);
            zone_map.add_value(FIELD_PARTITION, &r.partition);
            zone_map.extend_range(FIELD_NAME, &r.name);
            zone_map.extend_range(FIELD_ID, &id_key(r.id));
            if !node_types.contains(&r.node_type) {
                node_types.insert(r.node_type.clone());
            }
        }
        let bloom = BloomFilter::from_keys(n, records.iter().map(|r| r.id));

        // Step 2: header with placeholder footer offset.
        SegmentHeader::new(SegmentType::Nodes, n as u64, 0).write_to(writer)?;

        // Step 3: u32 string columns, then zero padding so the u128
        // column is 16-byte aligned.
        for col in &str_cols {
            write_u32s(writer, col)?;
        }
        let padding = compute_padding(HEADER_SIZE + 20 * n, 16);
        writer.write_all(&[0u8; 16][..padding])?;

        // Step 4: fixed-width columns.
        for r in &records {
            writer.write_all(&r.id.to_le_bytes())?;
        }
        for r in &records {
            writer.write_all(&r.content_hash.to_le_bytes())?;
        }
        let data_end_offset = writer.stream_position()? - start;

        // Step 5: footer sections.
        let bloom_offset = writer.stream_position()? - start;
        bloom.write_to(writer)?;
        let zone_maps_offset = writer.stream_position()? - start;
        zone_map.write_to(writer)?;
        let string_table_offset = writer.stream_position()? - start;
        strings.write_to(writer)?;

        // Step 6: footer index, then patch the header.
        let footer_offset = writer.stream_position()? - start;
        FooterIndex {
            bloom_offset,
            dst_bloom_offset: 0,
            zone_maps_offset,
            string_table_offset,
            data_end_offset,
        }
        .write_to(writer)?;
        let byte_size = patch_footer_offset(writer, start, footer_offset)?;

        Ok(SegmentMeta {
            record_count: n as u64,
            byte_size,
            segment_type: SegmentType::Nodes,
            node_types,
            edge_types: BTreeSet::new(),
        })
    }
}

// ── EdgeSegmentWriter ──────────────────────────────────────────────

/// Writer for edge segments.
#[derive(Debug, Default)]
pub struct EdgeSegmentWriter {
    records: Vec<EdgeRecord>,
}

impl EdgeSegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: EdgeRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// ## Binary layout
    ///
    /// ```text
    /// [Header 32 bytes]
    /// [src: u128 × N][dst: u128 × N]   // sorted by (src, dst, edge_type)
    /// [edge_type: u32 × N][partition: u32 × N][metadata: u32 × N]
    /// [src bloom][dst bloom][zone map][string table]
    /// [footer index 48 bytes]
    /// ```
    pub fn finish<W: Write + Seek>(self, writer: &mut W) -> Result<SegmentMeta> {
        let start = writer.stream_position()?;
        let records = sort_last_wins(self.records, |r| r.key());
        let n = records.len();

        let mut strings = StringTableBuilder::new();
        let mut str_cols: [Vec<u32>; 3] = Default::default();
        let mut zone_map = ZoneMap::new();
        let mut edge_types = BTreeSet::new();

        for r in &records {
            str_cols[0].push(strings.intern(&r.edge_type)?);
            str_cols[1].push(strings.intern(&r.partition)?);
            str_cols[2].push(strings.intern(&r.metadata)?);
            zone_map.add_value(FIELD_EDGE_TYPE, &r.edge_type);
            zone_map.add_value(FIELD_PARTITION, &r.partition);
            if !edge_types.contains(&r.edge_type) {
                edge_types.insert(r.edge_type.clone());
            }
        }
        let src_bloom = BloomFilter::from_keys(n, records.iter().map(|r| r.src));
        let dst_bloom = BloomFilter::from_keys(n, records.iter().map(|r| r.dst));

        SegmentHeader::new(SegmentType::Edges, n as u64, 0).write_to(writer)?;

        // 32 + 32N keeps the u32 section aligned without padding.
        for r in &records {
            writer.write_all(&r.src.to_le_bytes())?;
        }
        for r in &records {
            writer.write_all(&r.dst.to_le_bytes())?;
        }
        for col in &str_cols {
            write_u32s(writer, col)?;
        }
        let data_end_offset = writer.stream_position()? - start;

        let bloom_offset = writer.stream_position()? - start;
        src_bloom.write_to(writer)?;
        let dst_bloom_offset = writer.stream_position()? - start;
        dst_bloom.write_to(writer)?;
        let zone_maps_offset = writer.stream_position()? - start;
        zone_map.write_to(writer)?;
        let string_table_offset = writer.stream_position()? - start;
        strings.write_to(writer)?;

        let footer_offset = writer.stream_position()? - start;
        FooterIndex {
            bloom_offset,
            dst_bloom_offset,
            zone_maps_offset,
            string_table_offset,
            data_end_offset,
        }
        .write_to(writer)?;
        let byte_size = patch_footer_offset(writer, start, footer_offset)?;

        Ok(SegmentMeta {
            record_count: n as u64,
            byte_size,
            segment_type: SegmentType::Edges,
            node_types: BTreeSet::new(),
            edge_types,
        })
    }
}

/// Encode a node segment into memory.
pub fn encode_nodes<I: IntoIterator<Item = NodeRecord>>(records: I) -> Result<(Vec<u8>, SegmentMeta)> {
    let mut w = NodeSegmentWriter::new();
    for r in records {
        w.add(r)?;
    }
    let mut buf = std::io::Cursor::new(Vec::new());
    let meta = w.finish(&mut buf)?;
    Ok((buf.into_inner(), meta))
}

/// Encode an edge segment into memory.
pub fn encode_edges<I: IntoIterator<Item = EdgeRecord>>(records: I) -> Result<(Vec<u8>, SegmentMeta)> {
    let mut w = EdgeSegmentWriter::new();
    for r in records {
        w.add(r);
    }
    let mut buf = std::io::Cursor::new(Vec::new());
    let meta = w.finish(&mut buf)?;
    Ok((buf.into_inner(), meta))
}

// ── Tests ──────────────────────────────────────────────────────────
