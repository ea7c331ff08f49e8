//! Segment readers.
//!
//! `NodeSegment` and `EdgeSegment` read immutable columnar segments either
//! from a memory-mapped file or from shared in-memory bytes. Everything a
//! reader will later touch is validated once at open (frame, footer
//! sections, every string reference, key order), so accessors never fail
//! and never copy column data.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{GraphError, Result};
use crate::storage::bloom::BloomView;
use crate::storage::string_table::StringTableView;
use crate::storage::types::*;
use crate::storage::zone_map::ZoneMap;

// ── Backing bytes ──────────────────────────────────────────────────

/// Bytes backing an open segment.
#[derive(Debug)]
pub enum SegmentBytes {
    Mapped(Mmap),
    Shared(Arc<[u8]>),
}

impl SegmentBytes {
    /// Memory-map a segment file read-only.
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < (HEADER_SIZE + FOOTER_INDEX_SIZE) as u64 {
            return Err(GraphError::Integrity(format!(
                "Segment {} is truncated ({} bytes)",
                path.display(),
                len
            )));
        }
        // SAFETY: segment files are immutable once published. They are only
        // removed by reclamation, which never touches a segment referenced by
        // a reachable manifest.
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(SegmentBytes::Mapped(mmap))
    }
}

impl Deref for SegmentBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SegmentBytes::Mapped(m) => m,
            SegmentBytes::Shared(b) => b,
        }
    }
}

// ── Helper Functions ───────────────────────────────────────────────

#[inline]
fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    le_u32(&data[offset..offset + 4])
}

#[inline]
fn read_u64_at(data: &[u8], offset: usize) -> u64 {
    le_u64(&data[offset..offset + 8])
}

#[inline]
fn read_u128_at(data: &[u8], offset: usize) -> u128 {
    le_u128(&data[offset..offset + 16])
}

fn corrupt(msg: impl Into<String>) -> GraphError {
    GraphError::Integrity(msg.into())
}

/// Validate header and footer index against the file size and return them
/// together with the record count.
fn parse_frame(data: &[u8], expected: SegmentType) -> Result<(usize, FooterIndex)> {
    if data.len() < HEADER_SIZE + FOOTER_INDEX_SIZE {
        return Err(corrupt("File too small for segment"));
    }
    let header = SegmentHeader::decode(&data[..HEADER_SIZE])?;
    if header.segment_type != expected {
        return Err(corrupt(format!(
            "Expected {} segment, got {}",
            expected.as_str(),
            header.segment_type.as_str()
        )));
    }
    let fi_start = data.len() - FOOTER_INDEX_SIZE;
    if header.footer_offset != fi_start as u64 {
        return Err(corrupt("footer_offset does not point at footer index"));
    }
    let footer = FooterIndex::decode(&data[fi_start..])?;

    let n = usize::try_from(header.record_count)
        .map_err(|_| corrupt("record_count out of range"))?;
    // cheapest record is 20 bytes of u32 columns + 24 bytes fixed width
    if n > data.len() / 20 {
        return Err(corrupt(format!("record_count {} exceeds file size", n)));
    }

    // Sections are laid out in this order without gaps.
    let ordered = [
        footer.data_end_offset,
        footer.bloom_offset,
        if expected == SegmentType::Edges {
            footer.dst_bloom_offset
        } else {
            footer.bloom_offset
        },
        footer.zone_maps_offset,
        footer.string_table_offset,
        fi_start as u64,
    ];
    if ordered.windows(2).any(|w| w[0] > w[1]) || footer.data_end_offset != footer.bloom_offset {
        return Err(corrupt("Footer sections out of order"));
    }
    if expected == SegmentType::Nodes && footer.dst_bloom_offset != 0 {
        return Err(corrupt("Node segment carries a dst bloom"));
    }
    Ok((n, footer))
}

fn check_refs(data: &[u8], strings: &StringTableView, column: usize, n: usize) -> Result<()> {
    for i in 0..n {
        let idx = read_u32_at(data, column + i * 4);
        if idx >= strings.len() {
            return Err(corrupt(format!(
                "String reference {} out of range at record {}",
                idx, i
            )));
        }
    }
    Ok(())
}

// ── Node Column Offsets ────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct NodeColumns {
    semantic_id: usize,
    node_type: usize,
    name: usize,
    partition: usize,
    metadata: usize,
    ids: usize,
    content_hash: usize,
    end: usize,
}

impl NodeColumns {
    fn for_count(n: usize) -> Self {
        let semantic_id = HEADER_SIZE;
        let node_type = semantic_id + 4 * n;
        let name = node_type + 4 * n;
        let partition = name + 4 * n;
        let metadata = partition + 4 * n;
        let u32_end = metadata + 4 * n;
        let ids = u32_end + compute_padding(u32_end, 16);
        let content_hash = ids + 16 * n;
        Self {
            semantic_id,
            node_type,
            name,
            partition,
            metadata,
            ids,
            content_hash,
            end: content_hash + 8 * n,
        }
    }

    fn string_columns(&self) -> [usize; 5] {
        [self.semantic_id, self.node_type, self.name, self.partition, self.metadata]
    }
}

// ── NodeSegment ────────────────────────────────────────────────────

/// Immutable node segment reader. Records are sorted by id.
#[derive(Debug)]
pub struct NodeSegment {
    data: SegmentBytes,
    record_count: usize,
    cols: NodeColumns,
    bloom: BloomView,
    zone_map: ZoneMap,
    strings: StringTableView,
}

impl NodeSegment {
    /// Open a node segment file (memory-mapped).
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_segment_bytes(SegmentBytes::map_file(path)?)
    }

    /// Open a node segment from shared bytes.
    pub fn from_shared(bytes: Arc<[u8]>) -> Result<Self> {
        Self::from_segment_bytes(SegmentBytes::Shared(bytes))
    }

    fn from_segment_bytes(data: SegmentBytes) -> Result<Self> {
        let (n, footer) = parse_frame(&data, SegmentType::Nodes)?;
        let cols = NodeColumns::for_count(n);
        if footer.data_end_offset != cols.end as u64 {
            return Err(corrupt("data_end_offset does not match column layout"));
        }

        let zm_start = footer.zone_maps_offset as usize;
        let st_start = footer.string_table_offset as usize;
        let fi_start = data.len() - FOOTER_INDEX_SIZE;

        let bloom = BloomView::parse(&data, footer.bloom_offset as usize, zm_start)?;
        let zone_map = ZoneMap::from_bytes(&data[zm_start..st_start])?;
        let strings = StringTableView::parse(&data, st_start, fi_start)?;

        for col in cols.string_columns() {
            check_refs(&data, &strings, col, n)?;
        }
        for i in 1..n {
            if read_u128_at(&data, cols.ids + (i - 1) * 16) >= read_u128_at(&data, cols.ids + i * 16) {
                return Err(corrupt(format!("Node ids not strictly ascending at record {}", i)));
            }
        }

        Ok(Self {
            data,
            record_count: n,
            cols,
            bloom,
            zone_map,
            strings,
        })
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    // ── Column Accessors (O(1)) ────────────────────────────────────

    pub fn get_id(&self, index: usize) -> u128 {
        read_u128_at(&self.data, self.cols.ids + index * 16)
    }

    pub fn get_semantic_id(&self, index: usize) -> &str {
        self.string_at(self.cols.semantic_id, index)
    }

    pub fn get_node_type(&self, index: usize) -> &str {
        self.string_at(self.cols.node_type, index)
    }

    pub fn get_name(&self, index: usize) -> &str {
        self.string_at(self.cols.name, index)
    }

    pub fn get_partition(&self, index: usize) -> &str {
        self.string_at(self.cols.partition, index)
    }

    pub fn get_metadata(&self, index: usize) -> &str {
        self.string_at(self.cols.metadata, index)
    }

    pub fn get_content_hash(&self, index: usize) -> u64 {
        read_u64_at(&self.data, self.cols.content_hash + index * 8)
    }

    /// Materialize a full record (allocates strings).
    pub fn get_record(&self, index: usize) -> NodeRecord {
        NodeRecord {
            id: self.get_id(index),
            semantic_id: self.get_semantic_id(index).to_string(),
            node_type: self.get_node_type(index).to_string(),
            name: self.get_name(index).to_string(),
            partition: self.get_partition(index).to_string(),
            content_hash: self.get_content_hash(index),
            metadata: self.get_metadata(index).to_string(),
        }
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// `false` means the id is definitely absent.
    pub fn maybe_contains(&self, id: u128) -> bool {
        self.bloom.maybe_contains(&self.data, id)
    }

    /// Position of `id`, via bloom check then binary search.
    pub fn find(&self, id: u128) -> Option<usize> {
        if !self.maybe_contains(id) {
            return None;
        }
        let (mut lo, mut hi) = (0, self.record_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.get_id(mid).cmp(&id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    pub fn zone_map(&self) -> &ZoneMap {
        &self.zone_map
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeRecord> + '_ {
        (0..self.record_count).map(move |i| self.get_record(i))
    }

    fn string_at(&self, column: usize, index: usize) -> &str {
        let idx = read_u32_at(&self.data, column + index * 4);
        // refs were range-checked at open
        self.strings.get(&self.data, idx).unwrap_or_default()
    }
}

// ── Edge Column Offsets ────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct EdgeColumns {
    src: usize,
    dst: usize,
    edge_type: usize,
    partition: usize,
    metadata: usize,
    end: usize,
}

impl EdgeColumns {
    fn for_count(n: usize) -> Self {
        let src = HEADER_SIZE;
        let dst = src + 16 * n;
        let edge_type = dst + 16 * n;
        let partition = edge_type + 4 * n;
        let metadata = partition + 4 * n;
        Self {
            src,
            dst,
            edge_type,
            partition,
            metadata,
            end: metadata + 4 * n,
        }
    }
}

// ── EdgeSegment ────────────────────────────────────────────────────

/// Immutable edge segment reader. Records are sorted by
/// `(src, dst, edge_type)`.
#[derive(Debug)]
pub struct EdgeSegment {
    data: SegmentBytes,
    record_count: usize,
    cols: EdgeColumns,
    src_bloom: BloomView,
    dst_bloom: BloomView,
    zone_map: ZoneMap,
    strings: StringTableView,
}

impl EdgeSegment {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_segment_bytes(SegmentBytes::map_file(path)?)
    }

    pub fn from_shared(bytes: Arc<[u8]>) -> Result<Self> {
        Self::from_segment_bytes(SegmentBytes::Shared(bytes))
    }

    fn from_segment_bytes(data: SegmentBytes) -> Result<Self> {
        let (n, footer) = parse_frame(&data, SegmentType::Edges)?;
        let cols = EdgeColumns::for_count(n);
        if footer.data_end_offset != cols.end as u64 {
            return Err(corrupt("data_end_offset does not match column layout"));
        }

        let zm_start = footer.zone_maps_offset as usize;
        let st_start = footer.string_table_offset as usize;
        let fi_start = data.len() - FOOTER_INDEX_SIZE;

        let src_bloom = BloomView::parse(&data, footer.bloom_offset as usize, footer.dst_bloom_offset as usize)?;
        let dst_bloom = BloomView::parse(&data, footer.dst_bloom_offset as usize, zm_start)?;
        let zone_map = ZoneMap::from_bytes(&data[zm_start..st_start])?;
        let strings = StringTableView::parse(&data, st_start, fi_start)?;

        for col in [cols.edge_type, cols.partition, cols.metadata] {
            check_refs(&data, &strings, col, n)?;
        }

        let seg = Self {
            data,
            record_count: n,
            cols,
            src_bloom,
            dst_bloom,
            zone_map,
            strings,
        };
        for i in 1..n {
            if seg.key_at(i - 1) >= seg.key_at(i) {
                return Err(corrupt(format!("Edge keys not strictly ascending at record {}", i)));
            }
        }
        Ok(seg)
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    // ── Column Accessors (O(1)) ────────────────────────────────────

    pub fn get_src(&self, index: usize) -> u128 {
        read_u128_at(&self.data, self.cols.src + index * 16)
    }

    pub fn get_dst(&self, index: usize) -> u128 {
        read_u128_at(&self.data, self.cols.dst + index * 16)
    }

    pub fn get_edge_type(&self, index: usize) -> &str {
        self.string_at(self.cols.edge_type, index)
    }

    pub fn get_partition(&self, index: usize) -> &str {
        self.string_at(self.cols.partition, index)
    }

    pub fn get_metadata(&self, index: usize) -> &str {
        self.string_at(self.cols.metadata, index)
    }

    pub fn get_record(&self, index: usize) -> EdgeRecord {
        EdgeRecord {
            src: self.get_src(index),
            dst: self.get_dst(index),
            edge_type: self.get_edge_type(index).to_string(),
            partition: self.get_partition(index).to_string(),
            metadata: self.get_metadata(index).to_string(),
        }
    }

    fn key_at(&self, index: usize) -> (u128, u128, &str) {
        (self.get_src(index), self.get_dst(index), self.get_edge_type(index))
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn maybe_contains_src(&self, src: u128) -> bool {
        self.src_bloom.maybe_contains(&self.data, src)
    }

    pub fn maybe_contains_dst(&self, dst: u128) -> bool {
        self.dst_bloom.maybe_contains(&self.data, dst)
    }

    /// Indices of all edges leaving `src`. Contiguous thanks to sort order.
    pub fn outgoing(&self, src: u128) -> std::ops::Range<usize> {
        if !self.maybe_contains_src(src) {
            return 0..0;
        }
        let lo = self.partition_point(|i| self.get_src(i) < src);
        let hi = self.partition_point(|i| self.get_src(i) <= src);
        lo..hi
    }

    /// Indices of all edges entering `dst`. Linear scan after a bloom check.
    pub fn incoming(&self, dst: u128) -> impl Iterator<Item = usize> + '_ {
        let n = if self.maybe_contains_dst(dst) { self.record_count } else { 0 };
        (0..n).filter(move |&i| self.get_dst(i) == dst)
    }

    /// Position of an exact `(src, dst, edge_type)` key.
    pub fn find(&self, src: u128, dst: u128, edge_type: &str) -> Option<usize> {
        self.outgoing(src)
            .find(|&i| self.get_dst(i) == dst && self.get_edge_type(i) == edge_type)
    }

    pub fn zone_map(&self) -> &ZoneMap {
        &self.zone_map
    }

    pub fn iter(&self) -> impl Iterator<Item = EdgeRecord> + '_ {
        (0..self.record_count).map(move |i| self.get_record(i))
    }

    fn partition_point(&self, pred: impl Fn(usize) -> bool) -> usize {
        let (mut lo, mut hi) = (0, self.record_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(mid) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn string_at(&self, column: usize, index: usize) -> &str {
        let idx = read_u32_at(&self.data, column + index * 4);
        self.strings.get(&self.data, idx).unwrap_or_default()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
