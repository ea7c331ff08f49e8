//! Per-segment string table.
//!
//! Every string column in a segment stores a u32 index into this table.
//! The writer deduplicates on intern; the reader validates the whole table
//! once at open and afterwards resolves indices without copying.
//!
//! Binary format:
//! ```text
//! [string_count: u32 LE]
//! [total_data_len: u32 LE]
//! [entries: (offset: u32 LE, length: u32 LE) x string_count]
//! [data: u8 x total_data_len]   // concatenated UTF-8
//! ```

use std::collections::HashMap;
use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage::types::le_u32;

const TABLE_HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 8;

/// Write-side string table with deduplication.
#[derive(Debug, Default)]
pub struct StringTableBuilder {
    data: Vec<u8>,
    entries: Vec<(u32, u32)>,
    index: HashMap<String, u32>,
}

impl StringTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its 0-based index.
    pub fn intern(&mut self, s: &str) -> Result<u32> {
        if let Some(&idx) = self.index.get(s) {
            return Ok(idx);
        }
        if self.data.len() + s.len() > u32::MAX as usize {
            return Err(GraphError::Protocol(
                "String table exceeds 4 GiB segment limit".into(),
            ));
        }

        let idx = self.entries.len() as u32;
        self.entries.push((self.data.len() as u32, s.len() as u32));
        self.data.extend_from_slice(s.as_bytes());
        self.index.insert(s.to_string(), idx);
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn serialized_size(&self) -> usize {
        TABLE_HEADER_SIZE + self.entries.len() * ENTRY_SIZE + self.data.len()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        writer.write_all(&(self.data.len() as u32).to_le_bytes())?;
        for &(offset, length) in &self.entries {
            writer.write_all(&offset.to_le_bytes())?;
            writer.write_all(&length.to_le_bytes())?;
        }
        writer.write_all(&self.data)?;
        Ok(())
    }
}

/// Read-side view of a string table that has passed validation.
///
/// Like [`BloomView`](crate::storage::bloom::BloomView), it stores offsets
/// only; lookups take the segment bytes as an argument.
#[derive(Debug, Clone, Copy)]
pub struct StringTableView {
    entries_offset: usize,
    data_offset: usize,
    count: u32,
}

impl StringTableView {
    /// Validate the table at `data[offset..end]`: header, entry bounds and
    /// UTF-8 of every string. After this, [`get`](Self::get) cannot fail for
    /// indices below [`len`](Self::len).
    pub fn parse(data: &[u8], offset: usize, end: usize) -> Result<Self> {
        if offset > end || end > data.len() || end - offset < TABLE_HEADER_SIZE {
            return Err(GraphError::Integrity("String table too small".into()));
        }
        let count = le_u32(&data[offset..offset + 4]);
        let data_len = le_u32(&data[offset + 4..offset + 8]) as usize;

        let entries_offset = offset + TABLE_HEADER_SIZE;
        let entries_len = (count as usize)
            .checked_mul(ENTRY_SIZE)
            .ok_or_else(|| GraphError::Integrity("String table count overflow".into()))?;
        if end - entries_offset < entries_len {
            return Err(GraphError::Integrity("String table entries truncated".into()));
        }
        let data_offset = entries_offset + entries_len;
        if end - data_offset < data_len {
            return Err(GraphError::Integrity("String table data truncated".into()));
        }

        let blob = &data[data_offset..data_offset + data_len];
        for i in 0..count as usize {
            let at = entries_offset + i * ENTRY_SIZE;
            let start = le_u32(&data[at..at + 4]) as usize;
            let len = le_u32(&data[at + 4..at + 8]) as usize;
            let stop = start
                .checked_add(len)
                .filter(|&s| s <= blob.len())
                .ok_or_else(|| {
                    GraphError::Integrity(format!("String table entry {} out of bounds", i))
                })?;
            std::str::from_utf8(&blob[start..stop]).map_err(|_| {
                GraphError::Integrity(format!("String table entry {} is not UTF-8", i))
            })?;
        }

        Ok(Self {
            entries_offset,
            data_offset,
            count,
        })
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Resolve an index. Returns None for out-of-range indices.
    pub fn get<'a>(&self, data: &'a [u8], index: u32) -> Option<&'a str> {
        if index >= self.count {
            return None;
        }
        let at = self.entries_offset + index as usize * ENTRY_SIZE;
        let start = self.data_offset + le_u32(&data[at..at + 4]) as usize;
        let len = le_u32(&data[at + 4..at + 8]) as usize;
        std::str::from_utf8(data.get(start..start + len)?).ok()
    }
}
