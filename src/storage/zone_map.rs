//! Per-segment zone maps for segment skipping.
//!
//! Two kinds of summaries are kept per segment:
//!
//! - **value sets**: every distinct value of a low-cardinality field
//!   (`node_type`, `partition`, `edge_type`). Exact-match predicates test
//!   membership.
//! - **ranges**: lexicographic min/max of a high-cardinality field
//!   (`name`, `id` rendered as 32-digit hex). Exact and prefix predicates
//!   test overlap.
//!
//! A field that is not tracked (never added, or over the cardinality cap)
//! answers "maybe" to every question. Skipping is only ever an optimisation;
//! a zone map never hides a record.
//!
//! ## Binary format
//!
//! ```text
//! [set_count: u32 LE]
//! For each set field (sorted by name):
//!   [name_len: u16 LE][name]
//!   [value_count: u32 LE]
//!   For each value (sorted): [value_len: u16 LE][value]
//! [range_count: u32 LE]
//! For each range field (sorted by name):
//!   [name_len: u16 LE][name]
//!   [min_len: u16 LE][min]
//!   [max_len: u16 LE][max]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage::types::MAX_ZONE_MAP_VALUES_PER_FIELD;

pub const FIELD_NODE_TYPE: &str = "node_type";
pub const FIELD_PARTITION: &str = "partition";
pub const FIELD_EDGE_TYPE: &str = "edge_type";
pub const FIELD_NAME: &str = "name";
pub const FIELD_ID: &str = "id";

/// Render an id the way the `id` range stores it. Fixed width, so
/// lexicographic order equals numeric order.
pub fn id_key(id: u128) -> String {
    format!("{:032x}", id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Range {
    min: String,
    max: String,
}

/// Value sets and ranges for one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneMap {
    sets: BTreeMap<String, BTreeSet<String>>,
    ranges: BTreeMap<String, Range>,
}

impl ZoneMap {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Building -------------------------------------------------------

    /// Record that `value` appears for set field `field`.
    pub fn add_value(&mut self, field: &str, value: &str) {
        self.sets
            .entry(field.to_string())
            .or_default()
            .insert(value.to_string());
    }

    /// Widen the range of `field` to include `value`.
    pub fn extend_range(&mut self, field: &str, value: &str) {
        match self.ranges.get_mut(field) {
            Some(r) => {
                if value < r.min.as_str() {
                    r.min = value.to_string();
                }
                if value > r.max.as_str() {
                    r.max = value.to_string();
                }
            }
            None => {
                self.ranges.insert(
                    field.to_string(),
                    Range {
                        min: value.to_string(),
                        max: value.to_string(),
                    },
                );
            }
        }
    }

    // -- Pruning --------------------------------------------------------

    /// `false` means no record of this segment has `field == value`.
    pub fn may_contain(&self, field: &str, value: &str) -> bool {
        if let Some(values) = self.sets.get(field) {
            return values.contains(value);
        }
        if let Some(r) = self.ranges.get(field) {
            return r.min.as_str() <= value && value <= r.max.as_str();
        }
        true
    }

    /// `false` means no record of this segment has `field` starting with
    /// `prefix`.
    pub fn may_contain_prefix(&self, field: &str, prefix: &str) -> bool {
        if let Some(values) = self.sets.get(field) {
            return values.iter().any(|v| v.starts_with(prefix));
        }
        if let Some(r) = self.ranges.get(field) {
            // Prefixed strings form a contiguous run starting at `prefix`.
            return r.max.as_str() >= prefix
                && (r.min.as_str() <= prefix || r.min.starts_with(prefix));
        }
        true
    }

    /// The exact value set of a tracked set field.
    pub fn values(&self, field: &str) -> Option<&BTreeSet<String>> {
        self.sets.get(field)
    }

    /// Whether `field` is summarised at all.
    pub fn tracks(&self, field: &str) -> bool {
        self.sets.contains_key(field) || self.ranges.contains_key(field)
    }

    // -- Serialization --------------------------------------------------

    fn written_sets(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.sets.iter().filter(|(name, values)| {
            let keep = values.len() <= MAX_ZONE_MAP_VALUES_PER_FIELD
                && values.iter().all(|v| v.len() <= u16::MAX as usize);
            if !keep {
                tracing::debug!(
                    field = name.as_str(),
                    count = values.len(),
                    "zone map field over cap, left untracked"
                );
            }
            keep
        })
    }

    fn written_ranges(&self) -> impl Iterator<Item = (&String, &Range)> {
        self.ranges
            .iter()
            .filter(|(_, r)| r.min.len() <= u16::MAX as usize && r.max.len() <= u16::MAX as usize)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let sets: Vec<_> = self.written_sets().collect();
        writer.write_all(&(sets.len() as u32).to_le_bytes())?;
        for (name, values) in sets {
            write_str(writer, name)?;
            writer.write_all(&(values.len() as u32).to_le_bytes())?;
            for v in values {
                write_str(writer, v)?;
            }
        }

        let ranges: Vec<_> = self.written_ranges().collect();
        writer.write_all(&(ranges.len() as u32).to_le_bytes())?;
        for (name, r) in ranges {
            write_str(writer, name)?;
            write_str(writer, &r.min)?;
            write_str(writer, &r.max)?;
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor { bytes, pos: 0 };
        let mut zm = ZoneMap::new();

        let set_count = cur.u32()?;
        for _ in 0..set_count {
            let name = cur.str()?;
            let value_count = cur.u32()?;
            let mut values = BTreeSet::new();
            for _ in 0..value_count {
                values.insert(cur.str()?);
            }
            zm.sets.insert(name, values);
        }

        let range_count = cur.u32()?;
        for _ in 0..range_count {
            let name = cur.str()?;
            let min = cur.str()?;
            let max = cur.str()?;
            if min > max {
                return Err(GraphError::Integrity(format!(
                    "Zone map range for {} is inverted",
                    name
                )));
            }
            zm.ranges.insert(name, Range { min, max });
        }
        Ok(zm)
    }
}

fn write_str<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_all(&(s.len() as u16).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| GraphError::Integrity("Zone map truncated".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self) -> Result<String> {
        let b = self.take(2)?;
        let len = u16::from_le_bytes([b[0], b[1]]) as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| GraphError::Integrity("Zone map contains invalid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reload(zm: &ZoneMap) -> ZoneMap {
        let mut buf = Vec::new();
        zm.write_to(&mut buf).unwrap();
        ZoneMap::from_bytes(&buf).unwrap()
    }

    #[test]
    fn test_untracked_field_is_maybe() {
        let zm = ZoneMap::new();
        assert!(zm.may_contain(FIELD_NODE_TYPE, "FUNCTION"));
        assert!(zm.may_contain_prefix(FIELD_NAME, "get"));
        assert!(!zm.tracks(FIELD_NODE_TYPE));
    }

    #[test]
    fn test_value_sets_prune_exact_match() {
        let mut zm = ZoneMap::new();
        zm.add_value(FIELD_NODE_TYPE, "FUNCTION");
        zm.add_value(FIELD_NODE_TYPE, "CLASS");
        zm.add_value(FIELD_PARTITION, "src/a.js");

        let zm = reload(&zm);
        assert!(zm.may_contain(FIELD_NODE_TYPE, "CLASS"));
        assert!(!zm.may_contain(FIELD_NODE_TYPE, "METHOD"));
        assert!(!zm.may_contain(FIELD_PARTITION, "src/b.js"));
        assert_eq!(zm.values(FIELD_NODE_TYPE).unwrap().len(), 2);
    }

    #[test]
    fn test_ranges_prune_exact_and_prefix() {
        let mut zm = ZoneMap::new();
        for name in ["handleClick", "handleSubmit", "init"] {
            zm.extend_range(FIELD_NAME, name);
        }
        let zm = reload(&zm);

        assert!(zm.may_contain(FIELD_NAME, "handleSubmit"));
        assert!(zm.may_contain(FIELD_NAME, "hz"), "inside range is maybe");
        assert!(!zm.may_contain(FIELD_NAME, "abc"));
        assert!(!zm.may_contain(FIELD_NAME, "zeta"));

        assert!(zm.may_contain_prefix(FIELD_NAME, "handle"));
        assert!(zm.may_contain_prefix(FIELD_NAME, "in"));
        assert!(zm.may_contain_prefix(FIELD_NAME, "h"));
        assert!(!zm.may_contain_prefix(FIELD_NAME, "a"));
        assert!(!zm.may_contain_prefix(FIELD_NAME, "z"));
    }

    #[test]
    fn test_prefix_below_min_without_match() {
        let mut zm = ZoneMap::new();
        zm.extend_range(FIELD_NAME, "m");
        zm.extend_range(FIELD_NAME, "q");
        // "l..." strings all sort before "m"
        assert!(!zm.may_contain_prefix(FIELD_NAME, "l"));
        assert!(zm.may_contain_prefix(FIELD_NAME, "m"));
        assert!(zm.may_contain_prefix(FIELD_NAME, "p"));
    }

    #[test]
    fn test_id_range_orders_numerically() {
        let mut zm = ZoneMap::new();
        zm.extend_range(FIELD_ID, &id_key(10));
        zm.extend_range(FIELD_ID, &id_key(200));
        assert!(zm.may_contain(FIELD_ID, &id_key(50)));
        assert!(!zm.may_contain(FIELD_ID, &id_key(9)));
        assert!(!zm.may_contain(FIELD_ID, &id_key(u128::MAX)));
    }

    #[test]
    fn test_oversized_set_becomes_untracked() {
        let mut zm = ZoneMap::new();
        for i in 0..=MAX_ZONE_MAP_VALUES_PER_FIELD {
            zm.add_value(FIELD_NODE_TYPE, &format!("T{}", i));
        }
        zm.add_value(FIELD_EDGE_TYPE, "CALLS");
        let zm = reload(&zm);
        assert!(!zm.tracks(FIELD_NODE_TYPE));
        assert!(zm.may_contain(FIELD_NODE_TYPE, "never-added"));
        assert!(!zm.may_contain(FIELD_EDGE_TYPE, "IMPORTS"));
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let mut a = ZoneMap::new();
        a.add_value(FIELD_NODE_TYPE, "B");
        a.add_value(FIELD_NODE_TYPE, "A");
        a.extend_range(FIELD_NAME, "x");
        let mut b = ZoneMap::new();
        b.extend_range(FIELD_NAME, "x");
        b.add_value(FIELD_NODE_TYPE, "A");
        b.add_value(FIELD_NODE_TYPE, "B");

        let (mut ba, mut bb) = (Vec::new(), Vec::new());
        a.write_to(&mut ba).unwrap();
        b.write_to(&mut bb).unwrap();
        assert_eq!(ba, bb);
    }

    #[test]
    fn test_truncated_zone_map() {
        let err = ZoneMap::from_bytes(&[1, 0]).unwrap_err();
        assert!(matches!(err, GraphError::Integrity(_)));

        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(b"type");
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&100u16.to_le_bytes());
        let err = ZoneMap::from_bytes(&buf).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&[0xFF, 0xFE]);
        let err = ZoneMap::from_bytes(&buf).unwrap_err();
        assert!(err.to_string().contains("invalid UTF-8"));
    }
}
