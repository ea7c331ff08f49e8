//! Node and edge predicates.
//!
//! A predicate is checked at three levels: whole partitions, whole segments
//! (through their zone maps), then single rows read straight from the
//! segment columns. Only rows that pass all three are materialized.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::segment::{EdgeSegment, NodeSegment};
use crate::storage::types::{EdgeRecord, NodeRecord};
use crate::storage::zone_map::{ZoneMap, FIELD_EDGE_TYPE, FIELD_NAME, FIELD_NODE_TYPE, FIELD_PARTITION};

/// Filter over node records. Every set field must match (AND).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeQuery {
    pub partition: Option<String>,
    /// Exact type, or `"ns:*"` for every type under a namespace.
    pub node_type: Option<String>,
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    /// `(key, value)` pairs matched against top-level metadata JSON fields.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<(String, String)>,
}

impl NodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(mut self, p: impl Into<String>) -> Self {
        self.partition = Some(p.into());
        self
    }

    pub fn node_type(mut self, t: impl Into<String>) -> Self {
        self.node_type = Some(t.into());
        self
    }

    pub fn name(mut self, n: impl Into<String>) -> Self {
        self.name = Some(n.into());
        self
    }

    pub fn name_prefix(mut self, p: impl Into<String>) -> Self {
        self.name_prefix = Some(p.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    fn type_pattern(&self) -> Option<TypePattern<'_>> {
        self.node_type.as_deref().map(TypePattern::parse)
    }

    pub fn admits_partition(&self, partition: &str) -> bool {
        self.partition.as_deref().map_or(true, |p| p == partition)
    }

    /// `false` when no record of the segment can match.
    pub fn segment_may_match(&self, zm: &ZoneMap) -> bool {
        if let Some(p) = &self.partition {
            if !zm.may_contain(FIELD_PARTITION, p) {
                return false;
            }
        }
        match self.type_pattern() {
            Some(TypePattern::Exact(t)) if !zm.may_contain(FIELD_NODE_TYPE, t) => return false,
            Some(TypePattern::Prefix(t)) if !zm.may_contain_prefix(FIELD_NODE_TYPE, t) => return false,
            _ => {}
        }
        if let Some(n) = &self.name {
            if !zm.may_contain(FIELD_NAME, n) {
                return false;
            }
        }
        if let Some(p) = &self.name_prefix {
            if !zm.may_contain_prefix(FIELD_NAME, p) {
                return false;
            }
        }
        true
    }

    /// Row check against the segment columns.
    pub fn matches_row(&self, seg: &NodeSegment, i: usize) -> bool {
        self.matches_fields(
            seg.get_partition(i),
            seg.get_node_type(i),
            seg.get_name(i),
            || seg.get_metadata(i),
        )
    }

    pub fn matches(&self, record: &NodeRecord) -> bool {
        self.matches_fields(&record.partition, &record.node_type, &record.name, || {
            record.metadata.as_str()
        })
    }

    fn matches_fields<'a>(
        &self,
        partition: &str,
        node_type: &str,
        name: &str,
        metadata: impl FnOnce() -> &'a str,
    ) -> bool {
        if !self.admits_partition(partition) {
            return false;
        }
        if let Some(pattern) = self.type_pattern() {
            if !pattern.matches(node_type) {
                return false;
            }
        }
        if self.name.as_deref().is_some_and(|n| n != name) {
            return false;
        }
        if self.name_prefix.as_deref().is_some_and(|p| !name.starts_with(p)) {
            return false;
        }
        self.metadata.is_empty() || metadata_matches(metadata(), &self.metadata)
    }
}

/// `"ns:*"` matches every type under `ns:`; anything else matches exactly.
pub(crate) enum TypePattern<'a> {
    Exact(&'a str),
    Prefix(&'a str),
}

impl<'a> TypePattern<'a> {
    pub(crate) fn parse(raw: &'a str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => TypePattern::Prefix(prefix),
            None => TypePattern::Exact(raw),
        }
    }

    pub(crate) fn matches(&self, node_type: &str) -> bool {
        match self {
            TypePattern::Exact(t) => node_type == *t,
            TypePattern::Prefix(p) => node_type.starts_with(p),
        }
    }
}

/// Strings compare by content; other JSON values by their JSON text, so
/// `("async", "true")` matches `{"async": true}`.
fn metadata_matches(raw: &str, filters: &[(String, String)]) -> bool {
    if raw.is_empty() {
        return false;
    }
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        return false;
    };
    filters.iter().all(|(key, want)| match map.get(key) {
        Some(Value::String(s)) => s == want,
        Some(other) => other.to_string() == *want,
        None => false,
    })
}

/// Filter over edge records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EdgeQuery {
    pub partition: Option<String>,
    pub src: Option<u128>,
    pub dst: Option<u128>,
    /// Empty = any type.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub edge_types: Vec<String>,
}

impl EdgeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(mut self, p: impl Into<String>) -> Self {
        self.partition = Some(p.into());
        self
    }

    pub fn src(mut self, id: u128) -> Self {
        self.src = Some(id);
        self
    }

    pub fn dst(mut self, id: u128) -> Self {
        self.dst = Some(id);
        self
    }

    pub fn edge_type(mut self, t: impl Into<String>) -> Self {
        self.edge_types.push(t.into());
        self
    }

    pub fn admits_partition(&self, partition: &str) -> bool {
        self.partition.as_deref().map_or(true, |p| p == partition)
    }

    pub fn segment_may_match(&self, zm: &ZoneMap) -> bool {
        if let Some(p) = &self.partition {
            if !zm.may_contain(FIELD_PARTITION, p) {
                return false;
            }
        }
        self.edge_types.is_empty()
            || self
                .edge_types
                .iter()
                .any(|t| zm.may_contain(FIELD_EDGE_TYPE, t))
    }

    pub fn matches_row(&self, seg: &EdgeSegment, i: usize) -> bool {
        self.matches_fields(seg.get_src(i), seg.get_dst(i), seg.get_edge_type(i), seg.get_partition(i))
    }

    pub fn matches(&self, record: &EdgeRecord) -> bool {
        self.matches_fields(record.src, record.dst, &record.edge_type, &record.partition)
    }

    fn matches_fields(&self, src: u128, dst: u128, edge_type: &str, partition: &str) -> bool {
        self.admits_partition(partition)
            && self.src.map_or(true, |s| s == src)
            && self.dst.map_or(true, |d| d == dst)
            && (self.edge_types.is_empty() || self.edge_types.iter().any(|t| t == edge_type))
    }
}
