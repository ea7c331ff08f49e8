//! In-memory accumulation of a batch's records before flush.
//!
//! Nodes are keyed by id for O(1) point lookup and upsert. Edges are kept in
//! insertion order with an index on `(partition, src, dst, edge_type)`; a
//! repeated key replaces the earlier record in place.
//!
//! Single-writer: the owning batch is the only accessor.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::storage::types::{EdgeRecord, NodeRecord};

/// Whether an upsert created a new key or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Inserted,
    Updated,
}

type EdgeSlot = (String, u128, u128, String);

/// Records of one partition, ready to be encoded.
#[derive(Debug, Default)]
pub struct PartitionRecords {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

#[derive(Debug, Default)]
pub struct WriteBuffer {
    nodes: HashMap<u128, NodeRecord>,
    edges: Vec<EdgeRecord>,
    edge_index: HashMap<EdgeSlot, usize>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Write Operations -----------------------------------------------------

    pub fn add_node(&mut self, record: NodeRecord) -> WriteOp {
        match self.nodes.insert(record.id, record) {
            Some(_) => WriteOp::Updated,
            None => WriteOp::Inserted,
        }
    }

    pub fn add_edge(&mut self, record: EdgeRecord) -> WriteOp {
        let slot = (
            record.partition.clone(),
            record.src,
            record.dst,
            record.edge_type.clone(),
        );
        match self.edge_index.get(&slot) {
            Some(&pos) => {
                self.edges[pos] = record;
                WriteOp::Updated
            }
            None => {
                self.edge_index.insert(slot, self.edges.len());
                self.edges.push(record);
                WriteOp::Inserted
            }
        }
    }

    /// Drop every staged edge for which `keep` returns false. Returns how
    /// many were dropped.
    pub fn retain_edges(&mut self, mut keep: impl FnMut(&EdgeRecord) -> bool) -> usize {
        let before = self.edges.len();
        self.edges.retain(|e| keep(e));
        if self.edges.len() != before {
            self.edge_index = self
                .edges
                .iter()
                .enumerate()
                .map(|(pos, e)| ((e.partition.clone(), e.src, e.dst, e.edge_type.clone()), pos))
                .collect();
        }
        before - self.edges.len()
    }

    // -- Read Operations ------------------------------------------------------

    pub fn get_node(&self, id: u128) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.iter()
    }

    /// Every partition key a buffered record names.
    pub fn partitions(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .map(|n| n.partition.clone())
            .chain(self.edges.iter().map(|e| e.partition.clone()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    // -- Flush ----------------------------------------------------------------

    /// Take every record, grouped by partition. The buffer is left empty.
    pub fn drain_by_partition(&mut self) -> BTreeMap<String, PartitionRecords> {
        let mut out: BTreeMap<String, PartitionRecords> = BTreeMap::new();
        for (_, node) in self.nodes.drain() {
            out.entry(node.partition.clone()).or_default().nodes.push(node);
        }
        self.edge_index.clear();
        for edge in self.edges.drain(..) {
            out.entry(edge.partition.clone()).or_default().edges.push(edge);
        }
        out
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.edge_index.clear();
    }
}
