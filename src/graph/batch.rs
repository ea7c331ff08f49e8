//! Write batches.

use crate::error::{GraphError, Result};
use crate::graph::engine::GraphEngine;
use crate::graph::GraphReader;
use crate::identity::id_from_semantic;
use crate::storage::types::{CommitDelta, EdgeRecord, NodeRecord};
use crate::storage::write_buffer::WriteBuffer;

/// Records staged for one atomic commit.
///
/// At most one batch is open per engine. The batch is released by
/// [`commit`](Batch::commit), [`abort`](Batch::abort) or by dropping it;
/// nothing staged is visible to readers before a successful commit.
#[derive(Debug)]
pub struct Batch {
    engine: GraphEngine,
    buffer: WriteBuffer,
}

impl Batch {
    pub(crate) fn new(engine: GraphEngine) -> Self {
        Self {
            engine,
            buffer: WriteBuffer::default(),
        }
    }

    // -- Staging ----------------------------------------------------------

    /// Stage a node. Its `id` must be derived from its `semantic_id` and
    /// it must name a partition. A later add with the same id replaces it.
    pub fn add_node(&mut self, record: NodeRecord) -> Result<()> {
        if record.partition.is_empty() {
            return Err(GraphError::Protocol(format!(
                "node {} has no partition",
                record.semantic_id
            )));
        }
        if record.semantic_id.is_empty() {
            return Err(GraphError::Protocol("node has an empty semantic_id".into()));
        }
        if record.id != id_from_semantic(&record.semantic_id) {
            return Err(GraphError::Protocol(format!(
                "node id {:032x} does not match semantic_id {}",
                record.id, record.semantic_id
            )));
        }
        self.buffer.add_node(record);
        Ok(())
    }

    pub fn add_nodes(&mut self, records: impl IntoIterator<Item = NodeRecord>) -> Result<()> {
        for record in records {
            self.add_node(record)?;
        }
        Ok(())
    }

    /// Stage an edge. Endpoints are not checked; an edge may point at a
    /// node another partition has not committed yet.
    pub fn add_edge(&mut self, record: EdgeRecord) -> Result<()> {
        if record.partition.is_empty() {
            return Err(GraphError::Protocol("edge has no partition".into()));
        }
        if record.edge_type.is_empty() {
            return Err(GraphError::Protocol("edge has an empty type".into()));
        }
        self.buffer.add_edge(record);
        Ok(())
    }

    pub fn add_edges(&mut self, records: impl IntoIterator<Item = EdgeRecord>) -> Result<()> {
        for record in records {
            self.add_edge(record)?;
        }
        Ok(())
    }

    // -- Reads ------------------------------------------------------------

    /// Staged copy first, then the engine's current version.
    pub fn get_node(&self, id: u128) -> Option<NodeRecord> {
        self.buffer
            .get_node(id)
            .cloned()
            .or_else(|| self.engine.get_node(id))
    }

    pub fn find_dependent_partitions(&self, partitions: &[&str]) -> Vec<String> {
        self.engine.find_dependent_partitions(partitions)
    }

    pub fn node_count(&self) -> usize {
        self.buffer.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.buffer.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    // -- Finish -----------------------------------------------------------

    /// Atomically replace the contents of `partitions` with the staged
    /// records. Nodes whose type is in `protected_types` survive unless
    /// re-supplied. Staged records in other partitions are upserted.
    ///
    /// On error nothing is published and the batch is released.
    pub fn commit(mut self, partitions: &[&str], protected_types: &[&str]) -> Result<CommitDelta> {
        let buffer = std::mem::take(&mut self.buffer);
        self.engine.commit_buffer(buffer, partitions, protected_types)
    }

    /// Discard everything staged.
    pub fn abort(self) {}
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                nodes = self.buffer.node_count(),
                edges = self.buffer.edge_count(),
                "batch discarded"
            );
        }
        self.engine.release_batch();
    }
}
