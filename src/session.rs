//! ClientSession - per-connection state
//!
//! A connection works against at most one database at a time, in the
//! access mode it was opened with. It owns at most one open batch and any
//! number of snapshot pins on that database; both are released when the
//! session switches database or closes, so a client that disconnects
//! mid-batch leaves nothing behind.

use std::sync::Arc;

use crate::database_manager::{AccessMode, Database};
use crate::error::{GraphError, Result};
use crate::graph::{Batch, GraphEngine, SnapshotPin};

pub type ClientId = usize;

/// Session state for a client connection.
pub struct ClientSession {
    pub id: ClientId,
    current: Option<Arc<Database>>,
    pub access_mode: AccessMode,
    batch: Option<Batch>,
    pins: Vec<SnapshotPin>,
    /// Negotiated by `hello`
    pub protocol_version: u32,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            current: None,
            access_mode: AccessMode::ReadWrite,
            batch: None,
            pins: Vec::new(),
            protocol_version: 1,
        }
    }

    // -- Database ---------------------------------------------------------

    /// Attach to `db`, counting this connection against it. Returns the
    /// database previously attached, already released.
    pub fn set_database(&mut self, db: Arc<Database>, mode: AccessMode) -> Option<Arc<Database>> {
        let previous = self.clear_database();
        db.add_connection();
        tracing::debug!(client = self.id, database = %db.name, mode = mode.as_str(), "database opened");
        self.current = Some(db);
        self.access_mode = mode;
        previous
    }

    /// Detach from the current database, aborting the batch and releasing
    /// pins first.
    pub fn clear_database(&mut self) -> Option<Arc<Database>> {
        let aborted = self.abort_batch();
        let pins = self.pins.len();
        self.pins.clear();
        let db = self.current.take()?;
        db.remove_connection();
        if aborted || pins > 0 {
            tracing::debug!(
                client = self.id,
                database = %db.name,
                batch_aborted = aborted,
                pins_released = pins,
                "session released database"
            );
        }
        Some(db)
    }

    pub fn has_database(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_db_name(&self) -> Option<&str> {
        self.current.as_deref().map(|db| db.name.as_str())
    }

    pub fn database(&self) -> Result<&Arc<Database>> {
        self.current.as_ref().ok_or(GraphError::NoDatabaseSelected)
    }

    pub fn engine(&self) -> Result<&GraphEngine> {
        Ok(self.database()?.engine())
    }

    /// The current database, if the session may change it.
    pub fn writable_engine(&self) -> Result<&GraphEngine> {
        let engine = self.engine()?;
        if !self.access_mode.is_write() {
            return Err(GraphError::ReadOnlyMode);
        }
        Ok(engine)
    }

    // -- Batch ------------------------------------------------------------

    pub fn begin_batch(&mut self) -> Result<()> {
        if self.batch.is_some() {
            return Err(GraphError::Conflict(
                "this connection already has an open batch".into(),
            ));
        }
        let batch = self.writable_engine()?.begin_batch()?;
        self.batch = Some(batch);
        Ok(())
    }

    pub fn has_batch(&self) -> bool {
        self.batch.is_some()
    }

    pub fn batch_mut(&mut self) -> Result<&mut Batch> {
        self.batch
            .as_mut()
            .ok_or_else(|| GraphError::Protocol("no open batch; send beginBatch first".into()))
    }

    /// Hand the batch to a commit. The session no longer owns it either way.
    pub fn take_batch(&mut self) -> Result<Batch> {
        self.batch
            .take()
            .ok_or_else(|| GraphError::Protocol("no open batch; send beginBatch first".into()))
    }

    /// Returns whether a batch was open.
    pub fn abort_batch(&mut self) -> bool {
        match self.batch.take() {
            Some(batch) => {
                batch.abort();
                true
            }
            None => false,
        }
    }

    // -- Pins -------------------------------------------------------------

    pub fn add_pin(&mut self, pin: SnapshotPin) -> u64 {
        let version = pin.version();
        self.pins.push(pin);
        version
    }

    /// Release one pin of `version`. Returns false if the session held none.
    pub fn release_pin(&mut self, version: u64) -> bool {
        match self.pins.iter().position(|p| p.version() == version) {
            Some(i) => {
                self.pins.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn pinned_versions(&self) -> Vec<u64> {
        let mut versions: Vec<u64> = self.pins.iter().map(|p| p.version()).collect();
        versions.sort_unstable();
        versions
    }

    /// Release everything the connection holds. Returns the database it was
    /// attached to.
    pub fn close(&mut self) -> Option<Arc<Database>> {
        self.clear_database()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
