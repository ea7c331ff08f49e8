//! DatabaseManager - registry of the databases one server serves.
//!
//! Persistent databases live under the data directory as `{name}.cgdb`;
//! ephemeral ones exist only in memory and disappear once the last
//! connection using them closes. Each database owns its engine and, when
//! auto compaction is on, its compaction worker.
//!
//! Connection counts are per database and advisory: they decide whether a
//! database may be dropped and when an ephemeral one is released.
//!
//! ```no_run
//! use cgdb::database_manager::{AccessMode, DatabaseManager};
//! use cgdb::EngineConfig;
//!
//! # fn main() -> cgdb::Result<()> {
//! let manager = DatabaseManager::new("/data", EngineConfig::default());
//! manager.create_database("scratch", true)?;
//!
//! let db = manager.open_database("scratch")?;
//! db.add_connection();
//! // ... serve requests against db.engine() ...
//! db.remove_connection();
//! manager.cleanup_ephemeral_if_unused("scratch");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{GraphError, Result};
use crate::graph::{CompactionWorker, GraphEngine, GraphReader};
use crate::storage::manifest::CURRENT_FILE;

/// Name under which the database given on the command line is registered.
pub const DEFAULT_DATABASE: &str = "default";

const DATABASE_SUFFIX: &str = "cgdb";

const MAX_NAME_LEN: usize = 128;

// ── Access Mode ─────────────────────────────────────────────────────

/// Per-session access to a database. Not a lock: any number of read-write
/// sessions may share a database, and the engine still admits one batch at
/// a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "ro",
            AccessMode::ReadWrite => "rw",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

impl FromStr for AccessMode {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ro" | "readonly" | "read-only" => Ok(AccessMode::ReadOnly),
            "rw" | "readwrite" | "read-write" => Ok(AccessMode::ReadWrite),
            other => Err(GraphError::Protocol(format!("unknown access mode '{}'", other))),
        }
    }
}

// ── Database ────────────────────────────────────────────────────────

pub struct Database {
    pub name: String,
    pub ephemeral: bool,
    engine: GraphEngine,
    compactor: Mutex<Option<CompactionWorker>>,
    connection_count: AtomicUsize,
}

impl Database {
    pub fn new(name: &str, engine: GraphEngine) -> Self {
        let compactor = engine
            .config()
            .compaction
            .auto_compact
            .then(|| CompactionWorker::spawn(engine.clone()));
        Self {
            name: name.to_string(),
            ephemeral: engine.is_ephemeral(),
            engine,
            compactor: Mutex::new(compactor),
            connection_count: AtomicUsize::new(0),
        }
    }

    pub fn engine(&self) -> &GraphEngine {
        &self.engine
    }

    pub fn add_connection(&self) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_connection(&self) {
        // Saturate: a stray release must not wrap the count.
        let _ = self
            .connection_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn is_in_use(&self) -> bool {
        self.connection_count() > 0
    }

    /// Wake the background compactor, if this database has one.
    pub fn trigger_compaction(&self) {
        if let Ok(guard) = self.compactor.lock() {
            if let Some(worker) = guard.as_ref() {
                worker.trigger();
            }
        }
    }

    fn stop_compaction(&self) {
        let worker = match self.compactor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            worker.shutdown();
        }
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            name: self.name.clone(),
            ephemeral: self.ephemeral,
            node_count: self.engine.node_count(),
            edge_count: self.engine.edge_count(),
            connection_count: self.connection_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub name: String,
    pub ephemeral: bool,
    pub node_count: u64,
    pub edge_count: u64,
    pub connection_count: usize,
}

// ── Manager ─────────────────────────────────────────────────────────

pub struct DatabaseManager {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    data_dir: PathBuf,
    config: EngineConfig,
}

fn poisoned() -> GraphError {
    GraphError::Integrity("database registry lock poisoned".into())
}

impl DatabaseManager {
    /// Persistent databases are created under `data_dir` with `config`.
    pub fn new(data_dir: impl Into<PathBuf>, config: EngineConfig) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            data_dir: data_dir.into(),
            config,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn database_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", name, DATABASE_SUFFIX))
    }

    /// 1-128 characters from `[a-zA-Z0-9_-]`.
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(GraphError::InvalidDatabaseName(format!(
                "name must be 1-{} characters",
                MAX_NAME_LEN
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(GraphError::InvalidDatabaseName(
                "name can only contain a-z, A-Z, 0-9, _, -".into(),
            ));
        }
        Ok(())
    }

    /// Register an already opened engine as [`DEFAULT_DATABASE`].
    pub fn register_default(&self, engine: GraphEngine) -> Result<Arc<Database>> {
        let db = Arc::new(Database::new(DEFAULT_DATABASE, engine));
        self.databases
            .write()
            .map_err(|_| poisoned())?
            .insert(DEFAULT_DATABASE.to_string(), db.clone());
        Ok(db)
    }

    pub fn create_database(&self, name: &str, ephemeral: bool) -> Result<()> {
        Self::validate_name(name)?;
        let mut databases = self.databases.write().map_err(|_| poisoned())?;
        if databases.contains_key(name) {
            return Err(GraphError::DatabaseExists(name.to_string()));
        }

        let engine = if ephemeral {
            GraphEngine::create_ephemeral(self.config.clone())
        } else {
            let path = self.database_path(name);
            if path.join(CURRENT_FILE).exists() {
                return Err(GraphError::DatabaseExists(name.to_string()));
            }
            GraphEngine::create(&path, self.config.clone())?
        };
        databases.insert(name.to_string(), Arc::new(Database::new(name, engine)));
        tracing::info!(database = name, ephemeral, "database created");
        Ok(())
    }

    /// Look up a registered database, loading a persistent one left in the
    /// data directory by an earlier run.
    pub fn open_database(&self, name: &str) -> Result<Arc<Database>> {
        if let Some(db) = self.databases.read().map_err(|_| poisoned())?.get(name) {
            return Ok(db.clone());
        }
        Self::validate_name(name).map_err(|_| GraphError::DatabaseNotFound(name.to_string()))?;
        let path = self.database_path(name);
        if !path.join(CURRENT_FILE).exists() {
            return Err(GraphError::DatabaseNotFound(name.to_string()));
        }

        let mut databases = self.databases.write().map_err(|_| poisoned())?;
        // Another connection may have loaded it while we waited.
        if let Some(db) = databases.get(name) {
            return Ok(db.clone());
        }
        let engine = GraphEngine::open(&path, self.config.clone())?;
        let db = Arc::new(Database::new(name, engine));
        databases.insert(name.to_string(), db.clone());
        tracing::info!(database = name, path = %path.display(), "database loaded");
        Ok(db)
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases
            .read()
            .map(|dbs| dbs.contains_key(name))
            .unwrap_or(false)
    }

    /// Remove a database nobody is connected to. A persistent database's
    /// directory is deleted with it.
    pub fn drop_database(&self, name: &str) -> Result<()> {
        let mut databases = self.databases.write().map_err(|_| poisoned())?;
        let db = databases
            .get(name)
            .ok_or_else(|| GraphError::DatabaseNotFound(name.to_string()))?;
        if db.is_in_use() {
            return Err(GraphError::DatabaseInUse(name.to_string()));
        }
        let db = databases
            .remove(name)
            .ok_or_else(|| GraphError::DatabaseNotFound(name.to_string()))?;
        drop(databases);

        db.stop_compaction();
        if let Some(path) = db.engine.path() {
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
        }
        tracing::info!(database = name, ephemeral = db.ephemeral, "database dropped");
        Ok(())
    }

    /// Every registered database, sorted by name.
    pub fn list_databases(&self) -> Vec<DatabaseInfo> {
        let databases: Vec<Arc<Database>> = match self.databases.read() {
            Ok(dbs) => dbs.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let mut infos: Vec<DatabaseInfo> = databases.iter().map(|db| db.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Release an ephemeral database once its last connection is gone.
    /// The default database stays registered for the life of the server.
    /// Returns whether it was released.
    pub fn cleanup_ephemeral_if_unused(&self, name: &str) -> bool {
        let Ok(mut databases) = self.databases.write() else {
            return false;
        };
        let unused = databases
            .get(name)
            .is_some_and(|db| db.ephemeral && db.name != DEFAULT_DATABASE && !db.is_in_use());
        if !unused {
            return false;
        }
        if let Some(db) = databases.remove(name) {
            drop(databases);
            db.stop_compaction();
            tracing::debug!(database = name, "ephemeral database released");
        }
        true
    }
}
