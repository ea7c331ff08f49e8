//! Error types for the graph engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    /// Corrupt or truncated segment, manifest or pointer file.
    /// Always fatal for the unit it was raised on.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Missing id, partition, version or tag. Expected on reads.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Batch state conflict (e.g. a second batch opened on the same engine).
    /// The caller may retry once the other batch finishes.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed request or record.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compaction error: {0}")]
    Compaction(String),

    // -- Database registry ----------------------------------------------
    #[error("Database '{0}' already exists")]
    DatabaseExists(String),

    #[error("Database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("Database '{0}' is in use and cannot be dropped")]
    DatabaseInUse(String),

    #[error("No database selected")]
    NoDatabaseSelected,

    #[error("Operation not allowed in read-only mode")]
    ReadOnlyMode,

    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),
}

impl GraphError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::Integrity(_) => "INTEGRITY_ERROR",
            GraphError::NotFound(_) => "NOT_FOUND",
            GraphError::Conflict(_) => "CONFLICT",
            GraphError::Protocol(_) => "PROTOCOL_ERROR",
            GraphError::Io(_) => "IO_ERROR",
            GraphError::Json(_) | GraphError::Compaction(_) => "INTERNAL_ERROR",
            GraphError::DatabaseExists(_) => "DATABASE_EXISTS",
            GraphError::DatabaseNotFound(_) => "DATABASE_NOT_FOUND",
            GraphError::DatabaseInUse(_) => "DATABASE_IN_USE",
            GraphError::NoDatabaseSelected => "NO_DATABASE_SELECTED",
            GraphError::ReadOnlyMode => "READ_ONLY_MODE",
            GraphError::InvalidDatabaseName(_) => "INVALID_DATABASE_NAME",
        }
    }

    /// Whether the caller can reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::Conflict(_) | GraphError::DatabaseInUse(_))
    }
}
