//! Error types for strata-store

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The backend rejected or failed the operation.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// The operation did not complete within its profile's deadline.
    #[error("storage operation {operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// A stored value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A blob is larger than the capped store can ever hold.
    #[error("payload of {size} bytes exceeds blob store capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },

    /// No table exists for the requested rollup level.
    #[error("unknown rollup level: {level}")]
    UnknownRollupLevel { level: usize },

    /// A row read back from the backend is malformed.
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: String, reason: String },
}

impl StorageError {
    /// Transient failures leave work pending; it is retried on the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_) | StorageError::Timeout { .. })
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
