//! Error types for jobq
//!
//! Centralized error handling using thiserror. Configuration errors (unknown
//! factory keys, migration gaps, absent Data keys) are deliberately *not*
//! represented here: they are programming errors and panic instead.

use thiserror::Error;

/// All recoverable error types that can occur in jobq
#[derive(Debug, Error)]
pub enum JobqError {
    /// Job not found in storage
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Invalid submission or state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Payload could not be deserialized
    #[error("Data error: {0}")]
    Data(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking wait on job completion ran out of time
    #[error("Timed out waiting for job completion")]
    Timeout,
}

/// Result type alias for jobq operations
pub type Result<T> = std::result::Result<T, JobqError>;
