//! Store error taxonomy.

use std::path::PathBuf;

use foreman_core::{TaskId, TaskStatus, TransitionError};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record with this id already exists in some partition
    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    /// No record with this id in any partition
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Terminal transition requested for a record that is not running
    #[error("task {id} is {status}, expected RUNNING")]
    NotRunning {
        /// The record's id
        id: TaskId,
        /// The state it was actually in
        status: TaskStatus,
    },

    /// A record unit that could not be parsed
    #[error("malformed task unit {path}: {source}")]
    Malformed {
        /// Path of the offending unit
        path: PathBuf,
        /// Parse failure
        #[source]
        source: serde_json::Error,
    },

    /// Illegal lifecycle transition
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
