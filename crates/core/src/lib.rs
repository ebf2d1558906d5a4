//! Foreman core data models.
//!
//! This crate defines the task record protocol shared by the queue,
//! the watcher, and the runners.

#![warn(missing_docs)]

// Core identities
mod id;

// Task record and lifecycle
mod task;

// Re-exports
pub use id::TaskId;
pub use task::{ClaimFilter, Task, TaskAction, TaskSpec, TaskStatus, TransitionError};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
