//! Runner abstraction.

use std::path::PathBuf;

use async_trait::async_trait;
use foreman_core::Task;

/// Errors a backend can report for a single task.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The task itself is unusable (bad paths, unsafe arguments)
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// The backend ran and reported failure
    #[error("{0}")]
    Backend(String),

    /// I/O error while driving the backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a task executes.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Project root the backend works inside
    pub project_root: PathBuf,
}

impl RunContext {
    /// Context rooted at the given project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }
}

/// An execution backend.
///
/// Implementations translate the task's instructions into whatever the
/// backend understands and return its output on success. The returned future
/// must be cancel-safe: the watcher drops it when the task deadline fires,
/// and any spawned subprocess has to die with it. Runners never touch the
/// task store; state transitions belong to the watcher alone.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute one task to completion and return the backend's output.
    async fn execute(&self, task: &Task, ctx: &RunContext) -> Result<String, RunnerError>;
}
