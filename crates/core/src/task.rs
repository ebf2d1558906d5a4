//! Task model - the unit of work delegated to an agent backend.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::Time;

/// Lifecycle states a task can be in.
///
/// A task only ever advances `Pending -> Running -> {Completed, Failed}`.
/// The two terminal states are immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the queue to be picked up
    Pending,
    /// Claimed by a watcher and executing
    Running,
    /// Finished successfully, `result` is set
    Completed,
    /// Finished with an error, `error` is set
    Failed,
}

impl TaskStatus {
    /// All states, in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Queue partition directory for this state.
    pub fn dir_name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Well-known kinds of work a producer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    /// Implement new code
    Implement,
    /// Write tests
    Test,
    /// Refactor existing code
    Refactor,
    /// Fix a bug
    Fix,
    /// Write documentation
    Document,
    /// Review code without changing it
    Review,
    /// Anything else; the instructions carry the intent
    Custom,
}

impl Default for TaskAction {
    fn default() -> Self {
        TaskAction::Implement
    }
}

impl TaskAction {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Implement => "implement",
            TaskAction::Test => "test",
            TaskAction::Refactor => "refactor",
            TaskAction::Fix => "fix",
            TaskAction::Document => "document",
            TaskAction::Review => "review",
            TaskAction::Custom => "custom",
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "implement" => Ok(TaskAction::Implement),
            "test" => Ok(TaskAction::Test),
            "refactor" => Ok(TaskAction::Refactor),
            "fix" => Ok(TaskAction::Fix),
            "document" => Ok(TaskAction::Document),
            "review" => Ok(TaskAction::Review),
            "custom" => Ok(TaskAction::Custom),
            other => Err(format!("unknown task action: {}", other)),
        }
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    /// State the task was in
    pub from: TaskStatus,
    /// State the caller asked for
    pub to: TaskStatus,
}

/// A task delegated from a controlling process to an agent backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Current lifecycle state
    pub status: TaskStatus,

    /// Scheduling priority; higher claims first (0 = normal)
    #[serde(default)]
    pub priority: i32,

    /// Natural-language directive for the backend
    pub instructions: String,

    /// Files the backend should focus on (may be empty)
    #[serde(default)]
    pub target_files: Vec<String>,

    /// Extra context from the producer (constraints, notes); empty = none
    #[serde(default)]
    pub context: String,

    /// Kind of work requested
    #[serde(default)]
    pub action: TaskAction,

    /// Backend selector (specialized role to invoke); empty = default
    #[serde(default)]
    pub backend: String,

    /// Output written by the backend, set only on `Completed`
    #[serde(default)]
    pub result: Option<String>,

    /// Error message, set only on `Failed`
    #[serde(default)]
    pub error: Option<String>,

    /// Creation timestamp
    pub created_at: Time,

    /// When a watcher claimed the task; unset while pending
    #[serde(default)]
    pub claimed_at: Option<Time>,

    /// When a terminal state was reached; unset before that
    #[serde(default)]
    pub completed_at: Option<Time>,
}

impl Task {
    /// Build a new pending task from a submission spec.
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            status: TaskStatus::Pending,
            priority: spec.priority,
            instructions: spec.instructions,
            target_files: spec.target_files,
            context: spec.context,
            action: spec.action,
            backend: spec.backend,
            result: None,
            error: None,
            created_at: chrono::Utc::now(),
            claimed_at: None,
            completed_at: None,
        }
    }

    /// Canonical file name of the record unit.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition `Pending -> Running` and stamp the claim time.
    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.check_transition(TaskStatus::Pending, TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.claimed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Transition `Running -> Completed` with the backend's output.
    pub fn mark_completed(&mut self, result: impl Into<String>) -> Result<(), TransitionError> {
        self.check_transition(TaskStatus::Running, TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.result = Some(result.into());
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Transition `Running -> Failed` with an error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.check_transition(TaskStatus::Running, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Reset a recovered task back to `Pending` so it can be claimed again.
    pub fn mark_requeued(&mut self) -> Result<(), TransitionError> {
        self.check_transition(TaskStatus::Running, TaskStatus::Pending)?;
        self.status = TaskStatus::Pending;
        self.claimed_at = None;
        Ok(())
    }

    fn check_transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut summary: String = self.instructions.chars().take(60).collect();
        if summary.len() < self.instructions.len() {
            summary.push('…');
        }
        if self.backend.is_empty() {
            write!(f, "[{}] {}: {}", self.id, self.action, summary)
        } else {
            write!(f, "[{}] {} @{}: {}", self.id, self.action, self.backend, summary)
        }
    }
}

/// Specification for submitting a task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// What the backend should do
    pub instructions: String,
    /// Files to focus on
    pub target_files: Vec<String>,
    /// Extra context
    pub context: String,
    /// Kind of work
    pub action: TaskAction,
    /// Backend selector
    pub backend: String,
    /// Priority (0 = normal, higher = more urgent)
    pub priority: i32,
}

impl TaskSpec {
    /// Create a spec with default settings.
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            ..Default::default()
        }
    }

    /// Set target files.
    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }

    /// Set extra context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Set the action.
    pub fn with_action(mut self, action: TaskAction) -> Self {
        self.action = action;
        self
    }

    /// Set the backend selector.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Filter for claiming tasks.
///
/// Lets a specialized watcher serve only a subset of the queue.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Only claim tasks with this action
    pub action: Option<TaskAction>,
    /// Only claim tasks routed to this backend selector
    pub backend: Option<String>,
}

impl ClaimFilter {
    /// Whether a pending task is eligible under this filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(action) = self.action {
            if task.action != action {
                return false;
            }
        }
        if let Some(backend) = &self.backend {
            if task.backend != *backend {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new(
            TaskSpec::new("Write unit tests for the parser")
                .with_target_files(vec!["src/parser.rs".to_string()])
                .with_context("Use the existing fixtures")
                .with_action(TaskAction::Test)
                .with_backend("tester")
                .with_priority(5),
        )
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = sample();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert!(task.claimed_at.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let task = sample();
        let json = serde_json::to_string_pretty(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.priority, 5);
        assert_eq!(back.instructions, task.instructions);
        assert_eq!(back.target_files, task.target_files);
        assert_eq!(back.context, task.context);
        assert_eq!(back.action, TaskAction::Test);
        assert_eq!(back.backend, "tester");
        assert_eq!(back.result, None);
        assert_eq!(back.error, None);
        assert_eq!(back.created_at, task.created_at);
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
        let json = serde_json::to_string(&TaskAction::Refactor).unwrap();
        assert_eq!(json, "\"refactor\"");
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut task = sample();
        task.mark_running().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.claimed_at.is_some());

        task.mark_completed("done").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = sample();
        task.mark_running().unwrap();
        task.mark_failed("boom").unwrap();

        let err = task.mark_completed("late").unwrap_err();
        assert_eq!(err.from, TaskStatus::Failed);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cannot_complete_pending() {
        let mut task = sample();
        assert!(task.mark_completed("nope").is_err());
        assert!(task.mark_failed("nope").is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_requeue_clears_claim() {
        let mut task = sample();
        task.mark_running().unwrap();
        task.mark_requeued().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.claimed_at.is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("pending".parse::<TaskStatus>().unwrap(), TaskStatus::Pending);
        assert_eq!("FAILED".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_legacy_record_tolerated() {
        // Records written before claimed_at / backend existed still load.
        let json = format!(
            r#"{{
                "id": "{}",
                "status": "PENDING",
                "instructions": "old record",
                "created_at": "2025-01-01T00:00:00Z"
            }}"#,
            TaskId::new()
        );
        let task: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task.backend, "");
        assert_eq!(task.action, TaskAction::Implement);
        assert!(task.claimed_at.is_none());
    }

    #[test]
    fn test_claim_filter() {
        let task = sample();
        assert!(ClaimFilter::default().matches(&task));
        assert!(ClaimFilter {
            action: Some(TaskAction::Test),
            backend: Some("tester".to_string()),
        }
        .matches(&task));
        assert!(!ClaimFilter {
            action: Some(TaskAction::Fix),
            backend: None,
        }
        .matches(&task));
        assert!(!ClaimFilter {
            action: None,
            backend: Some("reviewer".to_string()),
        }
        .matches(&task));
    }

    #[test]
    fn test_display_truncates() {
        let spec = TaskSpec::new("x".repeat(100));
        let task = Task::new(spec);
        let shown = task.to_string();
        assert!(shown.contains('…'));
        assert!(shown.len() < 160);
    }
}
