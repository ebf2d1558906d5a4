//! Agent-CLI backed runner.
//!
//! Translates a task into one invocation of an external agent command line
//! (programmatic mode), handing the prompt over through a temp file to avoid
//! argv length limits and shell quoting issues.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use foreman_core::Task;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::trait_::{RunContext, Runner, RunnerError};

/// Keep at most this much backend output (the tail survives).
const MAX_CAPTURE: usize = 256 * 1024;

/// Settings for [`CommandRunner`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandRunnerConfig {
    /// Agent CLI executable name or path
    pub command: String,
    /// Model passed via `--model`
    pub model: String,
    /// Pass `--allow-all-tools`
    pub allow_all_tools: bool,
    /// Pass `--allow-all-paths`
    pub allow_all_paths: bool,
    /// Extra arguments appended to every invocation
    pub extra_args: Vec<String>,
}

impl Default for CommandRunnerConfig {
    fn default() -> Self {
        Self {
            command: "copilot".to_string(),
            model: "gpt-5-mini".to_string(),
            // Off unless the operator enables them explicitly.
            allow_all_tools: false,
            allow_all_paths: false,
            extra_args: Vec::new(),
        }
    }
}

/// Executes tasks through an external agent CLI.
pub struct CommandRunner {
    config: CommandRunnerConfig,
}

impl CommandRunner {
    /// Create a runner from config.
    pub fn new(config: CommandRunnerConfig) -> Self {
        Self { config }
    }

    /// Build the prompt handed to the agent.
    ///
    /// A role preamble is prepended when the task routes to a known backend
    /// selector; the agent otherwise runs with its default behavior.
    pub fn build_prompt(&self, task: &Task) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(role) = role_instructions(&task.backend) {
            parts.push(role.to_string());
            parts.push("---".to_string());
        }

        parts.push(format!("ACTION: {}", task.action));
        parts.push(format!("INSTRUCTIONS: {}", task.instructions));

        if !task.target_files.is_empty() {
            parts.push(format!("TARGET FILES: {}", task.target_files.join(", ")));
        }
        if !task.context.is_empty() {
            parts.push(format!("CONTEXT: {}", task.context));
        }

        parts.push(
            "When done, print a brief summary of what you changed. \
             Do not ask for confirmation; just do the work."
                .to_string(),
        );

        parts.join("\n\n")
    }

    fn sanitized_extra_args(&self) -> Result<Vec<String>, RunnerError> {
        self.config
            .extra_args
            .iter()
            .map(|arg| {
                if flag_re().is_match(arg) || value_re().is_match(arg) {
                    Ok(arg.clone())
                } else {
                    Err(RunnerError::InvalidTask(format!(
                        "unsafe extra argument: {}",
                        arg
                    )))
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Runner for CommandRunner {
    async fn execute(&self, task: &Task, ctx: &RunContext) -> Result<String, RunnerError> {
        validate_target_files(&task.target_files)?;
        let extra_args = self.sanitized_extra_args()?;
        let prompt = self.build_prompt(task);

        // The temp file lives until this future completes or is dropped.
        let prompt_file = tempfile::Builder::new()
            .prefix("foreman_prompt_")
            .suffix(".txt")
            .tempfile()?;
        std::fs::write(prompt_file.path(), &prompt)?;

        let mut cmd = Command::new(&self.config.command);
        cmd.arg("--model").arg(&self.config.model);
        if self.config.allow_all_tools {
            cmd.arg("--allow-all-tools");
        }
        if self.config.allow_all_paths {
            cmd.arg("--allow-all-paths");
        }
        cmd.args(&extra_args);
        cmd.arg("-p").arg(prompt_file.path());
        cmd.current_dir(&ctx.project_root);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // The watcher cancels by dropping this future; take the child with it.
        cmd.kill_on_drop(true);

        debug!("spawning {} for task {}", self.config.command, task.id);
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunnerError::Backend(format!(
                    "command '{}' not found; install the agent CLI and put it on PATH",
                    self.config.command
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr_text = String::from_utf8_lossy(&output.stderr);
        if !stderr_text.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr_text.trim_end());
        }
        let combined = tail(combined, MAX_CAPTURE);
        let combined = combined.trim();

        if output.status.success() {
            if combined.is_empty() {
                Ok("task completed (no output captured)".to_string())
            } else {
                Ok(combined.to_string())
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            if combined.is_empty() {
                Err(RunnerError::Backend(format!("exit code {}", code)))
            } else {
                Err(RunnerError::Backend(combined.to_string()))
            }
        }
    }
}

/// Role preambles for the built-in backend selectors.
fn role_instructions(backend: &str) -> Option<&'static str> {
    match backend {
        "implementer" => Some(
            "You are implementing code changes. Follow existing patterns, \
             update tests if they exist, keep changes minimal and focused.",
        ),
        "tester" => Some(
            "You are writing tests. Cover the happy path, edge cases, and \
             error handling with the project's test framework, then run them.",
        ),
        "reviewer" => Some(
            "You are reviewing code. Look for bugs, security issues, \
             performance problems, and pattern violations. Report findings; \
             do not modify files.",
        ),
        _ => None,
    }
}

/// Reject target files that could escape the project root.
fn validate_target_files(files: &[String]) -> Result<(), RunnerError> {
    for file in files {
        if file.is_empty() {
            return Err(RunnerError::InvalidTask("empty target file path".to_string()));
        }
        let path = Path::new(file);
        if path.is_absolute() {
            return Err(RunnerError::InvalidTask(format!(
                "target file must be relative to the project root: {}",
                file
            )));
        }
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(RunnerError::InvalidTask(format!(
                "target file escapes the project root: {}",
                file
            )));
        }
    }
    Ok(())
}

fn flag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-{1,2}[A-Za-z0-9][A-Za-z0-9_\-]*$").unwrap())
}

fn value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9@._:/\\\-]+$").unwrap())
}

/// Keep the last `max` bytes of `s`, respecting char boundaries.
fn tail(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
