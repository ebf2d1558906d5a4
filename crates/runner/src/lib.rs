//! Execution backends for foreman tasks.
//!
//! The watcher drives everything through the [`Runner`] trait; concrete
//! backends translate a task into an invocation of some agent and report a
//! free-text result. The bundled [`CommandRunner`] shells out to an external
//! agent CLI.

#![warn(missing_docs)]

mod command;
mod trait_;

pub use command::{CommandRunner, CommandRunnerConfig};
pub use trait_::{RunContext, Runner, RunnerError};
