//! The foreman watcher daemon.
//!
//! Polls the task store for pending work, claims it, dispatches it to a
//! runner under a deadline, and records the outcome. Several watcher
//! processes can share one store; the store's atomic claim keeps them from
//! executing the same task twice.

#![warn(missing_docs)]

mod config;
mod watcher;

pub use config::WatcherConfig;
pub use watcher::{Watcher, WatcherError, WatcherHandle};
