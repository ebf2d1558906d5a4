//! Watcher tuning knobs.

use std::num::NonZeroUsize;
use std::time::Duration;

use foreman_storage::OrphanPolicy;

/// Configuration for the watcher loop.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Delay between queue polls
    pub poll_interval: Duration,
    /// Max tasks dispatched at once
    pub max_concurrent_tasks: NonZeroUsize,
    /// Deadline for a single task
    pub task_timeout: Duration,
    /// Age at which a RUNNING record counts as abandoned
    pub orphan_max_age: Duration,
    /// What to do with abandoned records on startup
    pub orphan_policy: OrphanPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        let task_timeout = Duration::from_secs(300); // 5 minutes
        Self {
            poll_interval: Duration::from_secs(3),
            max_concurrent_tasks: NonZeroUsize::MIN,
            task_timeout,
            orphan_max_age: task_timeout * 2,
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl WatcherConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the concurrency bound.
    pub fn with_max_concurrent(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the per-task deadline.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the orphan age threshold.
    pub fn with_orphan_max_age(mut self, max_age: Duration) -> Self {
        self.orphan_max_age = max_age;
        self
    }

    /// Set the orphan recovery policy.
    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }
}
