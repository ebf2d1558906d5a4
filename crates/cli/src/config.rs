//! Operator configuration, loaded from `foreman.toml` in the project root.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use foreman_runner::CommandRunnerConfig;
use foreman_storage::OrphanPolicy;
use foreman_watcher::WatcherConfig;
use serde::Deserialize;

/// Name of the config file looked up in the project root.
pub const CONFIG_FILE: &str = "foreman.toml";

/// Contents written by `foreman init`.
pub const DEFAULT_CONFIG: &str = r#"# foreman configuration

[queue]
# Where the task partitions live, relative to the project root.
root = ".foreman/queue"

[watcher]
poll_interval_secs = 3
max_concurrent_tasks = 1
task_timeout_secs = 300
# Defaults to 2x task_timeout_secs when unset.
# orphan_max_age_secs = 600
# "fail" leaves orphans for the producer to resubmit; "requeue" retries them.
orphan_policy = "fail"

[runner]
command = "copilot"
model = "gpt-5-mini"
allow_all_tools = false
allow_all_paths = false
extra_args = []
"#;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue location
    pub queue: QueueSection,
    /// Watcher loop settings
    pub watcher: WatcherSection,
    /// Agent CLI runner settings
    pub runner: CommandRunnerConfig,
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Partition directory, relative to the project root
    pub root: PathBuf,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".foreman/queue"),
        }
    }
}

/// `[watcher]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    /// Seconds between queue polls
    pub poll_interval_secs: u64,
    /// Max tasks dispatched at once
    pub max_concurrent_tasks: usize,
    /// Per-task deadline in seconds
    pub task_timeout_secs: u64,
    /// Age in seconds after which a RUNNING record counts as abandoned
    pub orphan_max_age_secs: Option<u64>,
    /// Orphan recovery policy
    pub orphan_policy: OrphanPolicy,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            max_concurrent_tasks: 1,
            task_timeout_secs: 300,
            orphan_max_age_secs: None,
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl Config {
    /// Load config from the project root, falling back to defaults when the
    /// file does not exist.
    pub fn load(project_root: &Path) -> anyhow::Result<Self> {
        let path = project_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Absolute queue root for a given project root.
    pub fn queue_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.queue.root)
    }

    /// Translate the `[watcher]` section into a [`WatcherConfig`].
    pub fn watcher_config(&self) -> WatcherConfig {
        let w = &self.watcher;
        let task_timeout = Duration::from_secs(w.task_timeout_secs);
        let max_age = w
            .orphan_max_age_secs
            .map(Duration::from_secs)
            .unwrap_or(task_timeout * 2);
        WatcherConfig::new()
            .with_poll_interval(Duration::from_secs(w.poll_interval_secs))
            .with_max_concurrent(
                NonZeroUsize::new(w.max_concurrent_tasks).unwrap_or(NonZeroUsize::MIN),
            )
            .with_task_timeout(task_timeout)
            .with_orphan_max_age(max_age)
            .with_orphan_policy(w.orphan_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.queue.root, PathBuf::from(".foreman/queue"));
        assert_eq!(config.watcher.poll_interval_secs, 3);
        assert_eq!(config.watcher.max_concurrent_tasks, 1);
        assert_eq!(config.runner.command, "copilot");
    }

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.watcher.task_timeout_secs, 300);
        assert_eq!(config.watcher.orphan_policy, OrphanPolicy::Fail);
        assert!(!config.runner.allow_all_tools);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[watcher]\nmax_concurrent_tasks = 4\norphan_policy = \"requeue\"\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.watcher.max_concurrent_tasks, 4);
        assert_eq!(config.watcher.orphan_policy, OrphanPolicy::Requeue);
        // Untouched sections keep their defaults.
        assert_eq!(config.watcher.poll_interval_secs, 3);
        assert_eq!(config.queue.root, PathBuf::from(".foreman/queue"));
    }

    #[test]
    fn test_orphan_age_defaults_to_twice_timeout() {
        let config = Config::default();
        let watcher = config.watcher_config();
        assert_eq!(watcher.orphan_max_age, watcher.task_timeout * 2);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[watcher]\norphan_max_age_secs = 60\n",
        )
        .unwrap();
        let watcher = Config::load(dir.path()).unwrap().watcher_config();
        assert_eq!(watcher.orphan_max_age, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_concurrency_clamped_to_one() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[watcher]\nmax_concurrent_tasks = 0\n",
        )
        .unwrap();
        let watcher = Config::load(dir.path()).unwrap().watcher_config();
        assert_eq!(watcher.max_concurrent_tasks.get(), 1);
    }
}
