//! foreman CLI - delegate tasks to AI agent backends through a filesystem queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use foreman_core::{TaskAction, TaskId, TaskSpec, TaskStatus};
use foreman_runner::{CommandRunner, RunContext, Runner};
use foreman_storage::TaskStore;
use foreman_watcher::Watcher;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, CONFIG_FILE, DEFAULT_CONFIG};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Delegate tasks to agent backends through a filesystem queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root directory
    #[arg(short, long, default_value = ".")]
    project_root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the queue directories and a default foreman.toml
    Init,
    /// Submit a task to the queue
    Submit {
        /// What the agent should do
        instructions: String,
        /// Files the agent should focus on
        #[arg(short, long, num_args = 0..)]
        files: Vec<String>,
        /// Extra context for the agent
        #[arg(short, long, default_value = "")]
        context: String,
        /// Kind of work: implement, test, refactor, fix, document, review, custom
        #[arg(short, long, default_value = "implement")]
        action: TaskAction,
        /// Backend selector to route to (implementer, tester, reviewer)
        #[arg(short, long, default_value = "")]
        backend: String,
        /// Priority (0 = normal, higher = more urgent)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
    },
    /// Resubmit a failed task with new instructions
    Retry {
        /// Id of the failed task
        task_id: TaskId,
        /// New instructions for the fresh task
        #[arg(short, long)]
        instructions: String,
    },
    /// Show a task's current state
    Status {
        /// Task id to check
        task_id: TaskId,
    },
    /// List tasks
    List {
        /// Filter by status: pending, running, completed, failed
        #[arg(short, long)]
        status: Option<TaskStatus>,
    },
    /// Show per-partition record counts
    Stats,
    /// Run the watcher daemon until interrupted
    Watch,
    /// Remove terminal records
    Clear {
        /// Which partition to clear
        target: ClearTarget,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClearTarget {
    Completed,
    Failed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.project_root)?;
    let queue_root = config.queue_root(&cli.project_root);

    match cli.command {
        Commands::Init => {
            TaskStore::open(&queue_root).await?;
            println!("created queue at {}", queue_root.display());

            let config_path = cli.project_root.join(CONFIG_FILE);
            if config_path.exists() {
                println!("{} already exists, skipped", CONFIG_FILE);
            } else {
                std::fs::write(&config_path, DEFAULT_CONFIG)?;
                println!("created {}", CONFIG_FILE);
            }
            println!();
            println!("next steps:");
            println!("  1. point [runner] in {} at your agent CLI", CONFIG_FILE);
            println!("  2. run: foreman watch");
        }
        Commands::Submit {
            instructions,
            files,
            context,
            action,
            backend,
            priority,
        } => {
            let store = TaskStore::open(&queue_root).await?;
            let task = store
                .submit(
                    TaskSpec::new(instructions)
                        .with_target_files(files)
                        .with_context(context)
                        .with_action(action)
                        .with_backend(backend)
                        .with_priority(priority),
                )
                .await?;

            println!("submitted {}", task);
            println!("  track with: foreman status {}", task.id);
        }
        Commands::Retry {
            task_id,
            instructions,
        } => {
            let store = TaskStore::open(&queue_root).await?;
            let Some(old) = store.get(task_id).await? else {
                anyhow::bail!("task {} not found", task_id);
            };
            if old.status != TaskStatus::Failed {
                anyhow::bail!("task {} is {}, only FAILED tasks can be retried", task_id, old.status);
            }

            let task = store
                .submit(
                    TaskSpec::new(instructions)
                        .with_target_files(old.target_files)
                        .with_context(old.context)
                        .with_action(old.action)
                        .with_backend(old.backend)
                        .with_priority(old.priority),
                )
                .await?;

            println!("retried {} as {}", task_id, task.id);
            println!("  track with: foreman status {}", task.id);
        }
        Commands::Status { task_id } => {
            let store = TaskStore::open(&queue_root).await?;
            let Some(task) = store.get(task_id).await? else {
                anyhow::bail!("task {} not found", task_id);
            };

            println!("task {}", task.id);
            println!("  status:    {}", task.status);
            println!("  action:    {}", task.action);
            if !task.backend.is_empty() {
                println!("  backend:   @{}", task.backend);
            }
            println!("  priority:  {}", task.priority);
            if !task.target_files.is_empty() {
                println!("  files:     {}", task.target_files.join(", "));
            }
            println!("  created:   {}", task.created_at);
            if let Some(at) = task.completed_at {
                println!("  finished:  {}", at);
            }
            if let Some(result) = &task.result {
                println!("  result:    {}", first_lines(result, 5));
            }
            if let Some(error) = &task.error {
                println!("  error:     {}", error);
            }
        }
        Commands::List { status } => {
            let store = TaskStore::open(&queue_root).await?;
            let tasks = store.list(status).await?;

            if tasks.is_empty() {
                println!("no tasks found");
                return Ok(());
            }
            println!("tasks ({})", tasks.len());
            for task in tasks {
                println!("  {} | {} | {}", task.status, task.priority, task);
            }
        }
        Commands::Stats => {
            let store = TaskStore::open(&queue_root).await?;
            let stats = store.stats().await?;

            println!("queue {}", queue_root.display());
            println!("  pending:   {}", stats.pending);
            println!("  running:   {}", stats.running);
            println!("  completed: {}", stats.completed);
            println!("  failed:    {}", stats.failed);
            println!("  total:     {}", stats.total());
        }
        Commands::Watch => {
            let store = TaskStore::open(&queue_root).await?;
            let runner: Arc<dyn Runner> = Arc::new(CommandRunner::new(config.runner.clone()));
            let ctx = RunContext::new(&cli.project_root);
            let watcher = Watcher::new(store, runner, ctx, config.watcher_config());

            let handle = watcher.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    println!("shutdown requested, letting in-flight tasks finish");
                    handle.shutdown();
                }
            });

            watcher.run().await?;
            info!("watcher exited cleanly");
        }
        Commands::Clear { target } => {
            let store = TaskStore::open(&queue_root).await?;
            let removed = match target {
                ClearTarget::Completed => store.clear_completed().await?,
                ClearTarget::Failed => store.clear_failed().await?,
            };
            println!("removed {} record(s)", removed);
        }
    }

    Ok(())
}

/// First `n` lines of a result blob, for compact status output.
fn first_lines(text: &str, n: usize) -> String {
    let mut lines: Vec<&str> = text.lines().take(n).collect();
    if text.lines().count() > n {
        lines.push("…");
    }
    lines.join("\n             ")
}
