//! The claim -> execute -> record loop.

use std::sync::Arc;

use foreman_core::{ClaimFilter, Task};
use foreman_runner::{RunContext, Runner};
use foreman_storage::{StoreError, TaskStore};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::WatcherConfig;

/// Errors fatal to the watcher process.
///
/// Per-task failures are written into the task record and never surface
/// here; only losing the store itself stops the loop.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// The task store became unusable
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
}

/// Remote control for a running [`Watcher`].
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl WatcherHandle {
    /// Ask the watcher to stop. In-flight dispatches finish (or hit their
    /// deadline) before `run` returns.
    pub fn shutdown(&self) {
        // Receivers may be gone if the loop already exited.
        let _ = self.shutdown.send(true);
    }
}

/// Polling daemon that drives tasks from PENDING to a terminal state.
pub struct Watcher {
    store: TaskStore,
    runner: Arc<dyn Runner>,
    ctx: RunContext,
    config: WatcherConfig,
    filter: Option<ClaimFilter>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Watcher {
    /// Create a watcher over a store and a runner.
    pub fn new(
        store: TaskStore,
        runner: Arc<dyn Runner>,
        ctx: RunContext,
        config: WatcherConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            runner,
            ctx,
            config,
            filter: None,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Restrict this watcher to a subset of the queue.
    pub fn with_claim_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Get a handle for stopping the watcher from another task.
    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run until shut down. Blocks the calling task.
    pub async fn run(&self) -> Result<(), WatcherError> {
        info!(
            "watcher started: root={} poll={:?} max_concurrent={} timeout={:?}",
            self.store.root().display(),
            self.config.poll_interval,
            self.config.max_concurrent_tasks,
            self.config.task_timeout,
        );

        // Tasks stranded by a crashed watcher are resolved before any new
        // claims happen.
        let recovered = self
            .store
            .recover_orphans(self.config.orphan_max_age, self.config.orphan_policy)
            .await?;
        if !recovered.is_empty() {
            info!("recovered {} orphaned task(s) at startup", recovered.len());
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            reap_finished(&mut in_flight);
            self.fill_capacity(&mut in_flight).await?;

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        if !in_flight.is_empty() {
            info!(
                "watcher stopping; waiting for {} in-flight task(s)",
                in_flight.len()
            );
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        info!("watcher stopped");
        Ok(())
    }

    /// Claim tasks until every dispatch slot is used or the queue is empty.
    async fn fill_capacity(&self, in_flight: &mut JoinSet<()>) -> Result<(), WatcherError> {
        while in_flight.len() < self.config.max_concurrent_tasks.get() {
            match self.store.claim_next(self.filter.as_ref()).await? {
                Some(task) => self.dispatch(task, in_flight),
                None => break,
            }
        }
        Ok(())
    }

    /// Run one claimed task under the deadline and record its outcome.
    fn dispatch(&self, task: Task, in_flight: &mut JoinSet<()>) {
        let store = self.store.clone();
        let runner = Arc::clone(&self.runner);
        let ctx = self.ctx.clone();
        let deadline = self.config.task_timeout;

        in_flight.spawn(async move {
            let id = task.id;
            info!("executing {}", task);

            let outcome = tokio::time::timeout(deadline, runner.execute(&task, &ctx)).await;
            let transition = match outcome {
                Ok(Ok(output)) => {
                    info!("task {} succeeded", id);
                    store.complete(id, output).await
                }
                Ok(Err(err)) => {
                    warn!("task {} failed: {}", id, err);
                    store.fail(id, err.to_string()).await
                }
                Err(_) => {
                    // Dropping the execute future cancels the backend;
                    // the store transition is authoritative regardless.
                    warn!("task {} hit its {:?} deadline", id, deadline);
                    store
                        .fail(id, format!("timed out after {}s", deadline.as_secs()))
                        .await
                }
            };

            if let Err(e) = transition {
                error!("could not record outcome for task {}: {}", id, e);
            }
        });
    }
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.try_join_next() {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("dispatch task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_core::{TaskId, TaskSpec, TaskStatus};
    use foreman_runner::RunnerError;
    use foreman_storage::OrphanPolicy;
    use std::num::NonZeroUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted runner for loop tests.
    struct MockRunner {
        delay: Duration,
        fail: bool,
        executed: Mutex<Vec<TaskId>>,
    }

    impl MockRunner {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail: false,
                executed: Mutex::new(Vec::new()),
            }
        }

        fn failing(delay: Duration) -> Self {
            Self {
                fail: true,
                ..Self::new(delay)
            }
        }

        fn executed(&self) -> Vec<TaskId> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Runner for MockRunner {
        async fn execute(&self, task: &Task, _ctx: &RunContext) -> Result<String, RunnerError> {
            tokio::time::sleep(self.delay).await;
            self.executed.lock().unwrap().push(task.id);

            // Instructions starting with "hang" never return.
            if task.instructions.starts_with("hang") {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(RunnerError::Backend("mock failure".to_string()));
            }
            Ok(format!("mock completed: {}", task.instructions))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: TaskStore,
        runner: Arc<MockRunner>,
        watcher: Arc<Watcher>,
    }

    async fn fixture(runner: MockRunner, config: WatcherConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("queue")).await.unwrap();
        let runner = Arc::new(runner);
        let watcher = Arc::new(Watcher::new(
            store.clone(),
            Arc::clone(&runner) as Arc<dyn Runner>,
            RunContext::new(dir.path()),
            config,
        ));
        Fixture {
            _dir: dir,
            store,
            runner,
            watcher,
        }
    }

    fn quick_config() -> WatcherConfig {
        WatcherConfig::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_task_timeout(Duration::from_secs(5))
    }

    /// Poll the store until the task reaches a terminal state.
    async fn wait_terminal(store: &TaskStore, id: TaskId) -> Task {
        for _ in 0..200 {
            if let Some(task) = store.get(id).await.unwrap() {
                if task.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never reached a terminal state", id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_completes_via_watcher() {
        let f = fixture(MockRunner::new(Duration::from_millis(10)), quick_config()).await;

        let task = f
            .store
            .submit(TaskSpec::new("write a hello world function"))
            .await
            .unwrap();

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        let done = wait_terminal(&f.store, task.id).await;
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.result.as_deref().unwrap().contains("mock completed"));
        assert_eq!(f.runner.executed(), vec![task.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_task_recorded() {
        let f = fixture(
            MockRunner::failing(Duration::from_millis(10)),
            quick_config(),
        )
        .await;

        let task = f.store.submit(TaskSpec::new("doomed work")).await.unwrap();

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        let done = wait_terminal(&f.store, task.id).await;
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("mock failure"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_priority_order_respected() {
        let f = fixture(MockRunner::new(Duration::from_millis(10)), quick_config()).await;

        let low = f
            .store
            .submit(TaskSpec::new("low priority work"))
            .await
            .unwrap();
        let high = f
            .store
            .submit(TaskSpec::new("urgent work").with_priority(10))
            .await
            .unwrap();

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        wait_terminal(&f.store, low.id).await;
        wait_terminal(&f.store, high.id).await;
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert_eq!(f.runner.executed(), vec![high.id, low.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_fails_task_and_frees_slot() {
        let config = quick_config().with_task_timeout(Duration::from_millis(100));
        let f = fixture(MockRunner::new(Duration::from_millis(1)), config).await;

        let hanging = f.store.submit(TaskSpec::new("hang forever")).await.unwrap();

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        let done = wait_terminal(&f.store, hanging.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("timed out"));

        // The slot is free again: the next task still runs to completion.
        let next = f.store.submit(TaskSpec::new("normal work")).await.unwrap();
        let done = wait_terminal(&f.store, next.id).await;
        assert_eq!(done.status, TaskStatus::Completed);

        handle.shutdown();
        join.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_orphans_recovered_before_new_claims() {
        let config = quick_config().with_orphan_max_age(Duration::ZERO);
        let f = fixture(MockRunner::new(Duration::from_millis(10)), config).await;

        // A task claimed by a "crashed" watcher: claimed, then nobody drives it.
        let stranded = f.store.submit(TaskSpec::new("left behind")).await.unwrap();
        f.store.claim_next(None).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        let done = wait_terminal(&f.store, stranded.id).await;
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.as_deref().unwrap().starts_with("orphaned:"));
        // The orphan was resolved, not re-executed.
        assert!(f.runner.executed().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requeued_orphan_is_executed() {
        let config = quick_config()
            .with_orphan_max_age(Duration::ZERO)
            .with_orphan_policy(OrphanPolicy::Requeue);
        let f = fixture(MockRunner::new(Duration::from_millis(10)), config).await;

        let stranded = f.store.submit(TaskSpec::new("try me again")).await.unwrap();
        f.store.claim_next(None).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        let done = wait_terminal(&f.store, stranded.id).await;
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(f.runner.executed(), vec![stranded.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_in_flight_work() {
        let f = fixture(MockRunner::new(Duration::from_millis(200)), quick_config()).await;

        let task = f.store.submit(TaskSpec::new("slow work")).await.unwrap();

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        // Wait until the task has been claimed, then stop immediately.
        for _ in 0..100 {
            let current = f.store.get(task.id).await.unwrap().unwrap();
            if current.status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown();
        join.await.unwrap().unwrap();

        // Controlled shutdown never strands a claimed task.
        let final_state = f.store.get(task.id).await.unwrap().unwrap();
        assert_eq!(final_state.status, TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_claim_filter_limits_watcher_to_its_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("queue")).await.unwrap();
        let runner = Arc::new(MockRunner::new(Duration::from_millis(10)));
        let watcher = Arc::new(
            Watcher::new(
                store.clone(),
                Arc::clone(&runner) as Arc<dyn Runner>,
                RunContext::new(dir.path()),
                quick_config(),
            )
            .with_claim_filter(ClaimFilter {
                action: None,
                backend: Some("tester".to_string()),
            }),
        );

        let other = store
            .submit(TaskSpec::new("default work").with_priority(10))
            .await
            .unwrap();
        let routed = store
            .submit(TaskSpec::new("tester work").with_backend("tester"))
            .await
            .unwrap();

        let watcher_task = Arc::clone(&watcher);
        let handle = watcher.handle();
        let join = tokio::spawn(async move { watcher_task.run().await });

        let done = wait_terminal(&store, routed.id).await;
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        // The unrouted task was never touched, despite its higher priority.
        let untouched = store.get(other.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Pending);
        assert_eq!(runner.executed(), vec![routed.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bound_holds() {
        let config = quick_config()
            .with_max_concurrent(NonZeroUsize::new(2).unwrap());
        let f = fixture(MockRunner::new(Duration::from_millis(100)), config).await;

        for i in 0..6 {
            f.store
                .submit(TaskSpec::new(format!("job {}", i)))
                .await
                .unwrap();
        }

        let watcher = Arc::clone(&f.watcher);
        let handle = f.watcher.handle();
        let join = tokio::spawn(async move { watcher.run().await });

        // At no observed instant are more than two tasks running.
        let mut max_running = 0;
        for _ in 0..100 {
            let stats = f.store.stats().await.unwrap();
            max_running = max_running.max(stats.running);
            if stats.completed == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown();
        join.await.unwrap().unwrap();

        assert!(max_running <= 2, "saw {} tasks running at once", max_running);
        assert_eq!(f.store.stats().await.unwrap().completed, 6);
    }
}
