//! The directory-backed task store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use foreman_core::{ClaimFilter, Task, TaskId, TaskSpec, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

const QUARANTINE_DIR: &str = "quarantine";

/// What to do with tasks left in `running/` by a crashed watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Move to `failed/` with a synthetic "orphaned:" error; the producer
    /// decides whether to resubmit.
    #[default]
    Fail,
    /// Move back to `pending/` so the next watcher re-executes it.
    Requeue,
}

/// Per-partition record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Records waiting to be claimed
    pub pending: usize,
    /// Records claimed by a watcher
    pub running: usize,
    /// Records finished successfully
    pub completed: usize,
    /// Records finished with an error
    pub failed: usize,
}

impl QueueStats {
    /// Total records across all partitions.
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

/// File-based task queue rooted at a given directory.
///
/// All state transitions are single filesystem renames between partitions,
/// so any number of producer and watcher processes can share one store; the
/// rename is the only mutual exclusion needed.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    /// Open a store, creating the partition directories if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for status in TaskStatus::ALL {
            fs::create_dir_all(root.join(status.dir_name())).await?;
        }
        Ok(Self { root })
    }

    /// The queue root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, status: TaskStatus) -> PathBuf {
        self.root.join(status.dir_name())
    }

    fn path_for(&self, status: TaskStatus, id: TaskId) -> PathBuf {
        self.dir_for(status).join(format!("{}.json", id))
    }

    // === Producer API ===

    /// Build a task from a spec and persist it as PENDING.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task> {
        let task = Task::new(spec);
        self.create(&task).await?;
        info!("submitted task {}", task);
        Ok(task)
    }

    /// Persist a new PENDING record.
    ///
    /// The unit is written to a temporary file and renamed into place, so
    /// other processes see it complete or not at all.
    pub async fn create(&self, task: &Task) -> Result<()> {
        if self.locate(task.id).await?.is_some() {
            return Err(StoreError::DuplicateId(task.id));
        }
        let dest = self.path_for(TaskStatus::Pending, task.id);
        self.write_unit(&dest, task).await?;
        debug!("created task {} at {}", task.id, dest.display());
        Ok(())
    }

    /// Load a task by id from whichever partition holds it.
    pub async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let Some((status, path)) = self.locate(id).await? else {
            return Ok(None);
        };
        match self.load_unit(&path, status).await {
            Ok(task) => Ok(Some(task)),
            // Moved between locate and read; the caller sees the next snapshot.
            Err(StoreError::Io(e)) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List tasks, optionally restricted to one status.
    ///
    /// Sorted by priority (descending) then creation time (ascending).
    /// A read-only snapshot; concurrent claims are not blocked.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let statuses: Vec<TaskStatus> = match status {
            Some(s) => vec![s],
            None => TaskStatus::ALL.to_vec(),
        };
        let mut tasks = Vec::new();
        for s in statuses {
            tasks.extend(self.scan_partition(s).await?);
        }
        sort_queue(&mut tasks);
        Ok(tasks)
    }

    // === Claim / terminal transitions ===

    /// Claim the best eligible PENDING task, moving it to RUNNING.
    ///
    /// Selection is highest priority first, oldest first within a priority.
    /// The claim itself is a rename from `pending/` into `running/`; when the
    /// source is already gone another claimant won the race and the next
    /// candidate is tried. Returns `None` once no eligible task remains.
    pub async fn claim_next(&self, filter: Option<&ClaimFilter>) -> Result<Option<Task>> {
        let mut candidates = self.scan_partition(TaskStatus::Pending).await?;
        sort_queue(&mut candidates);

        for mut task in candidates {
            if let Some(f) = filter {
                if !f.matches(&task) {
                    continue;
                }
            }

            let src = self.path_for(TaskStatus::Pending, task.id);
            let dst = self.path_for(TaskStatus::Running, task.id);
            match fs::rename(&src, &dst).await {
                Ok(()) => {
                    // The rename made us the exclusive owner; record the claim.
                    task.mark_running()?;
                    self.write_unit(&dst, &task).await?;
                    info!("claimed task {} -> RUNNING", task.id);
                    return Ok(Some(task));
                }
                Err(e) if is_not_found(&e) => {
                    debug!("claim race lost for task {}, trying next", task.id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Move a RUNNING task to COMPLETED with the backend's output.
    pub async fn complete(&self, id: TaskId, result: impl Into<String>) -> Result<Task> {
        let mut task = self.take_running(id, TaskStatus::Completed).await?;
        task.mark_completed(result)?;
        self.write_unit(&self.path_for(TaskStatus::Completed, id), &task)
            .await?;
        info!("task {} COMPLETED", id);
        Ok(task)
    }

    /// Move a RUNNING task to FAILED with an error message.
    pub async fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<Task> {
        let mut task = self.take_running(id, TaskStatus::Failed).await?;
        task.mark_failed(error)?;
        self.write_unit(&self.path_for(TaskStatus::Failed, id), &task)
            .await?;
        info!("task {} FAILED", id);
        Ok(task)
    }

    // === Recovery / maintenance ===

    /// Recover tasks stuck in `running/` longer than `max_age`.
    ///
    /// These are assumed abandoned by a crashed watcher. Depending on the
    /// policy they are failed with an `orphaned:` error (default) or requeued
    /// to `pending/`. Returns the ids that were recovered.
    pub async fn recover_orphans(
        &self,
        max_age: Duration,
        policy: OrphanPolicy,
    ) -> Result<Vec<TaskId>> {
        let now = chrono::Utc::now();
        let mut recovered = Vec::new();

        for mut task in self.scan_partition(TaskStatus::Running).await? {
            let claimed = task.claimed_at.unwrap_or(task.created_at);
            let age = now.signed_duration_since(claimed);
            let expired = age.to_std().map(|a| a > max_age).unwrap_or(false);
            if !expired {
                continue;
            }

            let src = self.path_for(TaskStatus::Running, task.id);
            let to = match policy {
                OrphanPolicy::Fail => TaskStatus::Failed,
                OrphanPolicy::Requeue => TaskStatus::Pending,
            };
            let dst = self.path_for(to, task.id);
            match fs::rename(&src, &dst).await {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {
                    // Another recoverer or the owning watcher got there first.
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            match policy {
                OrphanPolicy::Fail => {
                    task.mark_failed(format!(
                        "orphaned: claimed at {} with no live watcher",
                        claimed.to_rfc3339()
                    ))?;
                }
                OrphanPolicy::Requeue => {
                    task.mark_requeued()?;
                }
            }
            self.write_unit(&dst, &task).await?;
            warn!("recovered orphaned task {} -> {}", task.id, task.status);
            recovered.push(task.id);
        }

        Ok(recovered)
    }

    /// Count records per partition.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.count_units(TaskStatus::Pending).await?,
            running: self.count_units(TaskStatus::Running).await?,
            completed: self.count_units(TaskStatus::Completed).await?,
            failed: self.count_units(TaskStatus::Failed).await?,
        })
    }

    /// Remove all COMPLETED records. Returns the number removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        self.clear_partition(TaskStatus::Completed).await
    }

    /// Remove all FAILED records. Returns the number removed.
    pub async fn clear_failed(&self) -> Result<usize> {
        self.clear_partition(TaskStatus::Failed).await
    }

    // === Internals ===

    /// Locate the partition currently holding `id`.
    async fn locate(&self, id: TaskId) -> Result<Option<(TaskStatus, PathBuf)>> {
        for status in TaskStatus::ALL {
            let path = self.path_for(status, id);
            if fs::try_exists(&path).await? {
                return Ok(Some((status, path)));
            }
        }
        Ok(None)
    }

    /// Atomically publish a unit: write a sibling temp file, then rename.
    async fn write_unit(&self, path: &Path, task: &Task) -> Result<()> {
        let json = serde_json::to_string_pretty(task)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read a unit, treating the partition as the authoritative status.
    async fn load_unit(&self, path: &Path, partition: TaskStatus) -> Result<Task> {
        let text = fs::read_to_string(path).await.map_err(StoreError::Io)?;
        let mut task: Task = serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        if task.status != partition {
            warn!(
                "task {} unit in {}/ carries status {}; partition wins",
                task.id,
                partition.dir_name(),
                task.status
            );
            task.status = partition;
        }
        Ok(task)
    }

    /// Read every unit in a partition, quarantining unparsable ones.
    async fn scan_partition(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let dir = self.dir_for(status);
        let mut rd = fs::read_dir(&dir).await?;
        let mut tasks = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.load_unit(&path, status).await {
                Ok(task) => tasks.push(task),
                Err(StoreError::Malformed { path, source }) => {
                    warn!("skipping malformed task unit {}: {}", path.display(), source);
                    self.quarantine(&path).await;
                }
                // Claimed away between readdir and read.
                Err(StoreError::Io(e)) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    /// Move a malformed unit aside so it stops poisoning scans. Best effort.
    async fn quarantine(&self, path: &Path) {
        let qdir = self.root.join(QUARANTINE_DIR);
        if let Err(e) = fs::create_dir_all(&qdir).await {
            warn!("could not create {}: {}", qdir.display(), e);
            return;
        }
        let Some(name) = path.file_name() else {
            return;
        };
        let dst = qdir.join(name);
        match fs::rename(path, &dst).await {
            Ok(()) => warn!("quarantined {} -> {}", path.display(), dst.display()),
            Err(e) if is_not_found(&e) => {
                debug!("malformed unit {} vanished before quarantine", path.display());
            }
            Err(e) => warn!("failed to quarantine {}: {}", path.display(), e),
        }
    }

    /// Rename a RUNNING unit into a terminal partition and return its record.
    ///
    /// The rename is the commitment point; callers rewrite the unit's content
    /// immediately afterwards.
    async fn take_running(&self, id: TaskId, to: TaskStatus) -> Result<Task> {
        let src = self.path_for(TaskStatus::Running, id);
        let task = match self.load_unit(&src, TaskStatus::Running).await {
            Ok(task) => task,
            Err(StoreError::Io(e)) if is_not_found(&e) => {
                return Err(self.not_running(id).await)
            }
            Err(e) => return Err(e),
        };
        let dst = self.path_for(to, id);
        match fs::rename(&src, &dst).await {
            Ok(()) => Ok(task),
            Err(e) if is_not_found(&e) => Err(self.not_running(id).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Explain why a record could not be taken from `running/`.
    async fn not_running(&self, id: TaskId) -> StoreError {
        match self.locate(id).await {
            Ok(Some((status, _))) => StoreError::NotRunning { id, status },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn count_units(&self, status: TaskStatus) -> Result<usize> {
        let mut rd = fs::read_dir(self.dir_for(status)).await?;
        let mut count = 0;
        while let Some(entry) = rd.next_entry().await? {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("json") {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn clear_partition(&self, status: TaskStatus) -> Result<usize> {
        let mut rd = fs::read_dir(self.dir_for(status)).await?;
        let mut count = 0;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => count += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }
}

/// Queue order: priority descending, then oldest first, then id.
fn sort_queue(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}
