//! File-based task storage implementation
//!
//! One JSON file per task, located in the directory of its lifecycle area.
//! Moving a task between areas is a single `rename`, so a record is never
//! observable in two areas at once or in none.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, info, warn};

use super::model::{MemoryContext, Task, TaskId, TaskResult, TaskStatus};
use super::repository::{TaskRepository, TaskStats};
use crate::paths::{write_json_atomic, MementoPaths};
use crate::{Error, Result};

/// Attempts made to find a record that may be moving between areas
const LOCATE_ATTEMPTS: usize = 3;

/// File-based task store
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    paths: MementoPaths,
}

impl FileTaskStore {
    /// Create a store over an existing layout
    pub fn new(paths: MementoPaths) -> Self {
        Self { paths }
    }

    /// Create a store, making sure the area directories exist
    pub async fn open(paths: MementoPaths) -> Result<Self> {
        paths.ensure().await?;
        Ok(Self::new(paths))
    }

    pub fn paths(&self) -> &MementoPaths {
        &self.paths
    }

    fn record_path(&self, area: TaskStatus, id: &TaskId) -> PathBuf {
        self.paths.area_dir(area).join(id.file_name())
    }

    async fn write_record(&self, area: TaskStatus, task: &Task) -> Result<()> {
        write_json_atomic(&self.record_path(area, &task.id), task).await
    }

    /// Try each source area in turn and rename the record into `target`.
    /// Returns the area it came from.
    async fn relocate(
        &self,
        id: &TaskId,
        sources: &[TaskStatus],
        target: TaskStatus,
    ) -> Result<Option<TaskStatus>> {
        let to = self.record_path(target, id);
        for &area in sources {
            let from = self.record_path(area, id);
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {
                    debug!(task_id = %id, from = %area, to = %target, "Relocated task record");
                    return Ok(Some(area));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".json") && !name.starts_with('.')
}

/// Read a record, treating the area it was found in as its status
async fn read_record(path: &Path, area: TaskStatus) -> Result<Task> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut task: Task = serde_json::from_str(&content)?;
    if task.status != area {
        debug!(
            task_id = %task.id,
            recorded = %task.status,
            area = %area,
            "Record status lags its area, using the area"
        );
        task.status = area;
    }
    Ok(task)
}

/// Stand-in for a record that exists but cannot be parsed
fn unreadable_placeholder(id: &TaskId) -> Task {
    let mut task = Task::new("<unreadable task record>", MemoryContext::new());
    task.id = id.clone();
    task
}

#[async_trait]
impl TaskRepository for FileTaskStore {
    async fn create(&self, description: &str, memory_context: MemoryContext) -> Result<Task> {
        for _ in 0..LOCATE_ATTEMPTS {
            let task = Task::new(description, memory_context.clone());
            if self.locate(&task.id).await?.is_some() {
                warn!(task_id = %task.id, "Generated task id collides, regenerating");
                continue;
            }
            self.write_record(TaskStatus::Pending, &task).await?;
            info!(task_id = %task.id, "Created task");
            return Ok(task);
        }
        Err(Error::Storage("Could not allocate a unique task id".to_string()))
    }

    async fn enqueue(&self, mut task: Task) -> Result<Task> {
        if self.locate(&task.id).await?.is_some() {
            return Err(Error::InvalidInput(format!(
                "Task with ID {} already exists",
                task.id
            )));
        }
        task.status = TaskStatus::Pending;
        self.write_record(TaskStatus::Pending, &task).await?;
        info!(task_id = %task.id, attempt = task.attempt, "Enqueued task");
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        for _ in 0..LOCATE_ATTEMPTS {
            for area in TaskStatus::ALL {
                match self.load(area, id).await {
                    Ok(task) => return Ok(Some(task)),
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    async fn load(&self, area: TaskStatus, id: &TaskId) -> Result<Task> {
        match read_record(&self.record_path(area, id), area).await {
            Err(e) if e.is_not_found() => Err(Error::TaskNotFound(id.to_string())),
            other => other,
        }
    }

    async fn locate(&self, id: &TaskId) -> Result<Option<TaskStatus>> {
        for _ in 0..LOCATE_ATTEMPTS {
            for area in TaskStatus::ALL {
                if tokio::fs::try_exists(self.record_path(area, id)).await? {
                    return Ok(Some(area));
                }
            }
        }
        Ok(None)
    }

    async fn claim(&self, id: &TaskId, worker_id: &str, worker_pid: Option<u32>) -> Result<Task> {
        let moved = self
            .relocate(id, &[TaskStatus::Pending], TaskStatus::Processing)
            .await?;
        if moved.is_none() {
            return Err(Error::ClaimConflict {
                task_id: id.to_string(),
                expected: TaskStatus::Pending.to_string(),
            });
        }

        // The record is ours now; a failure from here on must still end in completed.
        let stamped = async {
            let mut task = self.load(TaskStatus::Processing, id).await?;
            task.mark_claimed(worker_id, worker_pid);
            self.write_record(TaskStatus::Processing, &task).await?;
            Ok::<_, Error>(task)
        }
        .await;

        match stamped {
            Ok(task) => {
                // A resolve that landed between load and write leaves the stamp as a second copy
                if tokio::fs::try_exists(self.record_path(TaskStatus::Completed, id)).await? {
                    match tokio::fs::remove_file(self.record_path(TaskStatus::Processing, id)).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    warn!(task_id = %id, "Task was resolved while being claimed");
                    return Err(Error::ClaimConflict {
                        task_id: id.to_string(),
                        expected: TaskStatus::Processing.to_string(),
                    });
                }
                info!(task_id = %id, worker_id, "Claimed task");
                Ok(task)
            }
            Err(e) => {
                warn!(task_id = %id, "Failed to stamp claimed task: {}", e);
                self.force_resolve(
                    id,
                    TaskResult::failure("Task record could not be claimed", e.to_string()),
                )
                .await?;
                Err(Error::Storage(format!("Failed to stamp claimed task {}: {}", id, e)))
            }
        }
    }

    async fn resolve(&self, id: &TaskId, result: TaskResult) -> Result<Task> {
        let mut moved = false;
        for _ in 0..LOCATE_ATTEMPTS {
            if self
                .relocate(
                    id,
                    &[TaskStatus::Processing, TaskStatus::Pending],
                    TaskStatus::Completed,
                )
                .await?
                .is_some()
            {
                moved = true;
                break;
            }
            match self.load(TaskStatus::Completed, id).await {
                Ok(existing) => {
                    debug!(task_id = %id, "Task already resolved, leaving it in place");
                    return Ok(existing);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        if !moved {
            return Err(Error::TaskNotFound(id.to_string()));
        }

        let mut task = match self.load(TaskStatus::Completed, id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %id, "Resolved record unreadable, rewriting: {}", e);
                unreadable_placeholder(id)
            }
        };
        let success = result.is_success();
        task.mark_resolved(result);
        self.write_record(TaskStatus::Completed, &task).await?;

        info!(task_id = %id, success, execution_time = ?task.execution_time, "Resolved task");
        Ok(task)
    }

    async fn force_resolve(&self, id: &TaskId, result: TaskResult) -> Result<Task> {
        match self.resolve(id, result.clone()).await {
            Ok(task) => return Ok(task),
            Err(e) => warn!(task_id = %id, "Regular resolve failed, forcing: {}", e),
        }

        let mut base = None;
        for area in [TaskStatus::Processing, TaskStatus::Pending, TaskStatus::Completed] {
            if let Ok(task) = self.load(area, id).await {
                base = Some(task);
                break;
            }
        }

        let mut task = match base {
            Some(task) if task.status == TaskStatus::Completed && task.result.is_some() => {
                return Ok(task)
            }
            Some(task) => task,
            None => unreadable_placeholder(id),
        };
        task.mark_resolved(result);
        self.write_record(TaskStatus::Completed, &task).await?;

        for area in [TaskStatus::Pending, TaskStatus::Processing] {
            match tokio::fs::remove_file(self.record_path(area, id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id = %id, area = %area, "Failed to remove stale record: {}", e),
            }
        }

        warn!(task_id = %id, "Force-resolved task");
        Ok(task)
    }

    async fn list(&self, area: TaskStatus) -> Result<Vec<Task>> {
        let dir = self.paths.area_dir(area);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            match read_record(&path, area).await {
                Ok(task) => tasks.push(task),
                // Moved away between listing and reading
                Err(e) if e.is_not_found() => continue,
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        // Oldest first
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    fn list_unprocessed(&self) -> BoxStream<'static, Task> {
        let dir = self.paths.area_dir(TaskStatus::Completed);

        stream::once(async move { tokio::fs::read_dir(dir).await })
            .filter_map(|entries| async move {
                match entries {
                    Ok(entries) => Some(ReadDirStream::new(entries)),
                    Err(e) => {
                        warn!("Failed to scan completed tasks: {}", e);
                        None
                    }
                }
            })
            .flatten()
            .filter_map(|entry| async move {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        warn!("Failed to read directory entry: {}", e);
                        return None;
                    }
                };
                if !is_record_file(&path) {
                    return None;
                }
                match read_record(&path, TaskStatus::Completed).await {
                    // A record without a result is still being resolved
                    Ok(task) if !task.processed && task.result.is_some() => Some(task),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Skipping unreadable record {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .boxed()
    }

    async fn mark_processed(&self, id: &TaskId) -> Result<()> {
        let mut task = self.load(TaskStatus::Completed, id).await?;
        if task.processed {
            return Ok(());
        }
        task.processed = true;
        self.write_record(TaskStatus::Completed, &task).await?;
        debug!(task_id = %id, "Marked task processed");
        Ok(())
    }

    async fn stats(&self) -> Result<TaskStats> {
        let mut counts = [0usize; 3];
        for (slot, area) in counts.iter_mut().zip(TaskStatus::ALL) {
            let mut entries = match tokio::fs::read_dir(self.paths.area_dir(area)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if is_record_file(&entry.path()) {
                    *slot += 1;
                }
            }
        }
        Ok(TaskStats {
            pending: counts[0],
            processing: counts[1],
            completed: counts[2],
        })
    }
}
