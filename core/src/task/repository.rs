//! Task repository trait
//!
//! Defines the lifecycle operations of the durable task queue.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::model::{MemoryContext, Task, TaskId, TaskResult, TaskStatus};
use crate::Result;

/// Per-area record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
}

/// Repository interface for the task lifecycle.
///
/// A record lives in exactly one area. The only transitions are
/// `pending -> processing` (claim) and `-> completed` (resolve).
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a new pending task with a fresh id
    async fn create(&self, description: &str, memory_context: MemoryContext) -> Result<Task>;

    /// Persist an already-built pending task (used for retries)
    async fn enqueue(&self, task: Task) -> Result<Task>;

    /// Find a task in any area
    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Read a task from one specific area
    async fn load(&self, area: TaskStatus, id: &TaskId) -> Result<Task>;

    /// Which area currently holds the task
    async fn locate(&self, id: &TaskId) -> Result<Option<TaskStatus>>;

    /// Move a pending task to processing and stamp the claim.
    ///
    /// Fails with `ClaimConflict` if the task is not pending.
    async fn claim(&self, id: &TaskId, worker_id: &str, worker_pid: Option<u32>) -> Result<Task>;

    /// Move a task from processing (or pending) to completed with its result.
    ///
    /// Resolving an already completed task returns it unchanged.
    async fn resolve(&self, id: &TaskId, result: TaskResult) -> Result<Task>;

    /// Resolve whatever it takes: fall back to writing the terminal record
    /// straight into completed when a regular `resolve` fails
    async fn force_resolve(&self, id: &TaskId, result: TaskResult) -> Result<Task>;

    /// All readable records of an area, oldest first
    async fn list(&self, area: TaskStatus) -> Result<Vec<Task>>;

    /// Lazily scan completed tasks not yet acknowledged by the commander
    fn list_unprocessed(&self) -> BoxStream<'static, Task>;

    /// Flag a completed task as acknowledged. Idempotent.
    async fn mark_processed(&self, id: &TaskId) -> Result<()>;

    /// Count records per area
    async fn stats(&self) -> Result<TaskStats>;
}
