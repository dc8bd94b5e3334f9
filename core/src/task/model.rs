//! Task model definitions

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Snapshot of memory bank files, keyed by file label
pub type MemoryContext = BTreeMap<String, String>;

/// Category name -> file label -> replacement content
pub type MemoryUpdates = BTreeMap<String, BTreeMap<String, String>>;

/// Lifecycle state of a task. Each state is also the name of the storage
/// area holding the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [Self::Pending, Self::Processing, Self::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a task; doubles as its record file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// `task_<unix millis>_<9 base36 chars>`
    pub fn generate() -> Self {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..9)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(format!("task_{}_{}", Utc::now().timestamp_millis(), suffix))
    }

    /// Accept an externally supplied id, refusing anything that could
    /// address a file outside its area directory
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.contains('/')
            || raw.contains('\\')
            || raw.contains("..")
            || raw.starts_with('.')
        {
            return Err(Error::InvalidInput(format!("Invalid task id: {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Record file name inside an area directory
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome reported by the agent (or synthesized on failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// Structured result attached to a completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub memory_updates: MemoryUpdates,
}

impl TaskResult {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Success,
            summary: summary.into(),
            details: String::new(),
            errors: Vec::new(),
            memory_updates: MemoryUpdates::new(),
        }
    }

    pub fn failure(summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            summary: summary.into(),
            details: details.into(),
            errors: Vec::new(),
            memory_updates: MemoryUpdates::new(),
        }
    }

    /// Failure caused by a task exceeding its deadline
    pub fn timeout(limit: Duration, who: &str) -> Self {
        Self::failure(
            format!("Timed out after {} ms", limit.as_millis()),
            format!("{} enforced the worker deadline", who),
        )
        .with_error("timeout")
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn is_timeout(&self) -> bool {
        self.errors.iter().any(|e| e == "timeout")
    }
}

/// A task record as persisted in its area directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub memory_context: MemoryContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Milliseconds between claim (or creation, if never claimed) and resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<TaskId>,
}

impl Task {
    /// Create a new pending task with a fresh id
    pub fn new(description: impl Into<String>, memory_context: MemoryContext) -> Self {
        Self {
            id: TaskId::generate(),
            description: description.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            memory_context,
            worker_id: None,
            worker_pid: None,
            processing_start_time: None,
            result: None,
            completed_at: None,
            failed_at: None,
            execution_time: None,
            processed: false,
            attempt: 0,
            retry_of: None,
        }
    }

    /// Pending follow-up for a failed task, sharing its description and snapshot
    pub fn retry_of(failed: &Task) -> Self {
        let mut task = Self::new(failed.description.clone(), failed.memory_context.clone());
        task.attempt = failed.attempt + 1;
        task.retry_of = Some(failed.id.clone());
        task
    }

    /// Stamp the claim fields
    pub(crate) fn mark_claimed(&mut self, worker_id: &str, worker_pid: Option<u32>) {
        self.status = TaskStatus::Processing;
        self.worker_id = Some(worker_id.to_string());
        self.worker_pid = worker_pid;
        self.processing_start_time = Some(Utc::now());
    }

    /// Attach the terminal result and resolution timestamps
    pub(crate) fn mark_resolved(&mut self, result: TaskResult) {
        let now = Utc::now();
        let started = self.processing_start_time.unwrap_or(self.created_at);
        self.status = TaskStatus::Completed;
        self.execution_time = Some((now - started).num_milliseconds().max(0) as u64);
        if result.is_success() {
            self.completed_at = Some(now);
        } else {
            self.failed_at = Some(now);
        }
        self.result = Some(result);
    }

    /// Time since the task was claimed, if it has been
    pub fn processing_age(&self) -> Option<Duration> {
        let started = self.processing_start_time?;
        (Utc::now() - started).to_std().ok()
    }
}
