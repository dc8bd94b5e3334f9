//! Persisted commander status
//!
//! Rewritten wholesale on every status-affecting event. Readers tolerate a
//! missing or half-written file and treat it as "not running".

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::write_json_atomic;
use crate::task::TaskId;
use crate::Result;

/// Lifecycle state of the commander
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommanderState {
    Initializing,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommanderInfo {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub status: CommanderState,
}

/// One active worker slot as seen from outside the commander
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub task_id: TaskId,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub commander: CommanderInfo,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerSnapshot>,
    pub last_update: DateTime<Utc>,
}

impl SystemStatus {
    /// Status of a commander that is just starting in this process
    pub fn initializing() -> Self {
        let now = Utc::now();
        Self {
            commander: CommanderInfo {
                pid: std::process::id(),
                start_time: now,
                status: CommanderState::Initializing,
            },
            workers: BTreeMap::new(),
            last_update: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.commander.status == CommanderState::Running
    }
}

/// Reads and writes `system/status.json`
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn write(&self, status: &SystemStatus) -> Result<()> {
        write_json_atomic(&self.path, status).await
    }

    /// Current status, or `None` when the file is missing or unreadable
    pub async fn read(&self) -> Option<SystemStatus> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("No readable status at {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("Ignoring malformed status {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Whether the status file reports a running commander
    pub async fn is_running(&self) -> bool {
        self.read().await.is_some_and(|s| s.is_running())
    }
}
