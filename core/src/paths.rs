//! On-disk layout of a memento store
//!
//! Directory structure:
//! ```text
//! .memento/
//!   memory/{core,context,commands}/
//!   tasks/
//!     pending/{task_id}.json
//!     processing/{task_id}.json
//!     completed/{task_id}.json
//!   logs/commander.log
//!   system/
//!     config.json
//!     status.json
//!     commander.lock
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::task::TaskStatus;
use crate::{Error, Result};

/// Environment variable naming the store root
pub const MEMENTO_DIR_ENV: &str = "MEMENTO_DIR";

/// Resolved paths of a memento store
#[derive(Debug, Clone)]
pub struct MementoPaths {
    root: PathBuf,
}

impl MementoPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `MEMENTO_DIR`, falling back to `./.memento`
    pub fn from_env() -> Self {
        let root = std::env::var(MEMENTO_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".memento"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    /// Directory holding the records of one lifecycle area
    pub fn area_dir(&self, area: TaskStatus) -> PathBuf {
        self.tasks_dir().join(area.as_str())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn system_dir(&self) -> PathBuf {
        self.root.join("system")
    }

    pub fn config_path(&self) -> PathBuf {
        self.system_dir().join("config.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.system_dir().join("status.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.system_dir().join("commander.lock")
    }

    /// Create the whole directory tree. Safe to call repeatedly.
    pub async fn ensure(&self) -> Result<()> {
        let memory = self.memory_dir();
        let dirs = [
            memory.join("core"),
            memory.join("context"),
            memory.join("commands"),
            self.area_dir(TaskStatus::Pending),
            self.area_dir(TaskStatus::Processing),
            self.area_dir(TaskStatus::Completed),
            self.logs_dir(),
            self.system_dir(),
        ];

        for dir in dirs {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Initialization(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Serialize `value` and move it into place with a single rename.
///
/// The temporary file lives in the destination directory so the rename
/// never crosses a filesystem boundary.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4().as_hyphenated()));
    tokio::fs::write(&temp_path, content).await.map_err(|e| {
        Error::Storage(format!("Failed to write {}: {}", temp_path.display(), e))
    })?;

    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(Error::Storage(format!(
            "Failed to finalize atomic write of {}: {}",
            path.display(),
            err
        )));
    }
    Ok(())
}
