//! Error types for the core library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The task was not in the area a transition expected (already claimed,
    /// already resolved, or never created). Callers skip, they do not retry.
    #[error("Task {task_id} is not {expected}")]
    ClaimConflict { task_id: String, expected: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Another commander (pid {pid}) holds the store lock")]
    LockHeld { pid: u32 },
}

impl Error {
    /// Whether the error only means "the record wasn't where we looked"
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::TaskNotFound(_) | Self::ClaimConflict { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
