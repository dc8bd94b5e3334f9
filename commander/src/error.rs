//! Error types for the commander

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CommanderError>;

#[derive(Debug, Error)]
pub enum CommanderError {
    #[error("Store error: {0}")]
    Store(#[from] memento_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The interactive session could not be started or written to
    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid session pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// An executor process could not be dispatched
    #[error("Worker error: {0}")]
    Worker(String),

    /// The coordinator loop is no longer running
    #[error("Coordinator has stopped")]
    Stopped,
}
