//! Core library for Memento
//!
//! This crate contains the durable pieces shared by the commander and its
//! workers:
//! - The file-backed task queue (`pending` / `processing` / `completed`)
//! - The persisted commander status record
//! - Configuration and the on-disk layout
//! - The memory bank that tasks snapshot their context from

pub mod config;
pub mod error;
pub mod memory;
pub mod paths;
pub mod status;
pub mod task;

pub use config::Config;
pub use error::Error;
pub use memory::MemoryBank;
pub use paths::MementoPaths;
pub use status::{CommanderInfo, CommanderState, StatusStore, SystemStatus, WorkerSnapshot};
pub type Result<T> = std::result::Result<T, Error>;
