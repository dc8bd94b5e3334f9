//! Task module
//!
//! The task record, its lifecycle, and the file-backed queue that stores it.

mod file_store;
mod model;
mod repository;

pub use file_store::FileTaskStore;
pub use model::*;
pub use repository::{TaskRepository, TaskStats};
