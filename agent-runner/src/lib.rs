//! Agent Runner - single-task executor
//!
//! This crate drives one task from `pending` to `completed`: it claims the
//! task, hands the instruction to an external agent process, watches the
//! output for the result block and always leaves a terminal record behind.

mod error;
mod event;
mod executor;
mod process;
mod protocol;

pub use error::{ExecutorError, Result};
pub use event::{AgentEvent, AgentOutcome, OutputStream};
pub use executor::{generate_worker_id, ExecutorConfig, TaskExecutor};
pub use process::{AgentCommand, AgentConfig, AgentProcess, OutputReaderHandle};
pub use protocol::{build_instruction, ResultScanner, ScanOutcome, RESULT_END, RESULT_START};
