//! Memento commander
//!
//! The long-running supervisor around the task store:
//! - watches an interactive agent session for task and memory directives
//! - dispatches `memento-worker` executors up to `maxWorkers`
//! - times out stuck workers and reconciles orphans after a restart
//! - folds finished results back into the memory bank and the session

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod logging;
pub mod pid;
pub mod pool;
pub mod session;
pub mod shutdown;
pub mod signals;

pub use coordinator::{feedback_message, Coordinator, CoordinatorHandle, SweepIntervals};
pub use error::{CommanderError, Result};
pub use lock::CommanderLock;
pub use pool::{WorkerExit, WorkerLauncher, WorkerPool, WorkerSlot};
pub use session::{InteractiveSession, SessionEvent};
pub use shutdown::shutdown_signal;
pub use signals::{SessionSignal, SignalTranslator};
