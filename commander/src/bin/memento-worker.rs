//! Memento worker
//!
//! Executes exactly one task: `memento-worker <task-id>` (or `TASK_ID`).
//! Exit code 0 when the task reached `completed`, 1 when it could not be
//! loaded or claimed, 2 when the worker itself could not start.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use agent_runner::{generate_worker_id, ExecutorConfig, TaskExecutor};
use memento_commander::{logging, shutdown_signal};
use memento_core::task::{FileTaskStore, TaskId};
use memento_core::{Config, MementoPaths};

const EXIT_NOT_CLAIMED: u8 = 1;
const EXIT_BOOTSTRAP: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("memento-worker: {:#}", e);
            ExitCode::from(EXIT_BOOTSTRAP)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let raw_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TASK_ID").ok())
        .context("usage: memento-worker <task-id>")?;

    let paths = MementoPaths::from_env();
    let config = Config::load_or_init(&paths.config_path()).await?;
    let _log_guard = logging::init(config.tracing_directive(), None);

    let task_id = match TaskId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitCode::from(EXIT_NOT_CLAIMED));
        }
    };
    let worker_id = std::env::var("WORKER_ID")
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(generate_worker_id);

    let store = Arc::new(FileTaskStore::open(paths).await?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let executor = TaskExecutor::new(store, ExecutorConfig::from_config(&config), worker_id)
        .with_cancellation(cancel);

    match executor.run(&task_id).await {
        Ok(task) => {
            let status = task.result.as_ref().map(|r| r.status);
            info!(task_id = %task.id, ?status, execution_ms = ?task.execution_time, "Task resolved");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(task_id = %task_id, worker_id = %executor.worker_id(), "Task not executed: {}", e);
            Ok(ExitCode::from(EXIT_NOT_CLAIMED))
        }
    }
}
