//! Memento commander
//!
//! Supervises the interactive agent session and the executor workers for the
//! store under `$MEMENTO_DIR` (default `.memento`).

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use memento_commander::{logging, shutdown_signal, CommanderLock, Coordinator, WorkerLauncher};
use memento_core::paths::MEMENTO_DIR_ENV;
use memento_core::task::FileTaskStore;
use memento_core::{Config, MemoryBank, MementoPaths, StatusStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = MementoPaths::from_env();
    paths
        .ensure()
        .await
        .with_context(|| format!("Failed to prepare {}", paths.root().display()))?;
    let config = Config::load_or_init(&paths.config_path()).await?;

    let _log_guard = logging::init(config.tracing_directive(), Some(&paths.logs_dir()));
    info!("Using Memento directory: {}", paths.root().display());

    let lock = CommanderLock::acquire(&paths.lock_path()).await?;

    let store = Arc::new(FileTaskStore::open(paths.clone()).await?);
    let root = paths.root().to_string_lossy().into_owned();
    let launcher = WorkerLauncher::beside_current_exe()
        .context("Failed to locate the worker binary")?
        .env(MEMENTO_DIR_ENV, root.clone());

    let coordinator = Coordinator::new(
        store,
        MemoryBank::new(paths.memory_dir()),
        StatusStore::new(paths.status_path()),
        config,
        launcher,
    )
    .with_session_env(MEMENTO_DIR_ENV, root);

    let handle = coordinator.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    let outcome = coordinator.run().await;
    if let Err(e) = &outcome {
        error!("Commander failed: {}", e);
    }
    lock.release().await?;
    outcome.context("Commander startup failed")
}
