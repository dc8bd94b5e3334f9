//! The coordinator: one supervisory loop that owns every slot transition
//!
//! Session signals, executor exits, periodic sweeps and handle commands are
//! all handled sequentially by [`Coordinator::run`]. The on-disk task areas
//! are the source of truth; the worker pool is a cache of them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agent_runner::generate_worker_id;
use memento_core::task::{Task, TaskId, TaskRepository, TaskResult, TaskStatus};
use memento_core::{CommanderState, Config, MemoryBank, StatusStore, SystemStatus};

use crate::error::{CommanderError, Result};
use crate::pid;
use crate::pool::{WorkerExit, WorkerLauncher, WorkerPool, KILL_GRACE};
use crate::session::{InteractiveSession, SessionEvent};
use crate::signals::SessionSignal;

/// Periods of the background duties
#[derive(Debug, Clone, Copy)]
pub struct SweepIntervals {
    pub timeout: Duration,
    pub completion: Duration,
    pub session_restart: Duration,
}

impl Default for SweepIntervals {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            completion: Duration::from_secs(5),
            session_restart: Duration::from_secs(5),
        }
    }
}

enum Command {
    Submit {
        description: String,
        reply: oneshot::Sender<Result<Task>>,
    },
    ActiveWorkers {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle for talking to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl CoordinatorHandle {
    /// Create a task as if the session had asked for it
    pub async fn submit(&self, description: impl Into<String>) -> Result<Task> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                description: description.into(),
                reply,
            })
            .await
            .map_err(|_| CommanderError::Stopped)?;
        rx.await.map_err(|_| CommanderError::Stopped)?
    }

    pub async fn active_workers(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ActiveWorkers { reply })
            .await
            .map_err(|_| CommanderError::Stopped)?;
        rx.await.map_err(|_| CommanderError::Stopped)
    }

    /// Ask the loop to stop; `run` returns once shutdown is complete
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct Coordinator {
    store: Arc<dyn TaskRepository>,
    memory: MemoryBank,
    status_store: StatusStore,
    status: SystemStatus,
    config: Config,
    intervals: SweepIntervals,
    pool: WorkerPool,
    worker_exits: mpsc::UnboundedReceiver<WorkerExit>,
    session: Option<InteractiveSession>,
    session_env: Vec<(String, String)>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    session_restart_at: Option<Instant>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        memory: MemoryBank,
        status_store: StatusStore,
        config: Config,
        launcher: WorkerLauncher,
    ) -> Self {
        let (pool, worker_exits) = WorkerPool::new(launcher, config.max_workers);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(64);

        Self {
            store,
            memory,
            status_store,
            status: SystemStatus::initializing(),
            config,
            intervals: SweepIntervals::default(),
            pool,
            worker_exits,
            session: None,
            session_env: Vec::new(),
            session_tx,
            session_rx,
            session_restart_at: None,
            commands_tx,
            commands_rx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_intervals(mut self, intervals: SweepIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Extra environment for the interactive session
    pub fn with_session_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_env.push((key.into(), value.into()));
        self
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            commands: self.commands_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Start up, supervise until shutdown is requested, then stop.
    ///
    /// Only bootstrap failures are returned; per-task failures are logged.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        let mut timeout_tick = tokio::time::interval(self.intervals.timeout);
        timeout_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completion_tick = tokio::time::interval(self.intervals.completion);
        completion_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let restart_at = self.session_restart_at;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands_rx.recv() => self.handle_command(command).await,
                Some(event) = self.session_rx.recv() => self.handle_session_event(event).await,
                Some(exit) = self.worker_exits.recv() => self.handle_worker_exit(exit).await,
                _ = timeout_tick.tick() => self.timeout_sweep().await,
                _ = completion_tick.tick() => {
                    self.completion_sweep().await;
                    self.release_finished_detached().await;
                    self.dispatch_pending().await;
                }
                _ = tokio::time::sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.session_restart_at = None;
                    self.start_session();
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        info!(pid = self.status.commander.pid, "Commander initializing");
        self.status_store.write(&self.status).await?;
        self.memory.initialize().await?;

        self.reconcile().await?;
        self.start_session();

        self.status.commander.status = CommanderState::Running;
        self.persist_status().await;
        info!(
            max_workers = self.pool.max_workers(),
            adopted = self.pool.active_count(),
            "Commander running"
        );

        self.dispatch_pending().await;
        Ok(())
    }

    /// Rebuild in-flight state from the `processing` area
    async fn reconcile(&mut self) -> Result<()> {
        let timeout = self.config.worker_timeout();
        let processing = self.store.list(TaskStatus::Processing).await?;

        for task in processing {
            let claimant = task
                .worker_pid
                .zip(task.processing_start_time)
                .filter(|&(worker_pid, claimed_at)| {
                    worker_pid != std::process::id() && pid::is_claimant(worker_pid, claimed_at)
                });
            let expired = task.processing_age().map_or(true, |age| age > timeout);

            if claimant.is_some() && !expired && self.pool.adopt(&task) {
                continue;
            }

            let reason = if expired {
                "past its deadline"
            } else if claimant.is_some() {
                "beyond the worker limit"
            } else {
                "no longer running"
            };
            if let Some((worker_pid, claimed_at)) = claimant {
                warn!(task_id = %task.id, worker_pid, reason, "Stopping worker left by a previous commander");
                pid::stop_claimant(worker_pid, claimed_at, KILL_GRACE);
            }

            let result = TaskResult::failure(
                "Commander restarted while the task was in flight",
                format!(
                    "Worker {} was {}",
                    task.worker_id.as_deref().unwrap_or("unknown"),
                    reason
                ),
            )
            .with_error("commander_restart");
            match self.store.resolve(&task.id, result).await {
                Ok(_) => warn!(task_id = %task.id, "Resolved orphaned task as failed"),
                Err(e) => error!(task_id = %task.id, "Failed to resolve orphaned task: {}", e),
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        info!("Commander stopping");
        self.status.commander.status = CommanderState::Stopped;

        self.pool.shutdown().await;
        if let Some(session) = self.session.take() {
            session.stop().await;
        }

        self.persist_status().await;
        info!("Commander stopped");
    }

    fn start_session(&mut self) {
        if self.config.session_command.is_empty() || self.session.is_some() {
            return;
        }
        match InteractiveSession::spawn(
            &self.config.session_command,
            &self.session_env,
            self.session_tx.clone(),
        ) {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                error!("{}", e);
                self.session_restart_at = Some(Instant::now() + self.intervals.session_restart);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { description, reply } => {
                let created = self.create_task(&description).await;
                let _ = reply.send(created);
            }
            Command::ActiveWorkers { reply } => {
                let _ = reply.send(self.pool.active_count());
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signal(SessionSignal::CreateTask { description }) => {
                if let Err(e) = self.create_task(&description).await {
                    error!("Failed to create task from session: {}", e);
                }
            }
            SessionEvent::Signal(SessionSignal::MemoryUpdate) => {
                info!("Memory update requested by session");
                self.completion_sweep().await;
            }
            SessionEvent::Exited(code) => {
                warn!(?code, "Interactive session exited, restarting shortly");
                self.session = None;
                self.session_restart_at = Some(Instant::now() + self.intervals.session_restart);
            }
        }
    }

    /// Snapshot memory, persist the task and dispatch it if a slot is free
    async fn create_task(&mut self, description: &str) -> Result<Task> {
        let context = self.memory.snapshot().await;
        let task = self.store.create(description, context).await?;
        info!(task_id = %task.id, "Task created: {}", description);

        self.try_dispatch(&task.id).await;
        Ok(task)
    }

    /// Start an executor for a pending task; without capacity it stays queued
    async fn try_dispatch(&mut self, task_id: &TaskId) -> bool {
        if self.pool.contains(task_id) {
            return false;
        }
        if !self.pool.has_capacity() {
            info!(
                task_id = %task_id,
                active = self.pool.active_count(),
                "All worker slots busy, task stays pending"
            );
            return false;
        }

        match self.pool.spawn(task_id, generate_worker_id()) {
            Ok(_) => {
                self.persist_status().await;
                true
            }
            Err(e) => {
                error!(task_id = %task_id, "Dispatch failed, task stays pending: {}", e);
                false
            }
        }
    }

    /// Fill free slots with the oldest pending tasks
    async fn dispatch_pending(&mut self) {
        if !self.pool.has_capacity() {
            return;
        }
        let pending = match self.store.list(TaskStatus::Pending).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to list pending tasks: {}", e);
                return;
            }
        };

        for task in pending {
            if !self.pool.has_capacity() {
                break;
            }
            self.try_dispatch(&task.id).await;
        }
    }

    async fn handle_worker_exit(&mut self, exit: WorkerExit) {
        let Some(slot) = self.pool.release(&exit.task_id) else {
            // Terminated by us; the task was resolved when it was stopped
            debug!(task_id = %exit.task_id, worker_id = %exit.worker_id, "Stopped worker exited");
            return;
        };
        info!(
            task_id = %exit.task_id,
            worker_id = %exit.worker_id,
            code = ?exit.code,
            elapsed_ms = slot.elapsed().as_millis() as u64,
            "Worker exited"
        );

        match self.store.locate(&exit.task_id).await {
            Ok(Some(TaskStatus::Completed)) => {}
            Ok(Some(area)) => {
                warn!(task_id = %exit.task_id, %area, "Worker exited without resolving its task");
                let exit_desc = match exit.code {
                    Some(code) => format!("exit code {}", code),
                    None => "a signal".to_string(),
                };
                let result = TaskResult::failure(
                    "Executor exited without resolving the task",
                    format!("Worker {} ended with {}", exit.worker_id, exit_desc),
                )
                .with_error(format!("executor_exit: {}", exit_desc));
                if let Err(e) = self.store.resolve(&exit.task_id, result).await {
                    error!(task_id = %exit.task_id, "Failed to resolve abandoned task: {}", e);
                }
            }
            Ok(None) => warn!(task_id = %exit.task_id, "Task record disappeared"),
            Err(e) => error!(task_id = %exit.task_id, "Failed to locate task: {}", e),
        }

        self.dispatch_pending().await;
        self.persist_status().await;
    }

    /// Stop executors that outlived the deadline and fail their tasks
    async fn timeout_sweep(&mut self) {
        let timeout = self.config.worker_timeout();
        let expired = self.pool.expired(timeout);
        if expired.is_empty() {
            return;
        }

        for task_id in expired {
            warn!(task_id = %task_id, timeout_ms = self.config.worker_timeout, "Worker timed out");
            // Resolve first so the timeout cause wins over the executor's own cancellation
            if let Err(e) = self
                .store
                .resolve(&task_id, TaskResult::timeout(timeout, "commander"))
                .await
            {
                error!(task_id = %task_id, "Failed to resolve timed out task: {}", e);
            }
            self.pool.terminate(&task_id);
        }

        self.dispatch_pending().await;
        self.persist_status().await;
    }

    /// Free adopted slots whose task has left `processing` or whose executor died
    async fn release_finished_detached(&mut self) {
        let mut released = false;
        for task_id in self.pool.detached() {
            match self.store.get(&task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::Processing => {
                    let running = task
                        .worker_pid
                        .zip(task.processing_start_time)
                        .is_some_and(|(worker_pid, claimed_at)| pid::is_claimant(worker_pid, claimed_at));
                    if running {
                        continue;
                    }
                    let result = TaskResult::failure(
                        "Executor exited without resolving the task",
                        "Adopted worker is no longer running",
                    )
                    .with_error("executor_exit");
                    if let Err(e) = self.store.resolve(&task_id, result).await {
                        error!(task_id = %task_id, "Failed to resolve abandoned task: {}", e);
                        continue;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(task_id = %task_id, "Failed to check adopted task: {}", e);
                    continue;
                }
            }
            self.pool.release(&task_id);
            released = true;
        }
        if released {
            self.persist_status().await;
        }
    }

    /// Fold finished tasks back into memory and the session
    async fn completion_sweep(&mut self) {
        let mut unprocessed = self.store.list_unprocessed();
        while let Some(task) = unprocessed.next().await {
            self.process_completed(task).await;
        }
    }

    async fn process_completed(&mut self, task: Task) {
        let Some(result) = task.result.as_ref() else {
            return;
        };
        info!(task_id = %task.id, status = ?result.status, "Processing task result");

        let written = self.memory.apply_updates(&result.memory_updates).await;
        if written > 0 {
            info!(task_id = %task.id, files = written, "Applied memory updates");
        }

        if let Err(e) = self.store.mark_processed(&task.id).await {
            error!(task_id = %task.id, "Failed to mark task processed: {}", e);
            return;
        }

        if let Some(session) = self.session.as_ref() {
            if let Err(e) = session.send(feedback_message(&task)) {
                warn!(task_id = %task.id, "{}", e);
            }
        }

        if !result.is_success() && task.attempt < self.config.retry_attempts {
            match self.store.enqueue(Task::retry_of(&task)).await {
                Ok(retry) => info!(
                    task_id = %task.id,
                    retry_id = %retry.id,
                    attempt = retry.attempt,
                    "Failed task re-enqueued"
                ),
                Err(e) => error!(task_id = %task.id, "Failed to enqueue retry: {}", e),
            }
        }
    }

    async fn persist_status(&mut self) {
        self.status.workers = self.pool.snapshot();
        self.status.last_update = Utc::now();
        if let Err(e) = self.status_store.write(&self.status).await {
            warn!("Failed to write status: {}", e);
        }
    }
}

/// Summary line written back into the interactive session
pub fn feedback_message(task: &Task) -> String {
    let (headline, fallback) = match &task.result {
        Some(result) if result.is_success() => ("Task completed", "success"),
        _ => ("Task failed", "failed"),
    };
    let summary = task
        .result
        .as_ref()
        .map(|r| r.summary.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback);
    format!("{}: {}\nResult: {}\n", headline, task.description, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memento_core::task::{FileTaskStore, MemoryContext};
    use memento_core::MementoPaths;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        paths: MementoPaths,
        store: Arc<FileTaskStore>,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let paths = MementoPaths::new(temp.path().join(".memento"));
        let store = Arc::new(FileTaskStore::open(paths.clone()).await.unwrap());
        Fixture {
            _temp: temp,
            paths,
            store,
        }
    }

    fn headless_config(max_workers: usize) -> Config {
        Config {
            max_workers,
            retry_attempts: 0,
            session_command: vec![],
            ..Config::default()
        }
    }

    fn coordinator(fx: &Fixture, config: Config, launcher: WorkerLauncher) -> Coordinator {
        Coordinator::new(
            fx.store.clone(),
            MemoryBank::new(fx.paths.memory_dir()),
            StatusStore::new(fx.paths.status_path()),
            config,
            launcher,
        )
    }

    #[test]
    fn test_feedback_message() {
        let mut task = Task::new("write docs", MemoryContext::new());
        task.result = Some(TaskResult::success("docs written"));
        assert_eq!(
            feedback_message(&task),
            "Task completed: write docs\nResult: docs written\n"
        );

        task.result = Some(TaskResult::failure("", "boom"));
        assert_eq!(feedback_message(&task), "Task failed: write docs\nResult: failed\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_resolves_dead_and_adopts_live() {
        let fx = fixture().await;

        let dead = fx.store.create("dead worker", MemoryContext::new()).await.unwrap();
        fx.store.claim(&dead.id, "worker_dead", None).await.unwrap();

        let live = fx.store.create("live worker", MemoryContext::new()).await.unwrap();
        let mut holder = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        fx.store
            .claim(&live.id, "worker_live", holder.id())
            .await
            .unwrap();

        let mut coord = coordinator(&fx, headless_config(3), WorkerLauncher::new("true"));
        coord.reconcile().await.unwrap();

        let resolved = fx.store.get(&dead.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, TaskStatus::Completed);
        assert_eq!(resolved.result.unwrap().errors, vec!["commander_restart".to_string()]);

        assert_eq!(coord.pool.detached(), vec![live.id.clone()]);
        assert_eq!(
            fx.store.locate(&live.id).await.unwrap(),
            Some(TaskStatus::Processing)
        );

        holder.kill().await.unwrap();
        holder.wait().await.unwrap();
        coord.release_finished_detached().await;
        assert_eq!(coord.pool.active_count(), 0);
        assert_eq!(
            fx.store.locate(&live.id).await.unwrap(),
            Some(TaskStatus::Completed)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_adopts_no_more_than_max_workers() {
        let fx = fixture().await;

        let mut holders = Vec::new();
        let mut ids = Vec::new();
        for n in 0..3 {
            let task = fx
                .store
                .create(&format!("survivor {}", n), MemoryContext::new())
                .await
                .unwrap();
            let holder = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
            fx.store
                .claim(&task.id, &format!("worker_{}", n), holder.id())
                .await
                .unwrap();
            holders.push(holder);
            ids.push(task.id);
        }

        let mut coord = coordinator(&fx, headless_config(1), WorkerLauncher::new("true"));
        coord.reconcile().await.unwrap();

        assert_eq!(coord.pool.active_count(), 1);
        let adopted = coord.pool.detached();
        let mut resolved = 0;
        for (id, holder) in ids.iter().zip(holders.iter_mut()) {
            if adopted.contains(id) {
                assert_eq!(fx.store.locate(id).await.unwrap(), Some(TaskStatus::Processing));
                continue;
            }
            let task = fx.store.get(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result.unwrap().errors, vec!["commander_restart".to_string()]);
            // The excess executor was asked to stop
            tokio::time::timeout(Duration::from_secs(5), holder.wait())
                .await
                .unwrap()
                .unwrap();
            resolved += 1;
        }
        assert_eq!(resolved, 2);

        for holder in holders.iter_mut() {
            let _ = holder.kill().await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_does_not_signal_reused_pid() {
        let fx = fixture().await;

        // An overdue record whose pid now belongs to a process started after the claim
        let mut stranger = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut task = Task::new("claimed long ago", MemoryContext::new());
        task.status = TaskStatus::Processing;
        task.worker_id = Some("worker_gone".to_string());
        task.worker_pid = stranger.id();
        task.processing_start_time = Some(Utc::now() - chrono::Duration::hours(1));
        memento_core::paths::write_json_atomic(
            &fx.paths.area_dir(TaskStatus::Processing).join(task.id.file_name()),
            &task,
        )
        .await
        .unwrap();

        let mut coord = coordinator(&fx, headless_config(3), WorkerLauncher::new("true"));
        coord.reconcile().await.unwrap();

        let resolved = fx.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, TaskStatus::Completed);
        assert_eq!(resolved.result.unwrap().errors, vec!["commander_restart".to_string()]);
        assert_eq!(coord.pool.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(stranger.try_wait().unwrap().is_none());
        stranger.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_sweep_applies_updates_and_retries() {
        let fx = fixture().await;
        let config = Config {
            retry_attempts: 1,
            ..headless_config(1)
        };
        let mut coord = coordinator(&fx, config, WorkerLauncher::new("true"));
        coord.memory.initialize().await.unwrap();

        let ok = fx.store.create("good", MemoryContext::new()).await.unwrap();
        let mut result = TaskResult::success("done");
        result.memory_updates.insert(
            "core".to_string(),
            [("current.md".to_string(), "# Updated".to_string())].into(),
        );
        fx.store.resolve(&ok.id, result).await.unwrap();

        let bad = fx.store.create("bad", MemoryContext::new()).await.unwrap();
        fx.store
            .resolve(&bad.id, TaskResult::failure("broke", ""))
            .await
            .unwrap();

        coord.completion_sweep().await;

        assert_eq!(
            std::fs::read_to_string(fx.paths.memory_dir().join("core/current.md")).unwrap(),
            "# Updated"
        );
        assert!(fx.store.get(&ok.id).await.unwrap().unwrap().processed);

        let pending = fx.store.list(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_of.as_ref(), Some(&bad.id));
        assert_eq!(pending[0].attempt, 1);

        // Sweeping again must not enqueue a second retry
        coord.completion_sweep().await;
        assert_eq!(fx.store.list(TaskStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_respected() {
        let fx = fixture().await;
        let config = Config {
            retry_attempts: 1,
            ..headless_config(1)
        };
        let mut coord = coordinator(&fx, config, WorkerLauncher::new("true"));

        let mut task = Task::new("flaky", MemoryContext::new());
        task.attempt = 1;
        let task = fx.store.enqueue(task).await.unwrap();
        fx.store
            .resolve(&task.id, TaskResult::failure("broke again", ""))
            .await
            .unwrap();

        coord.completion_sweep().await;
        assert!(fx.store.list(TaskStatus::Pending).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_ignoring_feedback_does_not_stall_loop() {
        let fx = fixture().await;
        for n in 0..3 {
            let task = fx
                .store
                .create(&format!("{} {}", n, "y".repeat(256 * 1024)), MemoryContext::new())
                .await
                .unwrap();
            fx.store
                .resolve(&task.id, TaskResult::success("done"))
                .await
                .unwrap();
        }

        let config = Config {
            session_command: vec!["sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
            ..headless_config(1)
        };
        let coord = coordinator(&fx, config, WorkerLauncher::new("true"));
        let handle = coord.handle();
        let running = tokio::spawn(coord.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !fx.store.list(TaskStatus::Completed).await.unwrap().iter().all(|t| t.processed) {
            assert!(tokio::time::Instant::now() < deadline, "results were never processed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let active = tokio::time::timeout(Duration::from_secs(5), handle.active_workers()).await;
        assert_eq!(active.unwrap().unwrap(), 0);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_and_shutdown_through_handle() {
        let fx = fixture().await;
        // A worker that never finishes on its own
        let launcher = WorkerLauncher::new("sh").arg("-c").arg("sleep 30");
        let coord = coordinator(&fx, headless_config(1), launcher);
        let handle = coord.handle();
        let running = tokio::spawn(coord.run());

        let first = handle.submit("first").await.unwrap();
        let second = handle.submit("second").await.unwrap();
        assert_eq!(handle.active_workers().await.unwrap(), 1);
        assert_eq!(
            fx.store.locate(&second.id).await.unwrap(),
            Some(TaskStatus::Pending)
        );

        let status = StatusStore::new(fx.paths.status_path()).read().await.unwrap();
        assert!(status.is_running());
        assert_eq!(status.workers.len(), 1);
        assert_eq!(status.workers.values().next().unwrap().task_id, first.id);

        handle.shutdown();
        running.await.unwrap().unwrap();

        let status = StatusStore::new(fx.paths.status_path()).read().await.unwrap();
        assert_eq!(status.commander.status, CommanderState::Stopped);
        assert!(status.workers.is_empty());
        assert!(matches!(
            handle.submit("too late").await,
            Err(CommanderError::Stopped)
        ));
    }
}
