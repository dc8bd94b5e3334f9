//! Executor worker slots
//!
//! The slot map is a cache of in-flight work indexed by task id. The durable
//! record of what is running is always the `processing` area; the
//! coordinator rebuilds the detached part of this map from it on startup.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use memento_core::task::{Task, TaskId};
use memento_core::WorkerSnapshot;

use crate::error::{CommanderError, Result};
use crate::pid;

/// Time between SIGTERM and SIGKILL when stopping an executor
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Name of the executor binary installed next to the commander
pub const WORKER_BINARY: &str = "memento-worker";

/// How executor processes are started
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// The worker binary that sits in the same directory as this executable
    pub fn beside_current_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| CommanderError::Worker("Executable has no parent directory".to_string()))?;
        Ok(Self::new(
            dir.join(format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX)),
        ))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Reported once per spawned executor when its process is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub task_id: TaskId,
    pub worker_id: String,
    pub code: Option<i32>,
}

enum SlotKind {
    /// Started by this commander; `stop` asks the wait task to terminate it
    Spawned {
        stop: CancellationToken,
        waiter: JoinHandle<()>,
    },
    /// Adopted from a previous commander; only its pid is known
    Detached,
}

pub struct WorkerSlot {
    pub worker_id: String,
    pub task_id: TaskId,
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    started: Instant,
    kind: SlotKind,
}

impl WorkerSlot {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.kind, SlotKind::Detached)
    }
}

/// Bounded set of executor slots
pub struct WorkerPool {
    launcher: WorkerLauncher,
    max_workers: usize,
    slots: HashMap<TaskId, WorkerSlot>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl WorkerPool {
    /// Create a pool; exits of spawned executors arrive on the returned receiver
    pub fn new(
        launcher: WorkerLauncher,
        max_workers: usize,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let pool = Self {
            launcher,
            max_workers: max_workers.max(1),
            slots: HashMap::new(),
            exit_tx,
        };
        (pool, exit_rx)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.len() < self.max_workers
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.slots.contains_key(task_id)
    }

    /// Start an executor for a pending task
    pub fn spawn(&mut self, task_id: &TaskId, worker_id: String) -> Result<&WorkerSlot> {
        if !self.has_capacity() {
            return Err(CommanderError::Worker(format!(
                "All {} worker slots are busy",
                self.max_workers
            )));
        }
        if self.slots.contains_key(task_id) {
            return Err(CommanderError::Worker(format!(
                "Task {} already has a worker",
                task_id
            )));
        }

        let mut cmd = Command::new(&self.launcher.program);
        cmd.args(&self.launcher.args)
            .arg(task_id.as_str())
            .env("WORKER_ID", &worker_id)
            .env("TASK_ID", task_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.launcher.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            CommanderError::Worker(format!(
                "Failed to spawn {}: {}",
                self.launcher.program.display(),
                e
            ))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker_id = %worker_id, "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker_id = %worker_id, "{}", line);
                }
            });
        }

        let stop = CancellationToken::new();
        let waiter = {
            let stop = stop.clone();
            let exit_tx = self.exit_tx.clone();
            let task_id = task_id.clone();
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let code = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            error!(worker_id = %worker_id, "Failed to wait for worker: {}", e);
                            None
                        }
                    },
                    _ = stop.cancelled() => pid::stop_child(&mut child, KILL_GRACE).await,
                };
                let _ = exit_tx.send(WorkerExit {
                    task_id,
                    worker_id,
                    code,
                });
            })
        };

        info!(task_id = %task_id, worker_id = %worker_id, ?pid, "Worker started");
        let slot = WorkerSlot {
            worker_id,
            task_id: task_id.clone(),
            pid,
            start_time: Utc::now(),
            started: Instant::now(),
            kind: SlotKind::Spawned { stop, waiter },
        };
        Ok(self.slots.entry(task_id.clone()).or_insert(slot))
    }

    /// Track an executor that survived a commander restart.
    ///
    /// Refused when the pool is already full.
    pub fn adopt(&mut self, task: &Task) -> bool {
        if !self.has_capacity() {
            return false;
        }
        let age = task.processing_age().unwrap_or_default();
        let started = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        let slot = WorkerSlot {
            worker_id: task.worker_id.clone().unwrap_or_default(),
            task_id: task.id.clone(),
            pid: task.worker_pid,
            start_time: task.processing_start_time.unwrap_or_else(Utc::now),
            started,
            kind: SlotKind::Detached,
        };
        info!(task_id = %task.id, pid = ?task.worker_pid, "Adopted running worker");
        self.slots.insert(task.id.clone(), slot);
        true
    }

    /// Slots that have run longer than `timeout`
    pub fn expired(&self, timeout: Duration) -> Vec<TaskId> {
        self.slots
            .values()
            .filter(|slot| slot.elapsed() > timeout)
            .map(|slot| slot.task_id.clone())
            .collect()
    }

    /// Task ids of adopted slots
    pub fn detached(&self) -> Vec<TaskId> {
        self.slots
            .values()
            .filter(|slot| slot.is_detached())
            .map(|slot| slot.task_id.clone())
            .collect()
    }

    /// Forget a slot whose process is already gone
    pub fn release(&mut self, task_id: &TaskId) -> Option<WorkerSlot> {
        let slot = self.slots.remove(task_id)?;
        debug!(task_id = %task_id, worker_id = %slot.worker_id, "Worker slot released");
        Some(slot)
    }

    /// Remove a slot and stop its process (SIGTERM, then SIGKILL)
    pub fn terminate(&mut self, task_id: &TaskId) -> Option<WorkerSlot> {
        let slot = self.slots.remove(task_id)?;
        warn!(task_id = %task_id, worker_id = %slot.worker_id, "Terminating worker");
        match &slot.kind {
            SlotKind::Spawned { stop, .. } => stop.cancel(),
            SlotKind::Detached => {
                if let Some(pid) = slot.pid {
                    pid::stop_claimant(pid, slot.start_time, KILL_GRACE);
                }
            }
        }
        Some(slot)
    }

    /// Stop every executor and wait until the spawned ones are gone
    pub async fn shutdown(&mut self) {
        let task_ids: Vec<TaskId> = self.slots.keys().cloned().collect();
        let mut waiters = Vec::new();
        for task_id in task_ids {
            if let Some(slot) = self.terminate(&task_id) {
                if let SlotKind::Spawned { waiter, .. } = slot.kind {
                    waiters.push(waiter);
                }
            }
        }
        for waiter in waiters {
            if let Err(e) = waiter.await {
                warn!("Worker wait task failed: {}", e);
            }
        }
    }

    /// Externally visible view of the slots, keyed by worker id
    pub fn snapshot(&self) -> BTreeMap<String, WorkerSnapshot> {
        self.slots
            .values()
            .map(|slot| {
                (
                    slot.worker_id.clone(),
                    WorkerSnapshot {
                        task_id: slot.task_id.clone(),
                        start_time: slot.start_time,
                    },
                )
            })
            .collect()
    }
}
