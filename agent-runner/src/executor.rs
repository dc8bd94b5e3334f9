//! Task executor - drives one task from pending to completed

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use memento_core::task::{Task, TaskId, TaskRepository, TaskResult, TaskStatus};
use memento_core::Config;

use crate::error::{ExecutorError, Result};
use crate::event::{AgentEvent, AgentOutcome, OutputStream};
use crate::process::{AgentCommand, AgentConfig, AgentProcess};
use crate::protocol::{build_instruction, ResultScanner, ScanOutcome};

/// How long to keep draining output after the agent exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the task executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent program and arguments
    pub agent_command: Vec<String>,
    /// Wall-clock deadline for one agent invocation
    pub timeout: Duration,
    /// Working directory for the agent
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the agent
    pub env: Vec<(String, String)>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_command: config.agent_command.clone(),
            timeout: config.worker_timeout(),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

/// Generate a worker id in the same style as task ids
pub fn generate_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "worker_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

/// Supervises exactly one agent invocation for one task
pub struct TaskExecutor {
    store: Arc<dyn TaskRepository>,
    config: ExecutorConfig,
    worker_id: String,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn TaskRepository>, config: ExecutorConfig, worker_id: String) -> Self {
        Self {
            store,
            config,
            worker_id,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop early when this token is cancelled (the task still gets resolved)
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute a task.
    ///
    /// Errors are only returned when the task could not be loaded or
    /// claimed; the store is left untouched in that case. Once claimed the
    /// task always ends up in completed and its record is returned.
    pub async fn run(&self, task_id: &TaskId) -> Result<Task> {
        let task = match self.store.load(TaskStatus::Pending, task_id).await {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %task_id, "Cannot load pending task: {}", e);
                return Err(e.into());
            }
        };

        let task = match self
            .store
            .claim(&task.id, &self.worker_id, Some(std::process::id()))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %task_id, worker_id = %self.worker_id, "Cannot claim task: {}", e);
                return Err(e.into());
            }
        };

        info!(task_id = %task_id, worker_id = %self.worker_id, "Executing task");
        let result = self.supervise_guarded(task).await;

        match self.store.resolve(task_id, result.clone()).await {
            Ok(task) => Ok(task),
            Err(e) => {
                error!(task_id = %task_id, "Resolve failed, forcing terminal record: {}", e);
                Ok(self.store.force_resolve(task_id, result).await?)
            }
        }
    }

    /// Run the supervision in its own task so even a panic yields a result
    async fn supervise_guarded(&self, task: Task) -> TaskResult {
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let task_id = task.id.clone();

        let supervised = tokio::spawn(async move { supervise(&config, &cancel, &task).await });

        match supervised.await {
            Ok(Ok(outcome)) => {
                debug!(task_id = %task_id, ?outcome, "Agent finished");
                outcome.into_task_result(self.config.timeout)
            }
            Ok(Err(e)) => {
                warn!(task_id = %task_id, "Agent supervision failed: {}", e);
                failure_from_error(&e)
            }
            Err(join_err) => {
                error!(task_id = %task_id, "Agent supervision panicked: {}", join_err);
                TaskResult::failure("Executor crashed", join_err.to_string())
                    .with_error("executor_panic")
            }
        }
    }
}

fn failure_from_error(err: &ExecutorError) -> TaskResult {
    match err {
        ExecutorError::SpawnFailed { .. } | ExecutorError::InvalidAgentCommand { .. } => {
            TaskResult::failure("Failed to start agent", err.to_string()).with_error("spawn_failed")
        }
        _ => TaskResult::failure("Executor error", err.to_string()).with_error("executor_error"),
    }
}

/// Launch the agent and watch it until exit, deadline or cancellation
async fn supervise(
    config: &ExecutorConfig,
    cancel: &CancellationToken,
    task: &Task,
) -> Result<AgentOutcome> {
    let started = Instant::now();
    let deadline = started + config.timeout;

    let agent_config = AgentConfig {
        command: AgentCommand::from_argv(&config.agent_command)?,
        working_dir: config.working_dir.clone(),
        instruction: build_instruction(task),
        env: config.env.clone(),
    };

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let process = AgentProcess::spawn(agent_config, event_tx).await?;
    let mut handle = process.start_output_reader().await?;
    debug!(task_id = %task.id, pid = ?handle.pid(), "Agent started");

    let mut scanner = ResultScanner::new();
    let mut outcome = AgentOutcome::default();
    let mut exited = false;
    let mut streams_open = true;
    let mut drain_until = deadline;

    loop {
        if exited && !streams_open {
            break;
        }

        tokio::select! {
            event = event_rx.recv(), if streams_open => match event {
                Some(AgentEvent::Output { stream: OutputStream::Stdout, content }) => {
                    match scanner.push(&content) {
                        ScanOutcome::Parsed(_) => {
                            info!(task_id = %task.id, "Result block received");
                        }
                        ScanOutcome::Malformed(err) => {
                            warn!(task_id = %task.id, "Malformed result block, still scanning: {}", err);
                        }
                        ScanOutcome::Incomplete => {}
                    }
                }
                Some(AgentEvent::Output { stream: OutputStream::Stderr, content }) => {
                    debug!(task_id = %task.id, "agent stderr: {}", content);
                }
                Some(AgentEvent::StreamClosed { stream }) => {
                    debug!(task_id = %task.id, ?stream, "Agent stream closed");
                }
                None => streams_open = false,
            },
            exit = handle.wait_exit(), if !exited => {
                outcome.exit_code = exit?;
                exited = true;
                drain_until = deadline.min(Instant::now() + DRAIN_GRACE);
                debug!(task_id = %task.id, exit_code = ?outcome.exit_code, "Agent exited");
            }
            _ = tokio::time::sleep_until(drain_until) => {
                if exited {
                    warn!(task_id = %task.id, "Agent output still open after exit, giving up on it");
                } else {
                    warn!(
                        task_id = %task.id,
                        timeout_ms = config.timeout.as_millis() as u64,
                        "Agent exceeded its deadline, killing it"
                    );
                    outcome.timed_out = true;
                }
                break;
            }
            _ = cancel.cancelled() => {
                warn!(task_id = %task.id, "Execution cancelled, killing agent");
                outcome.cancelled = !exited;
                break;
            }
        }
    }

    if !exited {
        handle.kill().await?;
    }

    let (result, parse_error) = scanner.into_parts();
    outcome.result = result;
    outcome.parse_error = parse_error;
    outcome.elapsed = started.elapsed();
    Ok(outcome)
}
