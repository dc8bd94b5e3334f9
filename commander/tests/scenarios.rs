//! End-to-end runs of the coordinator against the real worker binary with
//! `sh` scripts standing in for the agent.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use memento_commander::{Coordinator, CoordinatorHandle, SweepIntervals, WorkerLauncher};
use memento_core::paths::{write_json_atomic, MEMENTO_DIR_ENV};
use memento_core::task::{
    FileTaskStore, MemoryContext, ResultStatus, Task, TaskId, TaskRepository, TaskStatus,
};
use memento_core::{Config, MemoryBank, MementoPaths, StatusStore};

const WORKER: &str = env!("CARGO_BIN_EXE_memento-worker");
const WAIT_LIMIT: Duration = Duration::from_secs(20);

const SUCCEED: &str = "cat >/dev/null; \
    printf '%s\\n%s\\n%s\\n' '<<<MEMENTO_RESULT_START>>>' \
    '{\"status\":\"success\",\"summary\":\"done\"}' '<<<MEMENTO_RESULT_END>>>'";

struct Harness {
    _temp: TempDir,
    paths: MementoPaths,
    store: Arc<FileTaskStore>,
}

impl Harness {
    async fn new(agent_script: &str, overrides: serde_json::Value) -> Self {
        let temp = TempDir::new().unwrap();
        let paths = MementoPaths::new(temp.path().join(".memento"));
        paths.ensure().await.unwrap();

        let mut config = json!({
            "maxWorkers": 3,
            "workerTimeout": 10_000,
            "retryAttempts": 0,
            "agentCommand": ["sh", "-c", agent_script],
            "sessionCommand": [],
        });
        for (key, value) in overrides.as_object().unwrap() {
            config[key] = value.clone();
        }
        write_json_atomic(&paths.config_path(), &config).await.unwrap();

        let store = Arc::new(FileTaskStore::open(paths.clone()).await.unwrap());
        Self {
            _temp: temp,
            paths,
            store,
        }
    }

    fn worker_launcher(&self) -> WorkerLauncher {
        WorkerLauncher::new(WORKER).env(MEMENTO_DIR_ENV, self.paths.root().to_string_lossy())
    }

    async fn coordinator_with(&self, launcher: WorkerLauncher, intervals: SweepIntervals) -> Coordinator {
        let config = Config::load_or_init(&self.paths.config_path()).await.unwrap();
        Coordinator::new(
            self.store.clone(),
            MemoryBank::new(self.paths.memory_dir()),
            StatusStore::new(self.paths.status_path()),
            config,
            launcher,
        )
        .with_intervals(intervals)
    }

    async fn start(&self) -> (CoordinatorHandle, tokio::task::JoinHandle<memento_commander::Result<()>>) {
        let coordinator = self
            .coordinator_with(self.worker_launcher(), fast_intervals())
            .await;
        let handle = coordinator.handle();
        (handle, tokio::spawn(coordinator.run()))
    }

    /// Poll the store until the task satisfies `done`
    async fn wait_for(&self, id: &TaskId, done: impl Fn(&Task) -> bool) -> Task {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            if let Some(task) = self.store.get(id).await.unwrap() {
                if done(&task) {
                    return task;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {} did not reach the expected state",
                id
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn fast_intervals() -> SweepIntervals {
    SweepIntervals {
        timeout: Duration::from_millis(100),
        completion: Duration::from_millis(100),
        session_restart: Duration::from_millis(100),
    }
}

fn is_completed(task: &Task) -> bool {
    task.status == TaskStatus::Completed && task.result.is_some()
}

#[tokio::test]
async fn immediate_dispatch_completes_successfully() {
    let harness = Harness::new(SUCCEED, json!({})).await;
    let (handle, running) = harness.start().await;

    let task = handle.submit("t1").await.unwrap();
    let done = harness.wait_for(&task.id, |t| is_completed(t) && t.processed).await;

    let result = done.result.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.summary, "done");
    assert!(done.worker_id.as_deref().unwrap().starts_with("worker_"));
    assert!(done.processing_start_time.is_some());
    assert!(done.completed_at.is_some());

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn task_created_at_capacity_waits_for_a_free_slot() {
    let slow = format!("sleep 1; {}", SUCCEED);
    let harness = Harness::new(&slow, json!({ "maxWorkers": 1 })).await;
    let (handle, running) = harness.start().await;

    let first = handle.submit("first").await.unwrap();
    let second = handle.submit("second").await.unwrap();
    assert_eq!(handle.active_workers().await.unwrap(), 1);
    assert_eq!(
        harness.store.locate(&second.id).await.unwrap(),
        Some(TaskStatus::Pending)
    );

    let first = harness.wait_for(&first.id, is_completed).await;
    let second = harness.wait_for(&second.id, is_completed).await;

    assert!(first.result.unwrap().is_success());
    assert!(second.result.unwrap().is_success());
    // The queued task was only claimed after the first one finished
    assert!(second.processing_start_time.unwrap() >= first.completed_at.unwrap());
    assert!(handle.active_workers().await.unwrap() <= 1);

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn agent_past_deadline_is_killed_and_task_fails() {
    let harness = Harness::new("sleep 30", json!({ "workerTimeout": 500 })).await;
    // Leave enforcement to the executor's own deadline
    let coordinator = harness
        .coordinator_with(
            harness.worker_launcher(),
            SweepIntervals {
                timeout: Duration::from_secs(60),
                ..fast_intervals()
            },
        )
        .await;
    let handle = coordinator.handle();
    let running = tokio::spawn(coordinator.run());

    let task = handle.submit("slow").await.unwrap();
    let done = harness.wait_for(&task.id, is_completed).await;

    let result = done.result.unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert!(result.is_timeout());
    let execution_ms = done.execution_time.unwrap();
    assert!(
        (500..5_000).contains(&execution_ms),
        "execution time {} ms",
        execution_ms
    );

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn commander_times_out_a_stuck_worker() {
    let harness = Harness::new(SUCCEED, json!({ "workerTimeout": 300 })).await;
    // A worker that never touches the store
    let launcher = WorkerLauncher::new("sh").arg("-c").arg("sleep 30");
    let coordinator = harness.coordinator_with(launcher, fast_intervals()).await;
    let handle = coordinator.handle();
    let running = tokio::spawn(coordinator.run());

    let task = handle.submit("stuck").await.unwrap();
    let done = harness.wait_for(&task.id, is_completed).await;

    assert!(done.result.unwrap().is_timeout());
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while handle.active_workers().await.unwrap() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "slot was never freed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_with_unknown_task_leaves_store_unchanged() {
    let harness = Harness::new(SUCCEED, json!({})).await;
    let existing = harness
        .store
        .create("untouched", MemoryContext::new())
        .await
        .unwrap();

    let status = tokio::process::Command::new(WORKER)
        .arg("task_0_missing")
        .env(MEMENTO_DIR_ENV, harness.paths.root())
        .status()
        .await
        .unwrap();

    assert_eq!(status.code(), Some(1));
    let stats = harness.store.stats().await.unwrap();
    assert_eq!((stats.pending, stats.processing, stats.completed), (1, 0, 0));
    assert_eq!(
        harness.store.locate(&existing.id).await.unwrap(),
        Some(TaskStatus::Pending)
    );
}

#[tokio::test]
async fn restart_resolves_orphaned_processing_task() {
    let harness = Harness::new(SUCCEED, json!({})).await;

    // Claimed by an executor that no longer exists
    let orphan = harness
        .store
        .create("orphan", MemoryContext::new())
        .await
        .unwrap();
    harness
        .store
        .claim(&orphan.id, "worker_gone", None)
        .await
        .unwrap();
    // Queued before the crash and never dispatched
    let queued = harness
        .store
        .create("queued", MemoryContext::new())
        .await
        .unwrap();

    let (handle, running) = harness.start().await;

    let orphan = harness.wait_for(&orphan.id, is_completed).await;
    let result = orphan.result.unwrap();
    assert_eq!(result.status, ResultStatus::Failed);
    assert_eq!(result.errors, vec!["commander_restart".to_string()]);

    let queued = harness.wait_for(&queued.id, is_completed).await;
    assert!(queued.result.unwrap().is_success());

    handle.shutdown();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_task_is_retried_up_to_the_budget() {
    let harness = Harness::new("cat >/dev/null; exit 3", json!({ "retryAttempts": 1 })).await;
    let (handle, running) = harness.start().await;

    let original = handle.submit("always fails").await.unwrap();
    harness.wait_for(&original.id, |t| is_completed(t) && t.processed).await;

    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    let retry = loop {
        let completed = harness.store.list(TaskStatus::Completed).await.unwrap();
        if let Some(retry) = completed
            .into_iter()
            .find(|t| t.retry_of.as_ref() == Some(&original.id) && t.processed)
        {
            break retry;
        }
        assert!(tokio::time::Instant::now() < deadline, "retry never completed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.description, "always fails");
    assert_eq!(retry.result.unwrap().status, ResultStatus::Failed);

    // Budget exhausted: nothing else gets queued
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = harness.store.stats().await.unwrap();
    assert_eq!((stats.pending, stats.processing, stats.completed), (0, 0, 2));

    handle.shutdown();
    running.await.unwrap().unwrap();
}
