//! Commander and worker configuration
//!
//! Read from `system/config.json`. A missing file is created with defaults;
//! a file that exists but cannot be parsed is an initialization error.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths::write_json_atomic;
use crate::{Error, Result};

pub const MAX_WORKERS_ENV: &str = "MEMENTO_MAX_WORKERS";
pub const WORKER_TIMEOUT_ENV: &str = "MEMENTO_WORKER_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Concurrency ceiling for executor processes
    pub max_workers: usize,
    /// Deadline in milliseconds, enforced by both the commander and the executor
    pub worker_timeout: u64,
    /// How many times a failed task is re-enqueued
    pub retry_attempts: u32,
    pub log_level: String,
    pub auto_backup: bool,
    pub backup_interval: String,
    /// Program and arguments of the agent an executor drives
    pub agent_command: Vec<String>,
    /// Program and arguments of the interactive session; empty runs headless
    pub session_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 3,
            worker_timeout: 300_000,
            retry_attempts: 3,
            log_level: "INFO".to_string(),
            auto_backup: true,
            backup_interval: "daily".to_string(),
            agent_command: vec!["claude".to_string(), "--print".to_string()],
            session_command: vec!["claude".to_string()],
        }
    }
}

impl Config {
    /// Load the config file, writing defaults if it does not exist yet
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str::<Config>(&content).map_err(|e| {
                Error::Initialization(format!("Invalid config {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                write_json_atomic(path, &config).await.map_err(|e| {
                    Error::Initialization(format!("Failed to write default config: {}", e))
                })?;
                info!("Created default config at {}", path.display());
                config
            }
            Err(e) => {
                return Err(Error::Initialization(format!(
                    "Failed to read config {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(config.with_env_overrides().normalized())
    }

    /// Apply `MEMENTO_MAX_WORKERS` / `MEMENTO_WORKER_TIMEOUT_MS` when set and valid
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(max_workers) = env_number(MAX_WORKERS_ENV) {
            self.max_workers = max_workers as usize;
        }
        if let Some(timeout) = env_number(WORKER_TIMEOUT_ENV) {
            self.worker_timeout = timeout;
        }
        self
    }

    fn normalized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout)
    }

    /// Default `tracing` filter directive derived from `logLevel`
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "TRACE" => "trace",
            "WARN" => "warn",
            "ERROR" | "FATAL" => "error",
            _ => "info",
        }
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
