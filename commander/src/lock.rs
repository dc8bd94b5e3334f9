//! Single-writer guard for a task store
//!
//! `system/commander.lock` holds the pid of the running commander. The file
//! is created exclusively; a lock left behind by a dead process is stale and
//! gets replaced.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use memento_core::Error;

use crate::error::Result;
use crate::pid;

const ACQUIRE_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
/// A lock without a readable pid is only stale once it is this old
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct CommanderLock {
    path: PathBuf,
    pid: u32,
}

enum Holder {
    Live(u32),
    /// Written by a commander that is still acquiring it
    Unsettled,
    Stale(Option<u32>),
}

impl CommanderLock {
    /// Take the lock, replacing it when its holder is gone.
    ///
    /// The pid is written to a private file first and hard-linked into place,
    /// so the lock never exists without its content.
    pub async fn acquire(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        let staged = path.with_extension(format!("lock.{}", pid));
        write_staged(&staged, pid).await?;

        let acquired = Self::link_staged(path, &staged, pid).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!("Failed to remove staged lock {}: {}", staged.display(), e);
        }
        acquired
    }

    async fn link_staged(path: &Path, staged: &Path, pid: u32) -> Result<Self> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            match tokio::fs::hard_link(staged, path).await {
                Ok(()) => {
                    info!(pid, "Acquired commander lock {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match inspect_holder(path, pid).await {
                    Holder::Live(holder) => return Err(Error::LockHeld { pid: holder }.into()),
                    Holder::Unsettled => tokio::time::sleep(RETRY_DELAY).await,
                    Holder::Stale(holder) => {
                        warn!(?holder, "Removing stale commander lock");
                        match tokio::fs::remove_file(path).await {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Initialization(format!(
            "Could not acquire commander lock {}",
            path.display()
        ))
        .into())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lock file if it still names this process
    pub async fn release(self) -> Result<()> {
        if read_holder(&self.path).await == Some(self.pid) {
            tokio::fs::remove_file(&self.path).await?;
            info!("Released commander lock");
        }
        Ok(())
    }
}

async fn write_staged(staged: &Path, pid: u32) -> Result<()> {
    let mut file = tokio::fs::File::create(staged).await?;
    file.write_all(pid.to_string().as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

async fn inspect_holder(path: &Path, own_pid: u32) -> Holder {
    match read_holder(path).await {
        Some(holder) if holder != own_pid && pid::is_alive(holder) => Holder::Live(holder),
        Some(holder) => Holder::Stale(Some(holder)),
        None => {
            let age = tokio::fs::metadata(path)
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            match age {
                Some(age) if age < UNREADABLE_GRACE => Holder::Unsettled,
                _ => Holder::Stale(None),
            }
        }
    }
}

async fn read_holder(path: &Path) -> Option<u32> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.trim().parse().ok()
}
