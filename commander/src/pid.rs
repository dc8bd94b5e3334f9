//! Process id helpers for processes we did not spawn ourselves

use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Child;
use tracing::warn;

/// Process start times are only known to the second
const START_TIME_SLACK_SECS: i64 = 2;

/// Whether a process with this pid currently exists
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence and permission
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

/// Whether `pid` is still the process that claimed a task at `claimed_at`.
///
/// A pid can be reused after the claimant dies (or the machine reboots); a
/// process that started after the claim belongs to someone else.
pub fn is_claimant(pid: u32, claimed_at: DateTime<Utc>) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let Some(process) = system.process(pid) else {
        return false;
    };
    let started = i64::try_from(process.start_time()).unwrap_or(i64::MAX);
    started <= claimed_at.timestamp() + START_TIME_SLACK_SECS
}

/// Stop a claimant we did not spawn: SIGTERM, then SIGKILL after `grace`.
///
/// Nothing is signalled unless the pid still belongs to the claimant.
pub fn stop_claimant(pid: u32, claimed_at: DateTime<Utc>, grace: Duration) {
    if !is_claimant(pid, claimed_at) || !terminate(pid) {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if is_claimant(pid, claimed_at) {
            warn!(pid, "Worker ignored SIGTERM, killing it");
            force_kill(pid);
        }
    });
}

/// Ask a process to stop
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    send(pid, libc::SIGTERM)
}

/// Kill a process outright
#[cfg(unix)]
pub fn force_kill(pid: u32) -> bool {
    send(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send(pid: u32, signal: libc::c_int) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, signal) == 0 },
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn force_kill(_pid: u32) -> bool {
    false
}

/// Stop a child: SIGTERM first, SIGKILL once the grace period runs out.
///
/// Returns the exit code if the child exited normally.
pub async fn stop_child(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        terminate(pid);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status.ok().and_then(|s| s.code());
        }
        warn!(pid, "Process ignored SIGTERM, killing it");
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill process: {}", e);
    }
    None
}
