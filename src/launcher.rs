//! Spawning, probing and signalling frp processes.
//!
//! The launcher never keeps a channel to the child: a spawned process is
//! tracked by pid only. Liveness is identifier based, so a pid that the OS
//! recycles for an unrelated process is reported alive until that process
//! exits too.

use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Reasons a launch attempt can fail. The `Display` text is what ends up in
/// an instance's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("no config file selected")]
    ConfigMissing,
    #[error("binary path is not set")]
    BinaryMissing,
    #[error("failed to start: {0}")]
    SpawnFailed(String),
}

/// Handle to a spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wall-clock time of the spawn
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[cfg(test)]
    pub(crate) fn from_pid(pid: u32) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Spawn `binary -c config` in its own session with all stdio discarded.
///
/// Must be called from within a tokio runtime: the child is handed to the
/// runtime's orphan reaper when the local handle is dropped.
pub fn spawn(binary: &str, config: &str) -> Result<ProcessHandle, LaunchError> {
    if config.is_empty() {
        return Err(LaunchError::ConfigMissing);
    }
    if binary.is_empty() {
        return Err(LaunchError::BinaryMissing);
    }

    let mut cmd = Command::new(binary);
    cmd.arg("-c").arg(config);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    // New session so terminal signals aimed at the dashboard skip the child
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        warn!(binary, config, error = %e, "Failed to spawn process");
        LaunchError::SpawnFailed(e.to_string())
    })?;

    let pid = child
        .id()
        .ok_or_else(|| LaunchError::SpawnFailed("process exited before its pid was read".to_string()))?;

    info!(binary, config, pid, "Process spawned");

    Ok(ProcessHandle {
        pid,
        started_at: Utc::now(),
    })
}

/// Whether the process behind `handle` currently exists
pub fn is_alive(handle: Option<&ProcessHandle>) -> bool {
    match handle {
        Some(handle) => pid_exists(handle.pid),
        None => false,
    }
}

/// Ask the process to terminate and forget it.
///
/// Delivery failures are ignored and exit is not awaited; the handle is
/// cleared either way.
pub fn stop(handle: &mut Option<ProcessHandle>) {
    let Some(process) = handle.take() else {
        return;
    };
    debug!(pid = process.pid, "Sending SIGTERM");
    send_terminate(process.pid);
}

#[cfg(target_os = "linux")]
fn pid_exists(pid: u32) -> bool {
    // A zombie still has a /proc entry but is not running
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => proc_state(&stat).map(|state| state != 'Z').unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_exists(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_exists(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// State letter from a `/proc/<pid>/stat` line. The command name sits in
/// parentheses and may itself contain spaces or parentheses.
#[cfg(target_os = "linux")]
fn proc_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
