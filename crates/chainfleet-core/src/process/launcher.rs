//! Launcher seam between supervisors and the operating system.
//!
//! The supervisor only needs three capabilities from the OS: start a spec and
//! get a pid back, ask whether a pid is alive, and terminate a pid.
//! [`OsLauncher`] implements them with tokio child processes and POSIX
//! signals; tests substitute in-memory launchers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::spawner::spawn_node;
use super::{ProcessError, ProcessSpec};

/// Start, probe and kill OS processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launch a process and return its pid.
    async fn launch(&self, spec: &ProcessSpec) -> Result<u32, ProcessError>;

    /// Whether `pid` still refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Terminate `pid`: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Killing a pid that is already gone is not an error.
    async fn kill(&self, pid: u32, grace: Duration) -> Result<(), ProcessError>;
}

/// Launcher backed by real child processes.
///
/// Children launched here are kept so their exit status can be reaped;
/// otherwise an exited child would linger as a zombie and still answer a
/// signal-0 probe.
#[derive(Default)]
pub struct OsLauncher {
    children: Mutex<HashMap<u32, Child>>,
}

impl OsLauncher {
    /// Create a launcher with no tracked children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[allow(clippy::cast_possible_wrap)] // pids fit in i32
fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

/// Signal-0 probe. `EPERM` still means the pid exists.
fn pid_exists(pid: u32) -> bool {
    matches!(kill(to_pid(pid), None), Ok(()) | Err(Errno::EPERM))
}

fn signal(pid: u32, sig: Signal) -> Result<bool, ProcessError> {
    match kill(to_pid(pid), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(ProcessError::KillFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl ProcessLauncher for OsLauncher {
    async fn launch(&self, spec: &ProcessSpec) -> Result<u32, ProcessError> {
        let spawned = spawn_node(spec)?;
        let pid = spawned.pid;
        info!(process = %spec.name, pid, command = %spec.command, "Launched process");
        self.children().insert(pid, spawned.child);
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children();
        let Some(child) = children.get_mut(&pid) else {
            return pid_exists(pid);
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(pid, %status, "Process exited");
                children.remove(&pid);
                false
            },
            Err(e) => {
                warn!(pid, error = %e, "Failed to query process status");
                children.remove(&pid);
                false
            },
        }
    }

    async fn kill(&self, pid: u32, grace: Duration) -> Result<(), ProcessError> {
        let child = self.children().remove(&pid);

        if !signal(pid, Signal::SIGTERM)? {
            debug!(pid, "Process already gone");
            if let Some(mut child) = child {
                let _ = child.wait().await;
            }
            return Ok(());
        }

        if let Some(mut child) = child {
            if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
                debug!(pid, ?result, "Process exited after SIGTERM");
                return Ok(());
            }
            warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
            child
                .start_kill()
                .map_err(|e| ProcessError::KillFailed {
                    pid,
                    reason: e.to_string(),
                })?;
            let _ = child.wait().await;
            return Ok(());
        }

        // Not our child: poll until it disappears or the grace expires.
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !pid_exists(pid) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        signal(pid, Signal::SIGKILL)?;
        Ok(())
    }
}
