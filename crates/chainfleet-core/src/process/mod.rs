//! Process management module.
//!
//! Defines what a node process is ([`ProcessSpec`]), the lifecycle states a
//! supervised node moves through, and the launcher seam the supervisor uses
//! to start, probe and kill OS processes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod launcher;
pub mod spawner;

pub use launcher::{OsLauncher, ProcessLauncher};

/// Identity of a managed node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ProcessId {
    /// The shared publisher node.
    Publisher,
    /// A tenant node keyed by tenant name.
    Tenant(String),
}

impl ProcessId {
    /// Label suitable for logs and metrics.
    #[must_use]
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Tenant(name) => write!(f, "tenant:{name}"),
        }
    }
}

/// Specification of a process to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Name used in logs.
    pub name: String,
    /// Executable.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    /// Start building a specification.
    #[must_use]
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }
}

/// Builder for [`ProcessSpec`].
#[derive(Debug, Default)]
pub struct ProcessSpecBuilder {
    name: String,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl ProcessSpecBuilder {
    /// Set the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the executable.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> ProcessSpec {
        ProcessSpec {
            name: self.name,
            command: self.command,
            args: self.args,
            cwd: self.cwd,
            env: self.env,
        }
    }
}

/// Lifecycle state of a supervised node.
///
/// `Stopped -> Starting -> Running -> (Unhealthy -> Restarting -> Running | Stopped)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No process; nothing is monitoring it.
    Stopped,
    /// A launch is in progress.
    Starting,
    /// The process was launched and last observed alive.
    Running,
    /// The monitor observed the process dead.
    Unhealthy,
    /// The monitor is relaunching the process.
    Restarting,
    /// The restart ceiling was reached; the monitor exited.
    GaveUp,
}

impl ProcessState {
    /// Whether a process is expected to be up in this state.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::GaveUp => "gave_up",
        };
        f.write_str(s)
    }
}

/// Snapshot of a supervised node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedProcess {
    /// Node identity.
    pub id: ProcessId,
    /// Current OS pid, if any.
    pub pid: Option<u32>,
    /// Port the node listens on.
    pub listen_port: u16,
    /// Arguments the node was launched with.
    pub executable_args: Vec<String>,
    /// Result of the most recent liveness observation.
    pub last_observed_alive: bool,
    /// When `state` last changed.
    pub last_state_change_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: ProcessState,
}

/// Process errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Spawning the process failed.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Signalling the process failed.
    #[error("failed to kill process {pid}: {reason}")]
    KillFailed {
        /// Target pid.
        pid: u32,
        /// OS error.
        reason: String,
    },

    /// The process exited right after launch.
    #[error("process {pid} exited during startup")]
    ExitedEarly {
        /// Pid of the exited process.
        pid: u32,
    },
}
