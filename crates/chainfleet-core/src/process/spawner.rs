//! Node process spawning.
//!
//! Nodes are started with stdin closed and both output streams piped into
//! the daemon's log. Node services write their own leveled log lines, so a
//! line that carries `ERROR` or `WARN` is re-emitted as a warning and
//! everything else at debug.

use std::io;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{ProcessError, ProcessSpec};

/// A launched node: the child handle to reap and its pid.
pub struct SpawnedNode {
    pub child: Child,
    pub pid: u32,
}

fn command_for(spec: &ProcessSpec) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Supervisors own termination.
        .kill_on_drop(false);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

fn spawn_error(spec: &ProcessSpec, err: &io::Error) -> ProcessError {
    let reason = match err.kind() {
        io::ErrorKind::NotFound => format!("{}: command not found", spec.command),
        io::ErrorKind::PermissionDenied => format!("{}: permission denied", spec.command),
        _ => format!("{}: {err}", spec.command),
    };
    ProcessError::SpawnFailed(reason)
}

/// Launch a node and start forwarding its output.
///
/// Piped output must be drained or the child blocks once the pipe fills,
/// so both streams get a forwarding task.
pub fn spawn_node(spec: &ProcessSpec) -> Result<SpawnedNode, ProcessError> {
    let mut child = command_for(spec).spawn().map_err(|e| spawn_error(spec, &e))?;

    let Some(pid) = child.id() else {
        return Err(ProcessError::SpawnFailed(format!(
            "{}: exited before its pid was read",
            spec.command
        )));
    };

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, spec.name.clone(), pid);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, spec.name.clone(), pid);
    }

    Ok(SpawnedNode { child, pid })
}

fn is_warning(line: &str) -> bool {
    line.contains("ERROR") || line.contains("WARN")
}

/// Forward one output stream until EOF.
///
/// Lines are read as bytes so non-UTF-8 output cannot end the loop; the
/// pipe must stay open for the life of the node or its next write fails
/// with `EPIPE`. After a read error the rest of the stream is discarded
/// rather than dropped.
fn forward_lines<R>(reader: R, node: String, pid: u32)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if is_warning(line) {
                        warn!(node = %node, pid, "{line}");
                    } else {
                        debug!(node = %node, pid, "{line}");
                    }
                },
                Err(e) => {
                    warn!(node = %node, pid, error = %e, "Failed to read node output, discarding the rest");
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    break;
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::builder()
            .name(name)
            .command("sh")
            .args(["-c", script])
            .build()
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_node_sees_port_env() {
        let spec = ProcessSpec::builder()
            .name("tenant-env")
            .command("sh")
            .args(["-c", "test \"$NODE_PORT\" = 8123"])
            .env("NODE_PORT", "8123")
            .build();

        let mut node = spawn_node(&spec).unwrap();
        assert!(node.pid > 0);
        assert!(node.child.wait().await.unwrap().success());
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_chatty_node_does_not_block_on_full_pipe() {
        let spec = sh(
            "chatty",
            "i=0; while [ $i -lt 20000 ]; do echo line $i; echo WARN $i >&2; i=$((i+1)); done",
        );

        let mut node = spawn_node(&spec).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(30), node.child.wait())
            .await
            .expect("node blocked on its output pipe")
            .unwrap();
        assert!(status.success());
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_non_utf8_output_keeps_pipe_open() {
        let spec = sh(
            "binary-noise",
            "printf '\\377\\n'; sleep 0.3; i=0; while [ $i -lt 5 ]; do echo hi; echo hi >&2; i=$((i+1)); done",
        );

        let mut node = spawn_node(&spec).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), node.child.wait())
            .await
            .expect("node did not exit")
            .unwrap();
        // Killed by SIGPIPE if the reader had gone away.
        assert!(status.success(), "{status:?}");
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_missing_binary_reports_not_found() {
        let spec = ProcessSpec::builder()
            .name("missing")
            .command("linera_binary_that_does_not_exist")
            .build();

        let Err(ProcessError::SpawnFailed(reason)) = spawn_node(&spec) else {
            panic!("spawn should fail");
        };
        assert!(reason.ends_with("command not found"), "{reason}");
    }

    #[test]
    fn test_warning_classification() {
        assert!(is_warning("2024-01-01 ERROR linera_service: boom"));
        assert!(is_warning(" WARN retrying"));
        assert!(!is_warning("INFO listening on 8080"));
    }
}
