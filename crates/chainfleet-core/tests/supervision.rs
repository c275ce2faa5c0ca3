//! End-to-end supervision with real child processes.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::post;
use chainfleet_core::config::{CallProfile, GateConfig};
use chainfleet_core::executor::{RemoteOperationExecutor, RetryTiming};
use chainfleet_core::gate::{Readiness, ReadinessGate};
use chainfleet_core::process::{OsLauncher, ProcessId, ProcessLauncher, ProcessSpec, ProcessState};
use chainfleet_core::restart::{BackoffConfig, RestartPolicy};
use chainfleet_core::supervisor::{Supervisor, SupervisorOptions};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

fn fast_gate() -> GateConfig {
    GateConfig {
        poll_interval: Duration::from_millis(50),
        stable_for: Duration::from_millis(200),
        worker_wait: Duration::from_secs(2),
        worker_retry_delay: Duration::from_millis(50),
    }
}

fn fast_policy(max_restarts: Option<u32>) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        healthy_interval: Duration::from_millis(100),
        settle_interval: Duration::from_millis(100),
        liveness_checks: 2,
        liveness_interval: Duration::from_millis(50),
        backoff: BackoffConfig::Fixed {
            delay: Duration::from_millis(100),
        },
    }
}

fn tenant_supervisor(command: &str, args: &[&str], max_restarts: Option<u32>) -> Arc<Supervisor> {
    let spec = ProcessSpec::builder()
        .name("tenant-it")
        .command(command)
        .args(args.iter().copied())
        .build();
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(OsLauncher::new());
    let options = SupervisorOptions {
        start_grace: Duration::ZERO,
        stop_timeout: Duration::from_secs(2),
        port_probe_timeout: None,
        gate: fast_gate(),
    };

    Arc::new(Supervisor::new(
        ProcessId::Tenant("it".to_string()),
        spec,
        0,
        launcher,
        fast_policy(max_restarts),
        options,
    ))
}

#[allow(clippy::cast_possible_wrap)]
fn kill_externally(pid: u32) {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
}

#[cfg_attr(miri, ignore)] // Miri can't spawn processes
#[tokio::test]
async fn test_externally_killed_tenant_is_restarted() {
    let sup = tenant_supervisor("sleep", &["30"], Some(3));

    let first = sup.start().await.unwrap();
    assert_eq!(sup.wait_ready(Duration::from_secs(5)).await, Readiness::Ready);

    kill_externally(first);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let second = loop {
        if let Some(pid) = sup.pid() {
            if pid != first && sup.state() == ProcessState::Running {
                break pid;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "tenant was not restarted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_ne!(first, second);
    assert!(sup.restarts() >= 1);
    assert_eq!(sup.wait_ready(Duration::from_secs(5)).await, Readiness::Ready);

    assert_eq!(sup.stop().await.unwrap(), Some(second));
}

#[cfg_attr(miri, ignore)] // Miri can't spawn processes
#[tokio::test]
async fn test_call_waiting_on_gate_succeeds_after_restart() {
    let app = Router::new().route("/graphql", post(|| async { r#"{"data":{"ok":true}}"# }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/graphql", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let sup = tenant_supervisor("sleep", &["30"], Some(3));
    let pid = sup.start().await.unwrap();
    kill_externally(pid);

    // The executor blocks on the gate while the monitor relaunches.
    let executor = RemoteOperationExecutor::new(RetryTiming {
        wait_cap: Duration::from_secs(1),
        base_delay: Duration::from_millis(50),
        step: Duration::from_millis(10),
    })
    .unwrap();
    let profile = CallProfile::new(Duration::from_secs(10), Duration::from_secs(5));
    let response = executor
        .execute(sup.as_ref(), &url, &|| b"{}".to_vec(), profile)
        .await
        .unwrap();

    assert_eq!(response.json().unwrap()["data"]["ok"], true);
    assert_ne!(sup.pid(), Some(pid));
    sup.stop().await.unwrap();
}

#[cfg_attr(miri, ignore)] // Miri can't spawn processes
#[tokio::test]
async fn test_crashing_tenant_gives_up() {
    // Exits immediately on every launch
    let sup = tenant_supervisor("sh", &["-c", "exit 1"], Some(3));

    // The first launch can race the exit; either outcome is fine here.
    let _ = sup.start().await;
    sup.ensure_monitor();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while sup.state() != ProcessState::GaveUp {
        assert!(tokio::time::Instant::now() < deadline, "monitor never gave up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(matches!(
        sup.wait_ready(Duration::from_millis(200)).await,
        Readiness::Failed(_)
    ));
}
