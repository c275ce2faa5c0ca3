//! chainfleet-daemon - node fleet orchestrator
//!
//! Supervises the shared publisher node and the per-tenant nodes, runs chain
//! opens and score submits through the two-phase queue and serves the
//! operator HTTP surface.
//!
//! # Runtime
//!
//! `main` is synchronous: arguments are parsed and the Tokio runtime is
//! built explicitly before `async_main` runs on it.
//!
//! # Shutdown
//!
//! SIGTERM or SIGINT sets the shutdown flag and shuts the queue down: in-flight
//! jobs finish, queued live submits are persisted and queued opens are
//! answered with 503. The HTTP server then drains, every supervisor is
//! stopped, tenants first, and the PID file is removed.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chainfleet_core::config::FleetConfig;
use chainfleet_core::executor::{RemoteOperationExecutor, RetryTiming, retry_async};
use chainfleet_core::gate::ReadinessGate;
use chainfleet_core::process::{OsLauncher, ProcessLauncher};
use chainfleet_core::registry::ProcessRegistry;
use chainfleet_daemon::chain::{NodeChainOperations, PublisherEndpoint};
use chainfleet_daemon::handlers;
use chainfleet_daemon::metrics::new_shared_registry;
use chainfleet_daemon::queue::TwoPhaseQueue;
use chainfleet_daemon::state::{DaemonState, OrchestratorStateStore, SharedState};
use chainfleet_daemon::store::DurableSubmitStore;
use clap::Parser;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default configuration file, used when present.
const DEFAULT_CONFIG: &str = "chainfleet.toml";

/// Publisher auto-start attempts.
const AUTOSTART_ATTEMPTS: u32 = 3;

/// chainfleet daemon - node fleet orchestrator
#[derive(Parser, Debug)]
#[command(name = "chainfleet-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults to ./chainfleet.toml when
    /// present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the operator HTTP surface
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory for the durable submit store and orchestrator state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Path to PID file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Start the publisher node at boot
    #[arg(long)]
    autostart: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Load the config file and apply CLI overrides.
fn load_config(args: &Args) -> Result<FleetConfig> {
    let mut config = match &args.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            FleetConfig::from_file(Path::new(DEFAULT_CONFIG))
                .with_context(|| format!("failed to load config {DEFAULT_CONFIG}"))?
        },
        None => {
            info!("No {DEFAULT_CONFIG} found, using defaults");
            FleetConfig::default()
        },
    };

    if let Some(listen) = args.listen {
        config.daemon.listen = listen;
    }
    if let Some(state_dir) = &args.state_dir {
        config.daemon.state_dir.clone_from(state_dir);
    }
    if let Some(pid_file) = &args.pid_file {
        config.daemon.pid_file.clone_from(pid_file);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Write PID file atomically.
fn write_pid_file(pid_path: &Path) -> Result<()> {
    chainfleet_daemon::fs_safe::atomic_write(pid_path, std::process::id().to_string().as_bytes())
        .context("failed to write PID file atomically")?;
    info!("PID file written to {:?}", pid_path);
    Ok(())
}

/// Remove PID file.
fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("Failed to remove PID file: {e}");
        }
    }
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let config = load_config(&args)?;
    std::fs::create_dir_all(&config.daemon.state_dir).with_context(|| {
        format!(
            "failed to create state dir {}",
            config.daemon.state_dir.display()
        )
    })?;

    let pid_file = config.daemon.pid_file.clone();
    write_pid_file(&pid_file)?;

    let result = run(Arc::new(config), &args).await;
    remove_pid_file(&pid_file);
    if let Err(e) = &result {
        error!(error = %e, "Daemon exited with error");
    }
    result
}

async fn run(config: Arc<FleetConfig>, args: &Args) -> Result<()> {
    let state_dir = config.daemon.state_dir.clone();

    let orchestrator = Arc::new(
        OrchestratorStateStore::load(&state_dir).context("failed to load orchestrator state")?,
    );
    let snapshot = orchestrator.snapshot();
    info!(
        ready = snapshot.is_ready(),
        tenants = snapshot.tenant_ports.len(),
        "Orchestrator state loaded"
    );

    let launcher: Arc<dyn ProcessLauncher> = Arc::new(OsLauncher::new());
    let registry = Arc::new(
        ProcessRegistry::new(Arc::clone(&config), launcher)
            .with_assignments(orchestrator.tenant_ports()),
    );

    let metrics = if args.no_metrics {
        info!("Metrics endpoint disabled");
        None
    } else {
        Some(new_shared_registry().context("failed to create metrics registry")?)
    };

    let executor = RemoteOperationExecutor::new(RetryTiming::from_config(&config.executor))
        .context("failed to build HTTP client")?;
    let gate: Arc<dyn ReadinessGate> = Arc::clone(&registry) as Arc<dyn ReadinessGate>;
    let endpoint = Arc::new(PublisherEndpoint::new(
        Arc::clone(&registry),
        config.chain.node_host.clone(),
    ));
    let ops = Arc::new(NodeChainOperations::new(
        executor,
        Arc::clone(&gate),
        endpoint,
        Arc::clone(&orchestrator),
        config.chain.clone(),
        config.executor.open,
        config.executor.submit,
    ));

    let store = Arc::new(DurableSubmitStore::in_dir(&state_dir));
    match store.len() {
        Ok(0) => {},
        Ok(backlog) => info!(backlog, "Durable submit backlog found, it drains once the publisher is ready"),
        Err(e) => warn!(error = %e, "Failed to read durable submit store"),
    }

    let queue = Arc::new(
        TwoPhaseQueue::builder(ops, gate, store)
            .config(config.queue.clone())
            .gate_config(config.gate)
            .metrics(metrics.as_ref().map(|m| m.daemon_metrics().clone()))
            .start(),
    );

    let state: SharedState = Arc::new(DaemonState::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        orchestrator,
        metrics,
    ));

    if args.autostart {
        autostart_publisher(&registry).await;
    }

    let sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    let listener = tokio::net::TcpListener::bind(config.daemon.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.daemon.listen))?;
    info!(addr = %config.daemon.listen, "Operator HTTP server listening");

    let served = handlers::serve(listener, state.clone(), wait_for_signal(sigterm, sigint)).await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server error");
    }
    if !state.is_shutdown_requested() {
        state.request_shutdown();
    }

    // Already done when a signal ended the server.
    queue.shutdown().await;
    info!("Stopping node processes");
    registry.stop_all().await;
    info!("Shutdown complete");

    served.context("HTTP server error")?;
    Ok(())
}

async fn wait_for_signal(mut sigterm: Signal, mut sigint: Signal) {
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}

async fn autostart_publisher(registry: &Arc<ProcessRegistry>) {
    let started = retry_async(AUTOSTART_ATTEMPTS, Duration::from_secs(2), |attempt| {
        let registry = Arc::clone(registry);
        async move {
            debug!(attempt, "Auto-starting publisher");
            let sup = registry
                .publisher_for_port(None)
                .await
                .map_err(|e| e.to_string())?;
            sup.start().await.map_err(|e| e.to_string())
        }
    })
    .await;

    match started {
        Ok(pid) => info!(pid, port = registry.publisher_port(), "Publisher auto-started"),
        Err(e) => error!(error = %e, "Publisher auto-start failed, start it via the API"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("chainfleet-daemon").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(
            &path,
            "[daemon]\nlisten = \"127.0.0.1:7000\"\nstate_dir = \"/var/lib/fleet\"\n",
        )
        .unwrap();

        let args = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "0.0.0.0:7100",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.daemon.listen, "0.0.0.0:7100".parse().unwrap());
        assert_eq!(config.daemon.state_dir, PathBuf::from("/var/lib/fleet"));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = parse(&["--config", "/nonexistent/chainfleet.toml"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[queue]\nopen_workers = 0\n").unwrap();

        let args = parse(&["--config", path.to_str().unwrap()]);
        let err = load_config(&args).unwrap_err();
        assert!(format!("{err:#}").contains("worker"));
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_path = dir.path().join("daemon.pid");

        write_pid_file(&pid_path).unwrap();
        let written = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(written, std::process::id().to_string());

        remove_pid_file(&pid_path);
        assert!(!pid_path.exists());
    }
}
