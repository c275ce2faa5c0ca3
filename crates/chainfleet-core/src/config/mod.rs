//! Configuration parsing and management.
//!
//! This module handles parsing of the fleet configuration file (TOML) that
//! defines how node processes are launched, how they are supervised, and how
//! the two-phase queue and remote executor are tuned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::ProcessSpec;
use crate::restart::{BackoffConfig, RestartPolicy};

/// Top-level fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Shared publisher node.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Per-tenant nodes.
    #[serde(default)]
    pub tenants: TenantConfig,

    /// Restart policies.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Stability gate timing.
    #[serde(default)]
    pub gate: GateConfig,

    /// Remote operation executor.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Two-phase queue.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Chain operations against the publisher node.
    #[serde(default)]
    pub chain: ChainConfig,
}

impl FleetConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject configurations that would leave the fleet unable to make
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.launch.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "publisher.command must not be empty".to_string(),
            ));
        }
        if self.tenants.launch.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "tenants.command must not be empty".to_string(),
            ));
        }
        if self.tenants.port_span == 0 {
            return Err(ConfigError::Validation(
                "tenants.port_span must be greater than zero".to_string(),
            ));
        }
        if u32::from(self.tenants.port_base) + u32::from(self.tenants.port_span) > 65_536 {
            return Err(ConfigError::Validation(
                "tenants.port_base + tenants.port_span exceeds the port range".to_string(),
            ));
        }
        if self.queue.open_workers == 0 || self.queue.submit_workers == 0 {
            return Err(ConfigError::Validation(
                "queue worker counts must be greater than zero".to_string(),
            ));
        }
        if self.queue.open_capacity == 0 || self.queue.submit_capacity == 0 {
            return Err(ConfigError::Validation(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        if self.queue.backlog_sweep.is_zero() {
            return Err(ConfigError::Validation(
                "queue.backlog_sweep must be greater than zero".to_string(),
            ));
        }
        for (name, profile) in [
            ("default", &self.executor.default),
            ("open", &self.executor.open),
            ("submit", &self.executor.submit),
        ] {
            if profile.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "executor.{name}.max_attempts must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the durable submit store and orchestrator state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Address of the operator HTTP surface.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path to the PID file.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            listen: default_listen(),
            pid_file: default_pid_file(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5290))
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("./data/chainfleet.pid")
}

/// How a node process is launched.
///
/// `{port}` and `{tenant}` placeholders in `args`, `env` values and `cwd`
/// are substituted at render time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchTemplate {
    /// Executable to run.
    #[serde(default = "default_command")]
    pub command: String,

    /// Command-line arguments.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

fn default_command() -> String {
    "linera".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "service".to_string(),
        "--port".to_string(),
        "{port}".to_string(),
    ]
}

impl LaunchTemplate {
    /// Render the template into a concrete process specification.
    #[must_use]
    pub fn render(&self, name: &str, port: u16, tenant: Option<&str>) -> ProcessSpec {
        let port = port.to_string();
        let tenant = tenant.unwrap_or_default();
        let fill = |value: &str| value.replace("{port}", &port).replace("{tenant}", tenant);

        let mut builder = ProcessSpec::builder()
            .name(name)
            .command(fill(&self.command))
            .args(self.args.iter().map(|a| fill(a)));

        for (key, value) in &self.env {
            builder = builder.env(key.clone(), fill(value));
        }

        if let Some(cwd) = &self.cwd {
            builder = builder.cwd(PathBuf::from(fill(&cwd.to_string_lossy())));
        }

        builder.build()
    }
}

/// Shared publisher node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Launch template.
    #[serde(flatten)]
    pub launch: LaunchTemplate,

    /// Port the publisher node listens on.
    #[serde(default = "default_publisher_port")]
    pub port: u16,

    /// Delay before launching so a previous instance can release its
    /// storage lock.
    #[serde(default = "default_start_grace", with = "humantime_serde")]
    pub start_grace: Duration,

    /// Also require a TCP connect to `port` for liveness.
    #[serde(default)]
    pub probe_port: bool,

    /// Timeout for that TCP connect.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            launch: LaunchTemplate::default(),
            port: default_publisher_port(),
            start_grace: default_start_grace(),
            probe_port: false,
            probe_timeout: default_probe_timeout(),
        }
    }
}

const fn default_publisher_port() -> u16 {
    8080
}

const fn default_start_grace() -> Duration {
    Duration::from_secs(1)
}

/// Per-tenant node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Launch template.
    #[serde(flatten)]
    pub launch: LaunchTemplate,

    /// First port of the tenant port range.
    #[serde(default = "default_port_base")]
    pub port_base: u16,

    /// Number of ports in the tenant port range.
    #[serde(default = "default_port_span")]
    pub port_span: u16,

    /// Timeout for the TCP liveness connect.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            launch: LaunchTemplate::default(),
            port_base: default_port_base(),
            port_span: default_port_span(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

const fn default_port_base() -> u16 {
    8082
}

const fn default_port_span() -> u16 {
    5000
}

const fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Restart policies for both supervisor variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Publisher policy (retries indefinitely by default).
    #[serde(default = "RestartPolicy::publisher")]
    pub publisher: RestartPolicy,

    /// Tenant policy (gives up after a restart ceiling by default).
    #[serde(default = "RestartPolicy::tenant")]
    pub tenant: RestartPolicy,

    /// How long `stop` waits for the monitor and then the process.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            publisher: RestartPolicy::publisher(),
            tenant: RestartPolicy::tenant(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

const fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Stability gate timing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateConfig {
    /// Interval between liveness observations.
    #[serde(default = "default_gate_poll", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long a service must stay alive to count as stable.
    #[serde(default = "default_stable_for", with = "humantime_serde")]
    pub stable_for: Duration,

    /// Gate wait used by queue workers before each job.
    #[serde(default = "default_worker_wait", with = "humantime_serde")]
    pub worker_wait: Duration,

    /// Pause between failed worker gate waits.
    #[serde(default = "default_worker_retry_delay", with = "humantime_serde")]
    pub worker_retry_delay: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_gate_poll(),
            stable_for: default_stable_for(),
            worker_wait: default_worker_wait(),
            worker_retry_delay: default_worker_retry_delay(),
        }
    }
}

const fn default_gate_poll() -> Duration {
    Duration::from_millis(500)
}

const fn default_stable_for() -> Duration {
    Duration::from_millis(1000)
}

const fn default_worker_wait() -> Duration {
    Duration::from_secs(10)
}

const fn default_worker_retry_delay() -> Duration {
    Duration::from_millis(500)
}

/// Parameters for a single remote call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallProfile {
    /// How long to wait for the gate before the first attempt.
    #[serde(with = "humantime_serde")]
    pub wait: Duration,

    /// Per-attempt call timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum number of attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl CallProfile {
    /// Create a profile with the default attempt count.
    #[must_use]
    pub const fn new(wait: Duration, timeout: Duration) -> Self {
        Self {
            wait,
            timeout,
            max_attempts: default_max_attempts(),
        }
    }

    /// Override the attempt count.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for CallProfile {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60))
    }
}

const fn default_max_attempts() -> u32 {
    3
}

/// Remote operation executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Profile for calls without a dedicated one.
    #[serde(default)]
    pub default: CallProfile,

    /// Profile for the open mutation.
    #[serde(default = "default_open_profile")]
    pub open: CallProfile,

    /// Profile for the submit mutation.
    #[serde(default = "default_submit_profile")]
    pub submit: CallProfile,

    /// Upper bound on the gate re-wait between attempts.
    #[serde(default = "default_retry_wait_cap", with = "humantime_serde")]
    pub retry_wait_cap: Duration,

    /// Fixed part of the pause between attempts.
    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Per-attempt increment of the pause between attempts.
    #[serde(default = "default_retry_step", with = "humantime_serde")]
    pub retry_step: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default: CallProfile::default(),
            open: default_open_profile(),
            submit: default_submit_profile(),
            retry_wait_cap: default_retry_wait_cap(),
            retry_base_delay: default_retry_base_delay(),
            retry_step: default_retry_step(),
        }
    }
}

const fn default_open_profile() -> CallProfile {
    CallProfile::new(Duration::from_secs(15), Duration::from_secs(45))
}

const fn default_submit_profile() -> CallProfile {
    CallProfile::new(Duration::from_secs(8), Duration::from_secs(30))
}

const fn default_retry_wait_cap() -> Duration {
    Duration::from_secs(5)
}

const fn default_retry_base_delay() -> Duration {
    Duration::from_millis(2000)
}

const fn default_retry_step() -> Duration {
    Duration::from_millis(300)
}

/// Two-phase queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bound of the open queue.
    #[serde(default = "default_open_capacity")]
    pub open_capacity: usize,

    /// Bound of the submit queue.
    #[serde(default = "default_submit_capacity")]
    pub submit_capacity: usize,

    /// Open worker pool size.
    #[serde(default = "default_workers")]
    pub open_workers: usize,

    /// Submit worker pool size.
    #[serde(default = "default_workers")]
    pub submit_workers: usize,

    /// Pause before each durable record during a drain.
    #[serde(default = "default_drain_step", with = "humantime_serde")]
    pub drain_step: Duration,

    /// Pause after a durable record fails during a drain.
    #[serde(default = "default_drain_error_pause", with = "humantime_serde")]
    pub drain_error_pause: Duration,

    /// Interval of the idle backlog sweep.
    #[serde(default = "default_backlog_sweep", with = "humantime_serde")]
    pub backlog_sweep: Duration,

    /// Delay before a failed durable record becomes eligible again.
    #[serde(default = "default_backlog_retry")]
    pub backlog_retry: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            open_capacity: default_open_capacity(),
            submit_capacity: default_submit_capacity(),
            open_workers: default_workers(),
            submit_workers: default_workers(),
            drain_step: default_drain_step(),
            drain_error_pause: default_drain_error_pause(),
            backlog_sweep: default_backlog_sweep(),
            backlog_retry: default_backlog_retry(),
        }
    }
}

const fn default_open_capacity() -> usize {
    200
}

const fn default_submit_capacity() -> usize {
    500
}

const fn default_workers() -> usize {
    10
}

const fn default_drain_step() -> Duration {
    Duration::from_millis(100)
}

const fn default_drain_error_pause() -> Duration {
    Duration::from_millis(500)
}

const fn default_backlog_sweep() -> Duration {
    Duration::from_secs(30)
}

const fn default_backlog_retry() -> BackoffConfig {
    BackoffConfig::Exponential {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
        max_exponent: 6,
    }
}

/// Chain operation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Host the publisher node is reached on.
    #[serde(default = "default_node_host")]
    pub node_host: String,

    /// Polls of `allOpenedChains` after an open mutation.
    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,

    /// Pause before each discovery poll.
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,

    /// Timeout of the plain (non-gated) queries.
    #[serde(default = "default_seed_timeout", with = "humantime_serde")]
    pub seed_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            node_host: default_node_host(),
            discovery_attempts: default_discovery_attempts(),
            discovery_interval: default_discovery_interval(),
            seed_timeout: default_seed_timeout(),
        }
    }
}

fn default_node_host() -> String {
    "localhost".to_string()
}

const fn default_discovery_attempts() -> u32 {
    5
}

const fn default_discovery_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_seed_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization error.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Serde adapter for human-readable durations (`"500ms"`, `"30s"`).
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = FleetConfig::from_toml("").unwrap();

        assert_eq!(config.publisher.port, 8080);
        assert_eq!(config.publisher.start_grace, Duration::from_secs(1));
        assert_eq!(config.tenants.port_base, 8082);
        assert_eq!(config.tenants.port_span, 5000);
        assert_eq!(config.queue.open_capacity, 200);
        assert_eq!(config.queue.submit_capacity, 500);
        assert_eq!(config.queue.open_workers, 10);
        assert_eq!(config.queue.submit_workers, 10);
        assert_eq!(config.gate.poll_interval, Duration::from_millis(500));
        assert_eq!(config.gate.stable_for, Duration::from_millis(1000));
        assert_eq!(config.executor.open.wait, Duration::from_secs(15));
        assert_eq!(config.executor.open.timeout, Duration::from_secs(45));
        assert_eq!(config.executor.submit.wait, Duration::from_secs(8));
        assert_eq!(config.executor.submit.timeout, Duration::from_secs(30));
        assert_eq!(config.executor.default.max_attempts, 3);
        assert_eq!(config.supervisor.tenant.max_restarts, Some(3));
        assert_eq!(config.supervisor.publisher.max_restarts, None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [daemon]
            state_dir = "/var/lib/chainfleet"
            listen = "0.0.0.0:9000"

            [publisher]
            command = "/opt/linera/bin/linera"
            args = ["service", "--port", "{port}"]
            port = 8090
            start_grace = "250ms"

            [publisher.env]
            LINERA_WALLET = "/srv/wallet.json"

            [tenants]
            command = "linera"
            args = ["--wallet", "/srv/tenants/{tenant}/wallet.json", "service", "--port", "{port}"]
            port_base = 20000
            port_span = 100

            [supervisor]
            stop_timeout = "3s"

            [supervisor.tenant]
            max_restarts = 5
            healthy_interval = "2s"
            settle_interval = "5s"

            [executor.open]
            wait = "20s"
            timeout = "1m"
            max_attempts = 4

            [queue]
            open_workers = 2
            submit_workers = 4
            drain_step = "10ms"
        "#;

        let config = FleetConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.state_dir, PathBuf::from("/var/lib/chainfleet"));
        assert_eq!(config.daemon.listen.port(), 9000);
        assert_eq!(config.publisher.port, 8090);
        assert_eq!(config.publisher.start_grace, Duration::from_millis(250));
        assert_eq!(
            config.publisher.launch.env.get("LINERA_WALLET").map(String::as_str),
            Some("/srv/wallet.json")
        );
        assert_eq!(config.tenants.port_base, 20000);
        assert_eq!(config.supervisor.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.supervisor.tenant.max_restarts, Some(5));
        assert_eq!(config.executor.open.timeout, Duration::from_secs(60));
        assert_eq!(config.executor.open.max_attempts, 4);
        // Untouched profiles keep their defaults
        assert_eq!(config.executor.submit.wait, Duration::from_secs(8));
        assert_eq!(config.queue.open_workers, 2);
        assert_eq!(config.queue.drain_step, Duration::from_millis(10));
    }

    #[test]
    fn test_reject_zero_workers() {
        let err = FleetConfig::from_toml("[queue]\nopen_workers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_reject_zero_attempts() {
        let toml = "[executor.submit]\nwait = \"1s\"\ntimeout = \"1s\"\nmax_attempts = 0\n";
        let err = FleetConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("executor.submit.max_attempts"));
    }

    #[test]
    fn test_reject_port_range_overflow() {
        let toml = "[tenants]\nport_base = 65000\nport_span = 1000\n";
        assert!(FleetConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_reject_empty_command() {
        let toml = "[publisher]\ncommand = \"  \"\n";
        assert!(FleetConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let template = LaunchTemplate {
            command: "linera".to_string(),
            args: vec![
                "--storage".to_string(),
                "rocksdb:/srv/{tenant}/db".to_string(),
                "service".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            env: HashMap::from([("TENANT".to_string(), "{tenant}".to_string())]),
            cwd: Some(PathBuf::from("/srv/{tenant}")),
        };

        let spec = template.render("tenant-alice", 8123, Some("alice"));
        assert_eq!(spec.name, "tenant-alice");
        assert_eq!(spec.command, "linera");
        assert_eq!(
            spec.args,
            vec!["--storage", "rocksdb:/srv/alice/db", "service", "--port", "8123"]
        );
        assert_eq!(spec.env.get("TENANT").map(String::as_str), Some("alice"));
        assert_eq!(spec.cwd, Some(PathBuf::from("/srv/alice")));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = FleetConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = FleetConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.publisher.port, config.publisher.port);
        assert_eq!(parsed.gate, config.gate);
    }
}
