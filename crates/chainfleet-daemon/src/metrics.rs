//! Prometheus metrics for the daemon.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `chainfleet_open_pending` | Gauge | Opens accepted but not finished | |
//! | `chainfleet_queue_jobs_total` | Counter | Finished queue jobs | `queue`, `outcome` |
//! | `chainfleet_durable_backlog` | Gauge | Records in the durable submit store | |
//! | `chainfleet_process_restarts` | Gauge | Monitor restarts per node | `process` |
//! | `chainfleet_http_requests_total` | Counter | Operator HTTP requests | `endpoint`, `status` |
//! | `chainfleet_operation_latency_seconds` | Histogram | Chain operation latency | `operation` |
//!
//! Restart counts live in the supervisors; the gauge is refreshed from them
//! on every scrape.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Buckets for chain operation latency (in seconds). Opens include chain
/// discovery and routinely take several seconds.
pub const OPERATION_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Daemon metrics.
///
/// Cheap to clone; every clone updates the same underlying families.
#[derive(Clone)]
pub struct DaemonMetrics {
    open_pending: Gauge,
    queue_jobs_total: CounterVec,
    durable_backlog: Gauge,
    process_restarts: GaugeVec,
    http_requests_total: CounterVec,
    operation_latency: HistogramVec,
}

impl DaemonMetrics {
    /// Creates daemon metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let open_pending = Gauge::with_opts(Opts::new(
            "chainfleet_open_pending",
            "Open jobs accepted but not yet finished",
        ))?;
        registry.register(Box::new(open_pending.clone()))?;

        let queue_jobs_total = CounterVec::new(
            Opts::new("chainfleet_queue_jobs_total", "Finished queue jobs by outcome"),
            &["queue", "outcome"],
        )?;
        registry.register(Box::new(queue_jobs_total.clone()))?;

        let durable_backlog = Gauge::with_opts(Opts::new(
            "chainfleet_durable_backlog",
            "Records waiting in the durable submit store",
        ))?;
        registry.register(Box::new(durable_backlog.clone()))?;

        let process_restarts = GaugeVec::new(
            Opts::new(
                "chainfleet_process_restarts",
                "Restarts performed by the node monitor",
            ),
            &["process"],
        )?;
        registry.register(Box::new(process_restarts.clone()))?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                "chainfleet_http_requests_total",
                "Operator HTTP requests by endpoint and status",
            ),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let operation_latency = HistogramVec::new(
            HistogramOpts::new(
                "chainfleet_operation_latency_seconds",
                "Latency of chain operations run by the queue workers",
            )
            .buckets(OPERATION_LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(operation_latency.clone()))?;

        Ok(Self {
            open_pending,
            queue_jobs_total,
            durable_backlog,
            process_restarts,
            http_requests_total,
            operation_latency,
        })
    }

    // ========================================================================
    // Queue Metrics
    // ========================================================================

    /// Sets the pending open gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_open_pending(&self, pending: usize) {
        self.open_pending.set(pending as f64);
    }

    /// Current pending open gauge value.
    #[must_use]
    pub fn open_pending(&self) -> f64 {
        self.open_pending.get()
    }

    /// Records a finished queue job.
    ///
    /// * `queue` - `open`, `submit` or `backlog`
    /// * `outcome` - e.g. `success`, `error`, `queued`
    pub fn job_finished(&self, queue: &str, outcome: &str) {
        self.queue_jobs_total
            .with_label_values(&[truncate_label(queue), truncate_label(outcome)])
            .inc();
    }

    /// Finished job count, for tests.
    #[must_use]
    pub fn job_count(&self, queue: &str, outcome: &str) -> f64 {
        self.queue_jobs_total
            .with_label_values(&[truncate_label(queue), truncate_label(outcome)])
            .get()
    }

    /// Sets the durable backlog gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_durable_backlog(&self, records: usize) {
        self.durable_backlog.set(records as f64);
    }

    /// Current durable backlog gauge value.
    #[must_use]
    pub fn durable_backlog(&self) -> f64 {
        self.durable_backlog.get()
    }

    /// Records the latency of a chain operation.
    pub fn record_operation_latency(&self, operation: &str, latency_secs: f64) {
        self.operation_latency
            .with_label_values(&[truncate_label(operation)])
            .observe(latency_secs);
    }

    // ========================================================================
    // Process Metrics
    // ========================================================================

    /// Sets the restart gauge of one node.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_process_restarts(&self, process: &str, restarts: u64) {
        self.process_restarts
            .with_label_values(&[truncate_label(process)])
            .set(restarts as f64);
    }

    // ========================================================================
    // HTTP Metrics
    // ========================================================================

    /// Records an operator HTTP request.
    pub fn http_request_completed(&self, endpoint: &str, status: &str) {
        self.http_requests_total
            .with_label_values(&[truncate_label(endpoint), truncate_label(status)])
            .inc();
    }

    /// HTTP request count, for tests.
    #[must_use]
    pub fn http_request_count(&self, endpoint: &str, status: &str) -> f64 {
        self.http_requests_total
            .with_label_values(&[truncate_label(endpoint), truncate_label(status)])
            .get()
    }
}

/// Prometheus registry with the daemon metrics registered.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    daemon_metrics: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let daemon_metrics = DaemonMetrics::new(&registry)?;
        Ok(Self {
            registry,
            daemon_metrics,
        })
    }

    /// The daemon metrics.
    #[must_use]
    pub const fn daemon_metrics(&self) -> &DaemonMetrics {
        &self.daemon_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncates a label value to [`MAX_LABEL_VALUE_LEN`] bytes on a character
/// boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
