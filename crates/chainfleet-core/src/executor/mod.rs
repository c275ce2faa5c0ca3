//! Remote operation executor.
//!
//! Issues an HTTP POST against a node once that node's readiness gate
//! reports it stable. Transient failures (503, timeouts, refused
//! connections) are retried a bounded number of times with a linearly
//! growing pause, and the gate is consulted again before each retry.
//! Everything else is surfaced unchanged.
//!
//! The request body is built by a [`ContentFactory`] on every attempt, so a
//! body is never reused across attempts.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::config::{CallProfile, ExecutorConfig};
use crate::gate::{Readiness, ReadinessGate};

/// Builds a fresh request body for each attempt.
pub trait ContentFactory: Send + Sync {
    /// Produce the request body.
    fn build(&self) -> Vec<u8>;
}

impl<F> ContentFactory for F
where
    F: Fn() -> Vec<u8> + Send + Sync,
{
    fn build(&self) -> Vec<u8> {
        self()
    }
}

/// Pacing between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTiming {
    /// Upper bound on the gate re-wait between attempts.
    pub wait_cap: Duration,
    /// Fixed part of the pause.
    pub base_delay: Duration,
    /// Added once per completed attempt.
    pub step: Duration,
}

impl RetryTiming {
    /// Timing from executor configuration.
    #[must_use]
    pub const fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            wait_cap: config.retry_wait_cap,
            base_delay: config.retry_base_delay,
            step: config.retry_step,
        }
    }

    /// Pause after `attempt` failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_add(self.step.saturating_mul(attempt))
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    /// HTTP status (always 2xx).
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl RemoteResponse {
    /// Parse the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the body is not valid JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body as lossy UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The gate did not report the node stable in time.
    #[error("service not ready after {}", humantime::format_duration(*waited))]
    ServiceNotReady {
        /// How long the gate was waited on.
        waited: Duration,
    },

    /// The node will not become ready (restart ceiling reached).
    #[error("service failed: {reason}")]
    ServiceFailed {
        /// Reason reported by the gate.
        reason: String,
    },

    /// Every attempt timed out.
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout {
        /// Attempts made.
        attempts: u32,
    },

    /// The node kept answering 503 or refusing connections.
    #[error("service unavailable after {attempts} attempt(s): {last}")]
    Unavailable {
        /// Attempts made.
        attempts: u32,
        /// Last failure seen.
        last: String,
    },

    /// Non-retryable status.
    #[error("request rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request could not be built or sent.
    #[error("request error: {0}")]
    Request(String),
}

impl ExecutorError {
    /// Whether a later call may succeed without operator action.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotReady { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }

    /// Whether this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the gate never opened.
    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self, Self::ServiceNotReady { .. } | Self::ServiceFailed { .. })
    }
}

/// Why a single attempt failed in a retryable way.
enum Transient {
    Timeout,
    Unavailable(String),
}

impl fmt::Display for Transient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Unavailable(reason) => f.write_str(reason),
        }
    }
}

impl Transient {
    fn into_error(self, attempts: u32) -> ExecutorError {
        match self {
            Self::Timeout => ExecutorError::Timeout { attempts },
            Self::Unavailable(last) => ExecutorError::Unavailable { attempts, last },
        }
    }
}

fn classify(e: &reqwest::Error) -> Option<Transient> {
    if e.is_timeout() {
        Some(Transient::Timeout)
    } else if e.is_connect() || e.is_request() || e.is_body() {
        Some(Transient::Unavailable(e.to_string()))
    } else {
        None
    }
}

/// Gate-aware HTTP executor shared by every node.
#[derive(Debug, Clone)]
pub struct RemoteOperationExecutor {
    client: Client,
    timing: RetryTiming,
}

impl RemoteOperationExecutor {
    /// Create an executor.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Request`] if the HTTP client cannot be built.
    pub fn new(timing: RetryTiming) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ExecutorError::Request(e.to_string()))?;
        Ok(Self { client, timing })
    }

    /// Underlying HTTP client, for plain calls that skip the gate.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Wait for `gate`, then POST to `url` with up to
    /// `profile.max_attempts` attempts.
    ///
    /// # Errors
    ///
    /// - [`ExecutorError::ServiceNotReady`] / [`ExecutorError::ServiceFailed`]
    ///   if the gate does not open before the first attempt
    /// - [`ExecutorError::Timeout`] / [`ExecutorError::Unavailable`] once
    ///   attempts are exhausted
    /// - [`ExecutorError::Rejected`] on any other non-2xx status
    pub async fn execute(
        &self,
        gate: &dyn ReadinessGate,
        url: &str,
        content: &dyn ContentFactory,
        profile: CallProfile,
    ) -> Result<RemoteResponse, ExecutorError> {
        match gate.wait_ready(profile.wait).await {
            Readiness::Ready => {},
            Readiness::NotReadyYet => {
                return Err(ExecutorError::ServiceNotReady {
                    waited: profile.wait,
                });
            },
            Readiness::Failed(reason) => return Err(ExecutorError::ServiceFailed { reason }),
        }

        let max_attempts = profile.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let failure = match self.attempt(url, content, profile.timeout).await? {
                Ok(response) => {
                    debug!(url, attempt, status = response.status, "Remote call succeeded");
                    return Ok(response);
                },
                Err(failure) => failure,
            };

            if attempt >= max_attempts {
                warn!(url, attempt, reason = %failure, "Remote call failed, attempts exhausted");
                return Err(failure.into_error(attempt));
            }

            warn!(url, attempt, reason = %failure, "Transient remote failure, retrying");

            // Re-check stability; a node that is merely restarting is fine.
            let rewait = profile.wait.min(self.timing.wait_cap);
            if let Readiness::Failed(reason) = gate.wait_ready(rewait).await {
                return Err(ExecutorError::ServiceFailed { reason });
            }

            let delay = self.timing.delay_after(attempt);
            info!(
                url,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Backing off before next attempt"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One attempt. The outer `Result` carries permanent failures, the inner
    /// one retryable failures.
    async fn attempt(
        &self,
        url: &str,
        content: &dyn ContentFactory,
        timeout: Duration,
    ) -> Result<Result<RemoteResponse, Transient>, ExecutorError> {
        let sent = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(content.build())
            .timeout(timeout)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                return classify(&e)
                    .map(Err)
                    .ok_or_else(|| ExecutorError::Request(e.to_string()));
            },
        };

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(Err(Transient::Unavailable("503 Service Unavailable".to_string())));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return classify(&e)
                    .map(Err)
                    .ok_or_else(|| ExecutorError::Request(e.to_string()));
            },
        };

        if status.is_success() {
            Ok(Ok(RemoteResponse {
                status: status.as_u16(),
                body: body.to_vec(),
            }))
        } else {
            Err(ExecutorError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

/// Retry a fallible async operation up to `attempts` times, sleeping
/// `base * i` after the i-th failure. The closure receives the attempt
/// number, starting at 1.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted.
pub async fn retry_async<T, E, F, Fut>(attempts: u32, base: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Operation failed, retrying");
                tokio::time::sleep(base.saturating_mul(attempt)).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;

    use super::*;

    struct FixedGate(Readiness);

    #[async_trait]
    impl ReadinessGate for FixedGate {
        async fn wait_ready(&self, _timeout: Duration) -> Readiness {
            self.0.clone()
        }
    }

    fn fast() -> RetryTiming {
        RetryTiming {
            wait_cap: Duration::from_millis(10),
            base_delay: Duration::from_millis(5),
            step: Duration::from_millis(1),
        }
    }

    fn profile(attempts: u32) -> CallProfile {
        CallProfile::new(Duration::from_secs(1), Duration::from_secs(5)).with_max_attempts(attempts)
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/graphql")
    }

    /// Answers 503 for the first `failures` calls, then echoes the body.
    async fn flaky_server(failures: u32) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/graphql",
                post(
                    move |State(calls): State<Arc<AtomicU32>>, body: String| async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures {
                            (AxumStatus::SERVICE_UNAVAILABLE, String::new())
                        } else {
                            (AxumStatus::OK, body)
                        }
                    },
                ),
            )
            .with_state(Arc::clone(&calls));
        (serve(app).await, calls)
    }

    #[tokio::test]
    async fn test_retries_503_then_succeeds() {
        let (url, calls) = flaky_server(2).await;
        let executor = RemoteOperationExecutor::new(fast()).unwrap();

        let built = AtomicU32::new(0);
        let factory = || {
            built.fetch_add(1, Ordering::SeqCst);
            br#"{"query":"mutation { openAndCreate }"}"#.to_vec()
        };

        let response = executor
            .execute(&FixedGate(Readiness::Ready), &url, &factory, profile(3))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.json().unwrap()["query"], "mutation { openAndCreate }");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // A fresh body per attempt
        assert_eq!(built.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_503_exhausts_attempts() {
        let (url, calls) = flaky_server(u32::MAX).await;
        let executor = RemoteOperationExecutor::new(fast()).unwrap();

        let err = executor
            .execute(&FixedGate(Readiness::Ready), &url, &|| b"{}".to_vec(), profile(3))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Unavailable { attempts: 3, .. }));
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/graphql",
                post(|State(calls): State<Arc<AtomicU32>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (AxumStatus::BAD_REQUEST, "bad query")
                }),
            )
            .with_state(Arc::clone(&calls));
        let url = serve(app).await;
        let executor = RemoteOperationExecutor::new(fast()).unwrap();

        let err = executor
            .execute(&FixedGate(Readiness::Ready), &url, &|| b"{}".to_vec(), profile(3))
            .await
            .unwrap_err();

        match err {
            ExecutorError::Rejected { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad query");
            },
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_surfaced() {
        let app = Router::new().route(
            "/graphql",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let url = serve(app).await;
        let executor = RemoteOperationExecutor::new(fast()).unwrap();
        let profile = CallProfile::new(Duration::from_secs(1), Duration::from_millis(100))
            .with_max_attempts(2);

        let err = executor
            .execute(&FixedGate(Readiness::Ready), &url, &|| b"{}".to_vec(), profile)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Timeout { attempts: 2 }));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let executor = RemoteOperationExecutor::new(fast()).unwrap();

        let err = executor
            .execute(
                &FixedGate(Readiness::Ready),
                &format!("http://{addr}/graphql"),
                &|| b"{}".to_vec(),
                profile(2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Unavailable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_gate_not_ready_skips_call() {
        let (url, calls) = flaky_server(0).await;
        let executor = RemoteOperationExecutor::new(fast()).unwrap();

        let err = executor
            .execute(&FixedGate(Readiness::NotReadyYet), &url, &|| b"{}".to_vec(), profile(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ServiceNotReady { .. }));

        let err = executor
            .execute(
                &FixedGate(Readiness::Failed("gave up".to_string())),
                &url,
                &|| b"{}".to_vec(),
                profile(3),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ServiceFailed { .. }));
        assert!(err.is_not_ready());

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delay_grows_linearly() {
        let timing = RetryTiming {
            wait_cap: Duration::from_secs(5),
            base_delay: Duration::from_millis(2000),
            step: Duration::from_millis(300),
        };
        assert_eq!(timing.delay_after(1), Duration::from_millis(2300));
        assert_eq!(timing.delay_after(2), Duration::from_millis(2600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_linear_delay() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result: Result<u32, String> = retry_async(3, Duration::from_secs(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_returns_last_error() {
        let result: Result<(), String> =
            retry_async(2, Duration::from_millis(10), |attempt| async move {
                Err(format!("failure {attempt}"))
            })
            .await;
        assert_eq!(result, Err("failure 2".to_string()));
    }
}
