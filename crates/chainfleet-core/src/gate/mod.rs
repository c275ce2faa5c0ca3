//! Stability gate.
//!
//! Turns a noisy alive/dead signal into a debounced one: a service is ready
//! only once it has been observed continuously alive, as the same instance,
//! for a minimum duration. A single successful liveness check is not enough
//! because a node that is mid-restart flaps between alive and dead.
//!
//! Readiness is reported as a tagged [`Readiness`] so callers can tell "retry
//! later" apart from "this will never become ready". The latest stable/unstable
//! verdict is also published on a watch channel for callers that want to
//! await the transition instead of polling.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::GateConfig;
use crate::probe::{HealthProbe, Observation};

/// Outcome of waiting on a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Continuously alive for the required duration.
    Ready,
    /// Did not stabilize within the timeout; may still become ready.
    NotReadyYet,
    /// Will not become ready without operator action.
    Failed(String),
}

impl Readiness {
    /// Whether this is [`Readiness::Ready`].
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Something that can be waited on until a service is ready.
///
/// Implemented by supervisors (their own gate) and by the registry (the
/// publisher's gate, whichever supervisor currently owns it).
#[async_trait]
pub trait ReadinessGate: Send + Sync {
    /// Wait up to `timeout` for the service to be stable.
    async fn wait_ready(&self, timeout: Duration) -> Readiness;
}

/// Timing for one gate wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTiming {
    /// Give up after this long.
    pub timeout: Duration,
    /// Interval between observations.
    pub poll_interval: Duration,
    /// Required length of the alive streak.
    pub stable_for: Duration,
}

impl GateTiming {
    /// Timing from configuration with an explicit timeout.
    #[must_use]
    pub const fn from_config(config: &GateConfig, timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: config.poll_interval,
            stable_for: config.stable_for,
        }
    }

    /// Gap between observations beyond which a streak is not trusted.
    fn continuity(&self) -> Duration {
        self.stable_for.max(self.poll_interval.saturating_mul(2))
    }
}

/// The current alive streak.
#[derive(Debug, Default, Clone, Copy)]
struct StabilityRecord {
    last_pid: Option<u32>,
    alive_since: Option<Instant>,
    last_seen: Option<Instant>,
}

impl StabilityRecord {
    /// Fold one observation in and return the streak start, if alive.
    fn apply(&mut self, observation: Observation, now: Instant, continuity: Duration) -> Option<Instant> {
        if !observation.alive {
            *self = Self::default();
            return None;
        }

        let continuous = self.alive_since.is_some()
            && self.last_pid == observation.identity
            && self
                .last_seen
                .is_some_and(|seen| now.saturating_duration_since(seen) <= continuity);

        if !continuous {
            self.alive_since = Some(now);
            self.last_pid = observation.identity;
        }
        self.last_seen = Some(now);
        self.alive_since
    }
}

/// Debounced readiness for one service.
pub struct StabilityGate {
    record: Mutex<StabilityRecord>,
    stable_tx: watch::Sender<bool>,
}

impl Default for StabilityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StabilityGate {
    /// Create a gate with no streak.
    #[must_use]
    pub fn new() -> Self {
        let (stable_tx, _) = watch::channel(false);
        Self {
            record: Mutex::new(StabilityRecord::default()),
            stable_tx,
        }
    }

    /// Fold one observation into the streak and return whether the service
    /// is now stable.
    pub fn record(&self, observation: Observation, timing: &GateTiming) -> bool {
        let now = Instant::now();
        let since = self
            .record
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .apply(observation, now, timing.continuity());

        let stable = since.is_some_and(|start| now.saturating_duration_since(start) >= timing.stable_for);
        self.publish(stable);
        stable
    }

    /// Forget the current streak.
    pub fn reset(&self) {
        *self
            .record
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = StabilityRecord::default();
        self.publish(false);
    }

    /// Subscribe to stable/unstable transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stable_tx.subscribe()
    }

    /// Poll `probe` until it has been continuously alive for
    /// `timing.stable_for`, or `timing.timeout` elapses.
    pub async fn wait_until_stable(&self, probe: &dyn HealthProbe, timing: GateTiming) -> bool {
        self.wait(probe, timing).await.is_ready()
    }

    /// Like [`Self::wait_until_stable`] but reports why it did not succeed.
    pub async fn wait(&self, probe: &dyn HealthProbe, timing: GateTiming) -> Readiness {
        let deadline = Instant::now() + timing.timeout;

        loop {
            if let Some(reason) = probe.failure() {
                return Readiness::Failed(reason);
            }

            let observation = probe.observe().await;
            if self.record(observation, &timing) {
                debug!(identity = ?observation.identity, "Service stable");
                return Readiness::Ready;
            }
            trace!(alive = observation.alive, identity = ?observation.identity, "Service not yet stable");

            let now = Instant::now();
            if now >= deadline {
                return Readiness::NotReadyYet;
            }
            tokio::time::sleep(timing.poll_interval.min(deadline - now)).await;
        }
    }

    fn publish(&self, stable: bool) {
        self.stable_tx.send_if_modified(|current| {
            if *current == stable {
                false
            } else {
                *current = stable;
                true
            }
        });
    }
}
