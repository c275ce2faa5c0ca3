//! Restart policy module.
//!
//! Defines restart behavior for supervised nodes: the backoff applied after a
//! failed restart, the pacing of the monitor loop, and the optional restart
//! ceiling that distinguishes tenant nodes from the publisher node.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;

/// Restart policy for one supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive failed restarts after which the monitor gives up.
    /// `None` retries forever.
    #[serde(default)]
    pub max_restarts: Option<u32>,

    /// Sleep between checks while the process is healthy.
    #[serde(default = "default_healthy_interval", with = "humantime_serde")]
    pub healthy_interval: Duration,

    /// Sleep after a successful restart before checking again.
    #[serde(default = "default_settle_interval", with = "humantime_serde")]
    pub settle_interval: Duration,

    /// Liveness checks that must all fail before the process counts as dead.
    #[serde(default = "default_liveness_checks")]
    pub liveness_checks: u32,

    /// Pause between liveness checks.
    #[serde(default = "default_liveness_interval", with = "humantime_serde")]
    pub liveness_interval: Duration,

    /// Backoff after a failed restart.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_healthy_interval() -> Duration {
    Duration::from_secs(3)
}

const fn default_settle_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_liveness_checks() -> u32 {
    1
}

const fn default_liveness_interval() -> Duration {
    Duration::from_secs(1)
}

impl RestartPolicy {
    /// Policy for the shared publisher node: unlimited restarts with
    /// exponential backoff capped at 30s.
    #[must_use]
    pub fn publisher() -> Self {
        Self {
            max_restarts: None,
            healthy_interval: default_healthy_interval(),
            settle_interval: default_settle_interval(),
            liveness_checks: default_liveness_checks(),
            liveness_interval: default_liveness_interval(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Policy for tenant nodes: three consecutive failed restarts end the
    /// monitor.
    #[must_use]
    pub fn tenant() -> Self {
        Self {
            max_restarts: Some(3),
            healthy_interval: Duration::from_secs(2),
            settle_interval: Duration::from_secs(5),
            liveness_checks: 3,
            liveness_interval: Duration::from_secs(1),
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_secs(5),
            },
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::publisher()
    }
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between restarts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff: `min(max_delay, initial_delay * multiplier^min(k, max_exponent))`.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,

        /// Largest exponent applied.
        #[serde(default = "default_max_exponent")]
        max_exponent: u32,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_exponent() -> u32 {
    6
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: default_multiplier(),
            max_exponent: default_max_exponent(),
        }
    }
}

impl BackoffConfig {
    /// Delay to apply after `failures` consecutive failures.
    ///
    /// `failures == 0` yields the base delay.
    #[must_use]
    pub fn delay_after_failures(&self, failures: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
                max_exponent,
            } => {
                #[allow(clippy::cast_possible_wrap)] // bounded by max_exponent
                let exponent = failures.min(*max_exponent).min(i32::MAX as u32) as i32;
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(delay_secs)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => initial_delay
                .saturating_add(increment.saturating_mul(failures))
                .min(*max_delay),
        }
    }
}

/// Tracks consecutive restart failures for one monitor loop.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    consecutive_failures: u32,
    total_restarts: u64,
}

/// What the monitor should do after a failed restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Sleep for the delay, then try again.
    RetryAfter(Duration),
    /// The ceiling was reached.
    GiveUp,
}

impl RestartTracker {
    /// Create a tracker for the given policy.
    #[must_use]
    pub const fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            total_restarts: 0,
        }
    }

    /// Record a successful (re)start.
    pub const fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_restarts += 1;
    }

    /// Record a healthy observation.
    pub const fn record_healthy(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failed restart and decide what happens next.
    pub fn record_failure(&mut self) -> RestartDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if let Some(max) = self.policy.max_restarts {
            if self.consecutive_failures >= max {
                return RestartDecision::GiveUp;
            }
        }
        RestartDecision::RetryAfter(
            self.policy
                .backoff
                .delay_after_failures(self.consecutive_failures),
        )
    }

    /// Consecutive failures since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Successful restarts performed by this tracker.
    #[must_use]
    pub const fn total_restarts(&self) -> u64 {
        self.total_restarts
    }
}
