//! Per-process watchdog.
//!
//! A [`Supervisor`] owns exactly one node process. It launches the process on
//! demand, watches it from a background monitor task, and relaunches it with
//! backoff when it dies. The publisher node uses an unlimited restart policy;
//! tenant nodes stop trying after a ceiling of consecutive failures.
//!
//! # Locking
//!
//! `start`, `stop` and the monitor's relaunch all run under one single-slot
//! lifecycle lock, so at most one of them touches the recorded pid at a
//! time. `stop` takes the lock first and then cancels the monitor and waits
//! for it, so a concurrent `start` is ordered entirely before or after it.
//! The monitor gives up waiting for the lock once cancelled, and re-checks
//! its token after acquiring it, so a deliberate stop is never followed by a
//! relaunch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GateConfig;
use crate::gate::{GateTiming, Readiness, ReadinessGate, StabilityGate};
use crate::probe::{HealthProbe, Observation, TcpProbe};
use crate::process::{
    ManagedProcess, ProcessError, ProcessId, ProcessLauncher, ProcessSpec, ProcessState,
};
use crate::restart::{RestartDecision, RestartPolicy, RestartTracker};

/// Supervisor tuning that is not part of the restart policy.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Delay before every launch.
    pub start_grace: Duration,
    /// Bound on waiting for the monitor, and on SIGTERM before SIGKILL.
    pub stop_timeout: Duration,
    /// When set, liveness also requires a TCP connect to the listen port.
    pub port_probe_timeout: Option<Duration>,
    /// Gate timing.
    pub gate: GateConfig,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            start_grace: Duration::ZERO,
            stop_timeout: Duration::from_secs(5),
            port_probe_timeout: None,
            gate: GateConfig::default(),
        }
    }
}

struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

enum RestartOutcome {
    Started(u32),
    Failed(ProcessError),
    Cancelled,
}

/// Watchdog for one node process.
pub struct Supervisor {
    id: ProcessId,
    spec: ProcessSpec,
    port: u16,
    launcher: Arc<dyn ProcessLauncher>,
    policy: RestartPolicy,
    options: SupervisorOptions,
    lifecycle: tokio::sync::Mutex<()>,
    managed: Mutex<ManagedProcess>,
    monitor: Mutex<Option<MonitorHandle>>,
    gate: StabilityGate,
    restarts: AtomicU64,
}

impl Supervisor {
    /// Create a supervisor. Nothing is launched until [`Self::start`].
    #[must_use]
    pub fn new(
        id: ProcessId,
        spec: ProcessSpec,
        port: u16,
        launcher: Arc<dyn ProcessLauncher>,
        policy: RestartPolicy,
        options: SupervisorOptions,
    ) -> Self {
        let managed = ManagedProcess {
            id: id.clone(),
            pid: None,
            listen_port: port,
            executable_args: spec.args.clone(),
            last_observed_alive: false,
            last_state_change_at: Utc::now(),
            state: ProcessState::Stopped,
        };

        Self {
            id,
            spec,
            port,
            launcher,
            policy,
            options,
            lifecycle: tokio::sync::Mutex::new(()),
            managed: Mutex::new(managed),
            monitor: Mutex::new(None),
            gate: StabilityGate::new(),
            restarts: AtomicU64::new(0),
        }
    }

    /// Node identity.
    #[must_use]
    pub const fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Listen port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Recorded pid.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.managed().pid
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.managed().state
    }

    /// Copy of the managed process record.
    #[must_use]
    pub fn snapshot(&self) -> ManagedProcess {
        self.managed().clone()
    }

    /// Relaunches performed by the monitor.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// The stability gate of this node.
    #[must_use]
    pub const fn gate(&self) -> &StabilityGate {
        &self.gate
    }

    /// Whether the monitor task is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor_slot()
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Whether the node is alive right now.
    pub async fn is_alive(&self) -> bool {
        self.observe().await.alive
    }

    /// Wait until the node has been stable for the configured duration.
    pub async fn wait_until_stable(&self, timeout: Duration) -> bool {
        self.wait_ready(timeout).await.is_ready()
    }

    /// Start the node if it is not already running, and make sure the
    /// monitor is watching it.
    ///
    /// Idempotent: when the recorded pid is alive it is returned unchanged.
    /// Returns once the OS launch succeeds; readiness is established
    /// separately through the gate.
    ///
    /// # Errors
    ///
    /// Returns the launcher error if the process cannot be started.
    pub async fn start(self: &Arc<Self>) -> Result<u32, ProcessError> {
        let _guard = self.lifecycle.lock().await;

        if let Some(pid) = self.pid() {
            if self.launcher.is_alive(pid) {
                debug!(process = %self.id, pid, "Already running");
                self.ensure_monitor();
                return Ok(pid);
            }
        }

        match self.launch_locked().await {
            Ok(pid) => {
                self.ensure_monitor();
                Ok(pid)
            },
            Err(e) => {
                self.set_state(ProcessState::Stopped);
                Err(e)
            },
        }
    }

    /// Stop the node: take the lifecycle lock, cancel the monitor and wait
    /// for it, then terminate the process. The recorded pid is always cleared.
    ///
    /// Returns the pid that was stopped, if there was one.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be signalled.
    pub async fn stop(&self) -> Result<Option<u32>, ProcessError> {
        // Under the lifecycle lock so a concurrent `start` cannot attach a
        // fresh monitor to the process about to be killed.
        let _guard = self.lifecycle.lock().await;
        self.cancel_monitor().await;

        let pid = self.take_pid();
        self.set_state(ProcessState::Stopped);
        self.gate.reset();

        if let Some(pid) = pid {
            info!(process = %self.id, pid, "Stopping process");
            self.launcher.kill(pid, self.options.stop_timeout).await?;
        }
        Ok(pid)
    }

    /// Spawn the monitor task unless one is already running.
    pub fn ensure_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor_slot();
        if slot.as_ref().is_some_and(|handle| !handle.task.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run_monitor(token.clone()));
        *slot = Some(MonitorHandle { token, task });
    }

    async fn cancel_monitor(&self) {
        let Some(handle) = self.monitor_slot().take() else {
            return;
        };

        handle.token.cancel();
        let mut task = handle.task;
        if tokio::time::timeout(self.options.stop_timeout, &mut task)
            .await
            .is_err()
        {
            warn!(process = %self.id, "Monitor did not exit in time, aborting it");
            task.abort();
        }
    }

    /// Launch a fresh process. Caller holds the lifecycle lock.
    async fn launch_locked(&self) -> Result<u32, ProcessError> {
        self.set_state(ProcessState::Starting);

        if let Some(old) = self.take_pid() {
            if self.launcher.is_alive(old) {
                warn!(process = %self.id, pid = old, "Replacing unresponsive process");
                self.launcher.kill(old, self.options.stop_timeout).await?;
            }
        }

        if !self.options.start_grace.is_zero() {
            tokio::time::sleep(self.options.start_grace).await;
        }

        let pid = self.launcher.launch(&self.spec).await?;
        if !self.launcher.is_alive(pid) {
            return Err(ProcessError::ExitedEarly { pid });
        }

        {
            let mut managed = self.managed();
            managed.pid = Some(pid);
            managed.executable_args.clone_from(&self.spec.args);
        }
        self.gate.reset();
        self.set_state(ProcessState::Running);
        info!(process = %self.id, pid, port = self.port, "Process started");
        Ok(pid)
    }

    /// Monitor loop. A relaunch only counts as successful once the new
    /// process is observed alive; one that dies first counts as a failed
    /// restart towards the ceiling.
    async fn run_monitor(self: Arc<Self>, token: CancellationToken) {
        let mut tracker = RestartTracker::new(self.policy.clone());
        let timing = GateTiming::from_config(&self.options.gate, Duration::ZERO);
        let mut unconfirmed = false;
        info!(process = %self.id, "Monitor started");

        loop {
            let observation = tokio::select! {
                biased;
                () = token.cancelled() => break,
                observation = self.confirm_alive() => observation,
            };
            self.gate.record(observation, &timing);
            self.mark_observed(observation.alive);

            if observation.alive {
                if std::mem::take(&mut unconfirmed) {
                    tracker.record_success();
                } else {
                    tracker.record_healthy();
                }
                if self.state() == ProcessState::Unhealthy {
                    self.set_state(ProcessState::Running);
                }
                if !sleep_or_cancel(&token, self.policy.healthy_interval).await {
                    break;
                }
                continue;
            }

            self.set_state(ProcessState::Unhealthy);
            if std::mem::take(&mut unconfirmed)
                && !self
                    .back_off(&mut tracker, &token, "restarted process died before it was observed alive")
                    .await
            {
                break;
            }
            warn!(process = %self.id, pid = ?self.pid(), "Process not alive, restarting");

            match self.restart(&token).await {
                RestartOutcome::Cancelled => break,
                RestartOutcome::Started(pid) => {
                    unconfirmed = true;
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    info!(process = %self.id, pid, "Process restarted");
                    if !sleep_or_cancel(&token, self.policy.settle_interval).await {
                        break;
                    }
                },
                RestartOutcome::Failed(e) => {
                    if !self.back_off(&mut tracker, &token, &e.to_string()).await {
                        break;
                    }
                },
            }
        }

        info!(process = %self.id, "Monitor stopped");
    }

    /// Record a failed restart and sleep the backoff. Returns `false` when
    /// the monitor must exit (ceiling reached or cancelled).
    async fn back_off(
        &self,
        tracker: &mut RestartTracker,
        token: &CancellationToken,
        reason: &str,
    ) -> bool {
        match tracker.record_failure() {
            RestartDecision::RetryAfter(delay) => {
                warn!(
                    process = %self.id,
                    error = reason,
                    failures = tracker.consecutive_failures(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Restart failed, backing off"
                );
                sleep_or_cancel(token, delay).await
            },
            RestartDecision::GiveUp => {
                error!(
                    process = %self.id,
                    error = reason,
                    failures = tracker.consecutive_failures(),
                    restarts = tracker.total_restarts(),
                    "Restart ceiling reached, monitor giving up"
                );
                self.set_state(ProcessState::GaveUp);
                false
            },
        }
    }

    async fn restart(&self, token: &CancellationToken) -> RestartOutcome {
        // `stop` holds the lock while it waits for this task to exit.
        let _guard = tokio::select! {
            biased;
            () = token.cancelled() => return RestartOutcome::Cancelled,
            guard = self.lifecycle.lock() => guard,
        };
        if token.is_cancelled() {
            return RestartOutcome::Cancelled;
        }

        self.set_state(ProcessState::Restarting);
        match self.launch_locked().await {
            Ok(pid) => RestartOutcome::Started(pid),
            Err(e) => {
                self.set_state(ProcessState::Unhealthy);
                RestartOutcome::Failed(e)
            },
        }
    }

    /// Observe up to `liveness_checks` times; dead only if every check fails.
    async fn confirm_alive(&self) -> Observation {
        let checks = self.policy.liveness_checks.max(1);
        for attempt in 1..=checks {
            let observation = self.observe().await;
            if observation.alive {
                return observation;
            }
            if attempt < checks {
                tokio::time::sleep(self.policy.liveness_interval).await;
            }
        }
        Observation::dead()
    }

    fn managed(&self) -> MutexGuard<'_, ManagedProcess> {
        self.managed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn monitor_slot(&self) -> MutexGuard<'_, Option<MonitorHandle>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pid(&self) -> Option<u32> {
        self.managed().pid.take()
    }

    fn set_state(&self, state: ProcessState) {
        let mut managed = self.managed();
        if managed.state != state {
            debug!(process = %self.id, from = %managed.state, to = %state, "State change");
            managed.state = state;
            managed.last_state_change_at = Utc::now();
        }
    }

    fn mark_observed(&self, alive: bool) {
        self.managed().last_observed_alive = alive;
    }
}

#[async_trait]
impl HealthProbe for Supervisor {
    async fn observe(&self) -> Observation {
        let Some(pid) = self.pid() else {
            return Observation::dead();
        };
        if !self.launcher.is_alive(pid) {
            return Observation::dead();
        }
        if let Some(timeout) = self.options.port_probe_timeout {
            if !TcpProbe::localhost(self.port, timeout).observe().await.alive {
                return Observation::dead();
            }
        }
        Observation::alive(Some(pid))
    }

    fn failure(&self) -> Option<String> {
        (self.state() == ProcessState::GaveUp)
            .then(|| format!("{} exceeded its restart ceiling", self.id))
    }
}

#[async_trait]
impl ReadinessGate for Supervisor {
    async fn wait_ready(&self, timeout: Duration) -> Readiness {
        let timing = GateTiming::from_config(&self.options.gate, timeout);
        self.gate.wait(self, timing).await
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor_slot().take() {
            handle.token.cancel();
        }
    }
}
