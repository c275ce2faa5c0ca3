//! Two-phase queue.
//!
//! Opens and submits run on two bounded queues with fixed worker pools. A
//! submit must never overtake the opens that were in flight when it was
//! accepted, so:
//!
//! - every open increments a pending counter before it is queued, and the
//!   worker decrements it once the open has finished (successfully or not);
//! - a submit accepted while opens are pending is persisted to the
//!   [`DurableSubmitStore`] and acknowledged as queued;
//! - a live submit re-checks the counter immediately before it executes and
//!   is persisted instead if an open slipped in;
//! - when the counter returns to zero the idle signal fires and a wake marker
//!   is pushed onto the submit queue. Submit workers drain the whole durable
//!   backlog (oldest first) on every wake and before every live submit.
//!
//! Workers wait for the publisher gate before taking a job. Shutdown lets
//! in-flight jobs finish; live submits still sitting in the channel are
//! persisted and opens still sitting there are dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chainfleet_core::config::{GateConfig, QueueConfig};
use chainfleet_core::gate::{Readiness, ReadinessGate};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain::{ChainOperations, OpenedChain, OperationError, SubmitReceipt};
use crate::metrics::DaemonMetrics;
use crate::store::{DurableSubmitStore, StoreError, SubmitJob};

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is shutting down.
    #[error("queue is closed")]
    Closed,

    /// The job was dropped before it ran.
    #[error("job was canceled before it ran")]
    Canceled,

    /// The chain operation failed.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// Persisting a deferred submit failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a submit was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Executed against the chain.
    Executed(SubmitReceipt),
    /// Persisted; it runs once no open is pending.
    Queued {
        /// Durable record id.
        job_id: Uuid,
        /// Human-readable reason.
        message: String,
    },
}

type OpenReply = oneshot::Sender<Result<OpenedChain, QueueError>>;
type SubmitReply = oneshot::Sender<Result<SubmitOutcome, QueueError>>;
type SharedReceiver<T> = Arc<AsyncMutex<mpsc::Receiver<T>>>;

struct OpenJob {
    pending: PendingGuard,
    match_type: Option<String>,
    reply: OpenReply,
}

struct LiveSubmit {
    job: SubmitJob,
    reply: SubmitReply,
}

enum SubmitWork {
    Live(LiveSubmit),
    /// Drain the durable backlog.
    Wake,
}

/// Holds one unit of the pending open count.
struct PendingGuard {
    inner: Arc<Inner>,
}

impl PendingGuard {
    fn new(inner: &Arc<Inner>) -> Self {
        inner.pending.fetch_add(1, Ordering::SeqCst);
        inner.publish_pending();
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let previous = self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.inner.idle_epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.publish_pending();
            debug!("No opens pending, waking submit queue");
            self.inner.wake();
        } else {
            self.inner.publish_pending();
        }
    }
}

struct Inner {
    ops: Arc<dyn ChainOperations>,
    gate: Arc<dyn ReadinessGate>,
    store: Arc<DurableSubmitStore>,
    config: QueueConfig,
    gate_config: GateConfig,
    pending: AtomicUsize,
    /// Times the pending count returned to zero.
    idle_epoch: AtomicU64,
    /// `true` while no open is pending.
    idle_tx: watch::Sender<bool>,
    /// One drain at a time.
    drain_lock: AsyncMutex<()>,
    /// Weak so the marker path never keeps the submit channel open.
    wake_tx: Mutex<Option<mpsc::WeakSender<SubmitWork>>>,
    metrics: Option<DaemonMetrics>,
}

impl Inner {
    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn publish_pending(&self) {
        self.idle_tx.send_if_modified(|idle| {
            let count = self.pending.load(Ordering::SeqCst);
            if let Some(metrics) = &self.metrics {
                metrics.set_open_pending(count);
            }
            let now_idle = count == 0;
            if *idle == now_idle {
                false
            } else {
                *idle = now_idle;
                true
            }
        });
    }

    /// Push a wake marker without blocking. A full queue already has workers
    /// busy, and each live submit drains first.
    fn wake(&self) -> bool {
        let sender = lock(&self.wake_tx)
            .as_ref()
            .and_then(mpsc::WeakSender::upgrade);
        let Some(sender) = sender else {
            return false;
        };
        match sender.try_send(SubmitWork::Wake) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Submit queue full, skipping wake marker");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Wait until the publisher gate reports ready. `false` on cancellation.
    async fn await_gate(&self, token: &CancellationToken) -> bool {
        loop {
            let readiness = tokio::select! {
                biased;
                () = token.cancelled() => return false,
                readiness = self.gate.wait_ready(self.gate_config.worker_wait) => readiness,
            };
            match readiness {
                Readiness::Ready => return true,
                Readiness::NotReadyYet => debug!("Publisher not stable yet, worker waiting"),
                Readiness::Failed(reason) => {
                    warn!(reason = %reason, "Publisher failed, worker waiting");
                },
            }
            if !sleep_or_cancel(self.gate_config.worker_retry_delay, token).await {
                return false;
            }
        }
    }

    fn defer(&self, job: SubmitJob, reason: &str) -> Result<SubmitOutcome, QueueError> {
        let job_id = job.id;
        let chain_id = job.chain_id.clone();
        self.store.append(job)?;
        info!(job_id = %job_id, chain_id = %chain_id, pending = self.pending(), reason, "Submit persisted to durable store");
        self.record_job("submit", "queued");
        self.refresh_backlog();
        Ok(SubmitOutcome::Queued {
            job_id,
            message: format!("Persisted to {} due to {reason}.", self.store.path().display()),
        })
    }

    async fn run_open(&self, job: OpenJob) {
        let OpenJob {
            pending,
            match_type,
            reply,
        } = job;

        let started = Instant::now();
        let result = self.ops.open(match_type.as_deref()).await;
        self.observe("open", started, &result);
        if let Err(e) = &result {
            warn!(error = %e, "Open failed");
        }

        drop(pending);
        let _ = reply.send(result.map_err(QueueError::from));
    }

    async fn run_live(&self, live: LiveSubmit, token: &CancellationToken) {
        let LiveSubmit { job, reply } = live;

        if self.pending() == 0 {
            self.drain_backlog(token).await;
        }
        // Nothing may await between this check and the submit.
        if self.pending() > 0 {
            let _ = reply.send(self.defer(job, "open queue activity"));
            return;
        }

        let started = Instant::now();
        let result = self.ops.submit(&job).await;
        self.observe("submit", started, &result);
        if let Err(e) = &result {
            warn!(chain_id = %job.chain_id, error = %e, "Submit failed");
        }
        let _ = reply.send(
            result
                .map(SubmitOutcome::Executed)
                .map_err(QueueError::from),
        );
    }

    /// Replay eligible durable records, oldest first. Stops as soon as an
    /// open becomes pending. Each record is reconciled by id: removed on
    /// success, re-persisted with its next eligibility on failure.
    async fn drain_backlog(&self, token: &CancellationToken) {
        let _drain = self.drain_lock.lock().await;

        let records = match self.store.load_all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to read durable submit store");
                return;
            },
        };
        if records.is_empty() {
            return;
        }

        let now = Utc::now();
        let total = records.len();
        let eligible: Vec<_> = records.into_iter().filter(|r| r.is_eligible(now)).collect();
        if eligible.is_empty() {
            debug!(total, "No durable records eligible yet");
            return;
        }
        info!(eligible = eligible.len(), total, "Draining durable submit backlog");

        let mut done = 0usize;
        for record in eligible {
            if !sleep_or_cancel(self.config.drain_step, token).await {
                break;
            }
            if self.pending() > 0 {
                info!(pending = self.pending(), done, "Open pending, pausing drain");
                break;
            }

            let started = Instant::now();
            let result = self.ops.submit(&record).await;
            self.observe("backlog", started, &result);

            match result {
                Ok(receipt) => {
                    done += 1;
                    debug!(job_id = %record.id, op_id = ?receipt.op_id, "Durable submit replayed");
                    if let Err(e) = self.store.update(|jobs| jobs.retain(|j| j.id != record.id)) {
                        warn!(job_id = %record.id, error = %e, "Failed to remove replayed submit");
                    }
                },
                Err(e) => {
                    warn!(job_id = %record.id, attempts = record.attempts + 1, error = %e, "Durable submit failed, keeping it");
                    let message = e.to_string();
                    let backoff = &self.config.backlog_retry;
                    let updated = self.store.update(|jobs| {
                        if let Some(job) = jobs.iter_mut().find(|j| j.id == record.id) {
                            job.record_failure(message, backoff, Utc::now());
                        }
                    });
                    if let Err(e) = updated {
                        warn!(job_id = %record.id, error = %e, "Failed to re-persist submit");
                    }
                    if !sleep_or_cancel(self.config.drain_error_pause, token).await {
                        break;
                    }
                },
            }
        }

        self.refresh_backlog();
    }

    fn observe<T>(&self, queue: &str, started: Instant, result: &Result<T, OperationError>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation_latency(queue, started.elapsed().as_secs_f64());
        }
        self.record_job(queue, if result.is_ok() { "success" } else { "error" });
    }

    fn record_job(&self, queue: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.job_finished(queue, outcome);
        }
    }

    fn refresh_backlog(&self) {
        if let Some(metrics) = &self.metrics {
            if let Ok(records) = self.store.len() {
                metrics.set_durable_backlog(records);
            }
        }
    }
}

/// Builder for [`TwoPhaseQueue`].
pub struct QueueBuilder {
    ops: Arc<dyn ChainOperations>,
    gate: Arc<dyn ReadinessGate>,
    store: Arc<DurableSubmitStore>,
    config: QueueConfig,
    gate_config: GateConfig,
    metrics: Option<DaemonMetrics>,
}

impl QueueBuilder {
    /// Queue sizing and pacing.
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Worker gate timing.
    #[must_use]
    pub const fn gate_config(mut self, gate_config: GateConfig) -> Self {
        self.gate_config = gate_config;
        self
    }

    /// Metrics to update.
    #[must_use]
    pub fn metrics(mut self, metrics: Option<DaemonMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawn the workers and the backlog sweeper. Must be called inside a
    /// Tokio runtime.
    #[must_use]
    pub fn start(self) -> TwoPhaseQueue {
        let (open_tx, open_rx) = mpsc::channel(self.config.open_capacity.max(1));
        let (submit_tx, submit_rx) = mpsc::channel(self.config.submit_capacity.max(1));
        let (idle_tx, _) = watch::channel(true);

        let inner = Arc::new(Inner {
            ops: self.ops,
            gate: self.gate,
            store: self.store,
            config: self.config,
            gate_config: self.gate_config,
            pending: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
            idle_tx,
            drain_lock: AsyncMutex::new(()),
            wake_tx: Mutex::new(Some(submit_tx.downgrade())),
            metrics: self.metrics,
        });
        inner.refresh_backlog();

        let token = CancellationToken::new();
        let open_rx: SharedReceiver<OpenJob> = Arc::new(AsyncMutex::new(open_rx));
        let submit_rx: SharedReceiver<SubmitWork> = Arc::new(AsyncMutex::new(submit_rx));

        let open_workers = inner.config.open_workers.max(1);
        let submit_workers = inner.config.submit_workers.max(1);
        let mut tasks = Vec::with_capacity(open_workers + submit_workers + 1);
        for _ in 0..open_workers {
            tasks.push(tokio::spawn(open_worker(
                Arc::clone(&inner),
                Arc::clone(&open_rx),
                token.clone(),
            )));
        }
        for _ in 0..submit_workers {
            tasks.push(tokio::spawn(submit_worker(
                Arc::clone(&inner),
                Arc::clone(&submit_rx),
                token.clone(),
            )));
        }
        tasks.push(tokio::spawn(sweeper(Arc::clone(&inner), token.clone())));

        info!(open_workers, submit_workers, "Two-phase queue started");

        TwoPhaseQueue {
            inner,
            open_tx: Mutex::new(Some(open_tx)),
            submit_tx: Mutex::new(Some(submit_tx)),
            open_rx,
            submit_rx,
            token,
            tasks: Mutex::new(tasks),
        }
    }
}

/// Open and submit queues with the cross-queue ordering guarantee.
pub struct TwoPhaseQueue {
    inner: Arc<Inner>,
    open_tx: Mutex<Option<mpsc::Sender<OpenJob>>>,
    submit_tx: Mutex<Option<mpsc::Sender<SubmitWork>>>,
    open_rx: SharedReceiver<OpenJob>,
    submit_rx: SharedReceiver<SubmitWork>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TwoPhaseQueue {
    /// Start building a queue.
    #[must_use]
    pub fn builder(
        ops: Arc<dyn ChainOperations>,
        gate: Arc<dyn ReadinessGate>,
        store: Arc<DurableSubmitStore>,
    ) -> QueueBuilder {
        QueueBuilder {
            ops,
            gate,
            store,
            config: QueueConfig::default(),
            gate_config: GateConfig::default(),
            metrics: None,
        }
    }

    /// Queue an open and wait for its result.
    ///
    /// The pending count is raised before the job is queued, so submits
    /// accepted from here on are deferred until it finishes.
    pub async fn enqueue_open(&self, match_type: Option<String>) -> Result<OpenedChain, QueueError> {
        let sender = lock(&self.open_tx).clone().ok_or(QueueError::Closed)?;
        let (reply, rx) = oneshot::channel();
        let job = OpenJob {
            pending: PendingGuard::new(&self.inner),
            match_type,
            reply,
        };
        debug!(pending = self.inner.pending(), "Open queued");
        sender.send(job).await.map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Canceled)?
    }

    /// Submit a match result.
    ///
    /// Returns [`SubmitOutcome::Queued`] right away while opens are pending,
    /// otherwise waits for the live submit.
    pub async fn enqueue_submit(
        &self,
        chain_id: impl Into<String>,
        app_id: impl Into<String>,
        payload: Value,
    ) -> Result<SubmitOutcome, QueueError> {
        let job = SubmitJob::new(chain_id, app_id, payload);
        if self.inner.pending() > 0 {
            return self.inner.defer(job, "open queue activity");
        }

        let sender = lock(&self.submit_tx).clone().ok_or(QueueError::Closed)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(SubmitWork::Live(LiveSubmit { job, reply }))
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Canceled)?
    }

    /// Opens accepted but not finished.
    #[must_use]
    pub fn pending_opens(&self) -> usize {
        self.inner.pending()
    }

    /// Times the pending count has returned to zero.
    #[must_use]
    pub fn idle_epoch(&self) -> u64 {
        self.inner.idle_epoch.load(Ordering::SeqCst)
    }

    /// Wait until no open is pending.
    pub async fn wait_open_idle(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Records in the durable backlog.
    pub fn backlog_len(&self) -> Result<usize, StoreError> {
        self.inner.store.len()
    }

    /// Ask a submit worker to drain the backlog, if no open is pending.
    pub fn wake(&self) -> bool {
        self.inner.pending() == 0 && self.inner.wake()
    }

    /// Whether [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting jobs, let in-flight jobs finish and join the workers.
    ///
    /// Live submits still queued are persisted and acknowledged as queued;
    /// queued opens are dropped and their callers see
    /// [`QueueError::Canceled`].
    pub async fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        drop(lock(&self.open_tx).take());
        drop(lock(&self.submit_tx).take());
        lock(&self.inner.wake_tx).take();
        self.token.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Queue worker panicked");
            }
        }

        let mut dropped_opens = 0usize;
        {
            let mut rx = self.open_rx.lock().await;
            rx.close();
            while let Ok(job) = rx.try_recv() {
                drop(job);
                dropped_opens += 1;
            }
        }

        let mut persisted = 0usize;
        {
            let mut rx = self.submit_rx.lock().await;
            rx.close();
            while let Ok(work) = rx.try_recv() {
                if let SubmitWork::Live(live) = work {
                    let outcome = self.inner.defer(live.job, "daemon shutdown");
                    if outcome.is_ok() {
                        persisted += 1;
                    }
                    let _ = live.reply.send(outcome);
                }
            }
        }

        info!(dropped_opens, persisted, "Two-phase queue stopped");
    }
}

impl Drop for TwoPhaseQueue {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn next<T>(rx: &AsyncMutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn open_worker(inner: Arc<Inner>, rx: SharedReceiver<OpenJob>, token: CancellationToken) {
    loop {
        if !inner.await_gate(&token).await {
            break;
        }
        let job = tokio::select! {
            biased;
            () = token.cancelled() => break,
            job = next(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.run_open(job).await;
    }
    debug!("Open worker stopped");
}

async fn submit_worker(inner: Arc<Inner>, rx: SharedReceiver<SubmitWork>, token: CancellationToken) {
    loop {
        if !inner.await_gate(&token).await {
            break;
        }
        let work = tokio::select! {
            biased;
            () = token.cancelled() => break,
            work = next(&rx) => match work {
                Some(work) => work,
                None => break,
            },
        };
        match work {
            SubmitWork::Wake => inner.drain_backlog(&token).await,
            SubmitWork::Live(live) => inner.run_live(live, &token).await,
        }
    }
    debug!("Submit worker stopped");
}

/// Wakes the submit queue periodically (and once at start) while records
/// are waiting and nothing else would trigger a drain.
async fn sweeper(inner: Arc<Inner>, token: CancellationToken) {
    let period = inner.config.backlog_sweep.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {},
        }
        if inner.pending() > 0 {
            continue;
        }
        match inner.store.is_empty() {
            Ok(false) => {
                debug!("Durable backlog present, waking submit queue");
                inner.wake();
            },
            Ok(true) => {},
            Err(e) => warn!(error = %e, "Failed to inspect durable submit store"),
        }
    }
}

/// Sleep unless cancelled first. `false` on cancellation.
async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    struct ReadyGate;

    #[async_trait]
    impl ReadinessGate for ReadyGate {
        async fn wait_ready(&self, _timeout: Duration) -> Readiness {
            Readiness::Ready
        }
    }

    /// Opens take `open_delay`; submits fail while `fail_submits` is set.
    #[derive(Default)]
    struct FakeOps {
        open_delay: Duration,
        opens: AtomicU32,
        submitted: Mutex<Vec<String>>,
        fail_submits: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ChainOperations for FakeOps {
        async fn open(&self, match_type: Option<&str>) -> Result<OpenedChain, OperationError> {
            tokio::time::sleep(self.open_delay).await;
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(OpenedChain {
                chain_id: format!("chain-{n}"),
                app_id: Some(format!("app-{n}")),
                match_type: match_type.map(str::to_string),
            })
        }

        async fn submit(&self, job: &SubmitJob) -> Result<SubmitReceipt, OperationError> {
            if self.fail_submits.load(Ordering::SeqCst) {
                return Err(OperationError::GraphQl("node rejected".to_string()));
            }
            lock(&self.submitted).push(job.chain_id.clone());
            Ok(SubmitReceipt {
                chain_id: job.chain_id.clone(),
                app_id: job.app_id.clone(),
                match_id: job.chain_id.clone(),
                op_id: Some("op".to_string()),
                verified: true,
                skipped: false,
            })
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            open_workers: 2,
            submit_workers: 2,
            drain_step: Duration::from_millis(1),
            drain_error_pause: Duration::from_millis(1),
            backlog_sweep: Duration::from_secs(3600),
            backlog_retry: chainfleet_core::restart::BackoffConfig::Fixed {
                delay: Duration::from_millis(50),
            },
            ..QueueConfig::default()
        }
    }

    fn queue(ops: Arc<FakeOps>, dir: &TempDir) -> (TwoPhaseQueue, Arc<DurableSubmitStore>) {
        let store = Arc::new(DurableSubmitStore::in_dir(dir.path()));
        let queue = TwoPhaseQueue::builder(ops, Arc::new(ReadyGate), Arc::clone(&store))
            .config(fast_config())
            .start();
        (queue, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_without_pending_open_executes() {
        let dir = TempDir::new().unwrap();
        let ops = Arc::new(FakeOps::default());
        let (queue, store) = queue(Arc::clone(&ops), &dir);

        let outcome = queue
            .enqueue_submit("chain-1", "app-1", json!({"matchId": "m"}))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Executed(ref r) if r.chain_id == "chain-1"));
        assert!(store.is_empty().unwrap());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_during_open_is_persisted_then_drained() {
        let dir = TempDir::new().unwrap();
        let ops = Arc::new(FakeOps {
            open_delay: Duration::from_secs(2),
            ..FakeOps::default()
        });
        let (queue, store) = queue(Arc::clone(&ops), &dir);
        let queue = Arc::new(queue);

        let opener = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue_open(None).await })
        };
        while queue.pending_opens() == 0 {
            tokio::task::yield_now().await;
        }

        let outcome = queue
            .enqueue_submit("chain-x", "app-x", json!({}))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert_eq!(store.len().unwrap(), 1);
        assert!(lock(&ops.submitted).is_empty());

        let opened = opener.await.unwrap().unwrap();
        assert_eq!(opened.chain_id, "chain-1");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_empty().unwrap() {
            assert!(Instant::now() < deadline, "backlog was not drained");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*lock(&ops.submitted), vec!["chain-x".to_string()]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_drain_keeps_record() {
        let dir = TempDir::new().unwrap();
        let ops = Arc::new(FakeOps::default());
        ops.fail_submits.store(true, Ordering::SeqCst);
        let store = Arc::new(DurableSubmitStore::in_dir(dir.path()));
        // Eligibility uses the wall clock, so retry immediately.
        let config = QueueConfig {
            backlog_retry: chainfleet_core::restart::BackoffConfig::Fixed {
                delay: Duration::ZERO,
            },
            ..fast_config()
        };
        let queue = TwoPhaseQueue::builder(
            Arc::clone(&ops) as Arc<dyn ChainOperations>,
            Arc::new(ReadyGate),
            Arc::clone(&store),
        )
        .config(config)
        .start();

        store.append(SubmitJob::new("chain-old", "app", json!({}))).unwrap();
        assert!(queue.wake());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let records = store.load_all().unwrap();
            if records[0].attempts > 0 {
                assert_eq!(records.len(), 1);
                assert!(records[0].last_error.is_some());
                break;
            }
            assert!(Instant::now() < deadline, "drain never attempted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        ops.fail_submits.store(false, Ordering::SeqCst);
        assert!(queue.wake());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_empty().unwrap() {
            assert!(Instant::now() < deadline, "record never replayed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_count_and_idle_signal() {
        let dir = TempDir::new().unwrap();
        let ops = Arc::new(FakeOps {
            open_delay: Duration::from_millis(500),
            ..FakeOps::default()
        });
        let (queue, _store) = queue(ops, &dir);
        let queue = Arc::new(queue);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.enqueue_open(Some("normal".to_string())).await })
            })
            .collect();
        while queue.pending_opens() < 3 {
            tokio::task::yield_now().await;
        }
        let epoch = queue.idle_epoch();

        queue.wait_open_idle().await;
        assert_eq!(queue.pending_opens(), 0);
        assert_eq!(queue.idle_epoch(), epoch + 1);
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_rejects_jobs() {
        let dir = TempDir::new().unwrap();
        let (queue, _store) = queue(Arc::new(FakeOps::default()), &dir);
        queue.shutdown().await;

        assert!(queue.is_closed());
        assert!(matches!(queue.enqueue_open(None).await, Err(QueueError::Closed)));
        assert!(matches!(
            queue.enqueue_submit("c", "a", json!({})).await,
            Err(QueueError::Closed)
        ));
        assert_eq!(queue.pending_opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drains_backlog_left_from_previous_run() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableSubmitStore::in_dir(dir.path()));
        store.append(SubmitJob::new("chain-prev", "app", json!({}))).unwrap();

        let ops = Arc::new(FakeOps::default());
        let queue = TwoPhaseQueue::builder(
            Arc::clone(&ops) as Arc<dyn ChainOperations>,
            Arc::new(ReadyGate),
            Arc::clone(&store),
        )
        .config(fast_config())
        .start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_empty().unwrap() {
            assert!(Instant::now() < deadline, "startup sweep did not drain");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*lock(&ops.submitted), vec!["chain-prev".to_string()]);
        queue.shutdown().await;
    }
}
