//! Shared daemon state.
//!
//! [`OrchestratorStateStore`] persists the chain identifiers the daemon
//! needs to address the publisher's applications, plus tenant port
//! assignments, in `orchestrator_state.json`. [`DaemonState`] bundles the
//! long-lived components the HTTP handlers operate on.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chainfleet_core::registry::ProcessRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fs_safe::{self, DEFAULT_MAX_FILE_SIZE, FsSafeError};
use crate::metrics::SharedMetricsRegistry;
use crate::queue::TwoPhaseQueue;

/// File name of the orchestrator state inside the state directory.
pub const STATE_FILE: &str = "orchestrator_state.json";

/// Identifiers of the publisher chain and its applications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    /// Chain the match application lives on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_chain_id: Option<String>,

    /// Owner of the publisher chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_owner: Option<String>,

    /// Match application that opens child chains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_app_id: Option<String>,

    /// Other named application ids.
    #[serde(default)]
    pub applications: BTreeMap<String, String>,

    /// Named module (bytecode) ids.
    #[serde(default)]
    pub modules: BTreeMap<String, String>,

    /// Tenant name to assigned port.
    #[serde(default)]
    pub tenant_ports: BTreeMap<String, u16>,
}

impl OrchestratorState {
    /// Whether chain operations can be addressed.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.publisher_chain_id.is_some() && self.match_app_id.is_some()
    }

    /// Fold a patch in. Map entries are merged key by key.
    pub fn apply(&mut self, patch: OrchestratorPatch) {
        if let Some(chain) = patch.publisher_chain_id {
            self.publisher_chain_id = Some(chain);
        }
        if let Some(owner) = patch.publisher_owner {
            self.publisher_owner = Some(owner);
        }
        if let Some(app) = patch.match_app_id {
            self.match_app_id = Some(app);
        }
        self.applications.extend(patch.applications);
        self.modules.extend(patch.modules);
    }
}

/// Partial update accepted by `PUT /linera/linera-config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorPatch {
    /// New publisher chain id.
    #[serde(default)]
    pub publisher_chain_id: Option<String>,
    /// New publisher owner.
    #[serde(default)]
    pub publisher_owner: Option<String>,
    /// New match application id.
    #[serde(default)]
    pub match_app_id: Option<String>,
    /// Application ids to add or replace.
    #[serde(default)]
    pub applications: BTreeMap<String, String>,
    /// Module ids to add or replace.
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

/// In-memory orchestrator state with write-through persistence.
#[derive(Debug)]
pub struct OrchestratorStateStore {
    path: PathBuf,
    state: Mutex<OrchestratorState>,
}

impl OrchestratorStateStore {
    /// Load from [`STATE_FILE`] in `state_dir`.
    ///
    /// A missing file starts empty. A corrupt one is logged and ignored; it
    /// is replaced on the next write.
    ///
    /// # Errors
    ///
    /// Returns any other filesystem error.
    pub fn load(state_dir: &Path) -> Result<Self, FsSafeError> {
        let path = state_dir.join(STATE_FILE);
        let state = match fs_safe::bounded_read_json(&path, DEFAULT_MAX_FILE_SIZE) {
            Ok(state) => {
                info!(path = %path.display(), "Loaded orchestrator state");
                state
            },
            Err(e) if e.is_not_found() => OrchestratorState::default(),
            Err(e) if e.is_corrupt() => {
                warn!(path = %path.display(), error = %e, "Orchestrator state is corrupt, starting empty");
                OrchestratorState::default()
            },
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Store that starts from `state` and persists to `path`.
    #[must_use]
    pub fn with_state(path: impl Into<PathBuf>, state: OrchestratorState) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(state),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> OrchestratorState {
        self.lock().clone()
    }

    /// Tenant port assignments as the registry expects them.
    #[must_use]
    pub fn tenant_ports(&self) -> HashMap<String, u16> {
        self.lock()
            .tenant_ports
            .iter()
            .map(|(name, port)| (name.clone(), *port))
            .collect()
    }

    /// Mutate and persist. The in-memory state is only changed when the
    /// write succeeds.
    ///
    /// # Errors
    ///
    /// Returns the filesystem error of the write.
    pub fn update(&self, f: impl FnOnce(&mut OrchestratorState)) -> Result<OrchestratorState, FsSafeError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        f(&mut next);
        if next != *guard {
            fs_safe::atomic_write_json(&self.path, &next)?;
            *guard = next;
        }
        Ok(guard.clone())
    }

    /// Apply a patch and persist.
    ///
    /// # Errors
    ///
    /// Returns the filesystem error of the write.
    pub fn merge(&self, patch: OrchestratorPatch) -> Result<OrchestratorState, FsSafeError> {
        self.update(|state| state.apply(patch))
    }

    /// Replace the tenant port assignments and persist.
    ///
    /// # Errors
    ///
    /// Returns the filesystem error of the write.
    pub fn set_tenant_ports(&self, ports: &HashMap<String, u16>) -> Result<(), FsSafeError> {
        self.update(|state| {
            state.tenant_ports = ports.iter().map(|(k, v)| (k.clone(), *v)).collect();
        })
        .map(|_| ())
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared daemon state.
pub type SharedState = Arc<DaemonState>;

/// Components shared by every HTTP handler.
pub struct DaemonState {
    registry: Arc<ProcessRegistry>,
    queue: Arc<TwoPhaseQueue>,
    orchestrator: Arc<OrchestratorStateStore>,
    metrics: Option<SharedMetricsRegistry>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    started_at: DateTime<Utc>,
}

impl DaemonState {
    /// Bundle the daemon components.
    #[must_use]
    pub fn new(
        registry: Arc<ProcessRegistry>,
        queue: Arc<TwoPhaseQueue>,
        orchestrator: Arc<OrchestratorStateStore>,
        metrics: Option<SharedMetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            queue,
            orchestrator,
            metrics,
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// Process registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Two-phase queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<TwoPhaseQueue> {
        &self.queue
    }

    /// Persisted orchestrator state.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<OrchestratorStateStore> {
        &self.orchestrator
    }

    /// Metrics registry, unless metrics are disabled.
    #[must_use]
    pub const fn metrics(&self) -> Option<&SharedMetricsRegistry> {
        self.metrics.as_ref()
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Persist the registry's current tenant port assignments.
    pub fn persist_tenant_ports(&self) {
        if let Err(e) = self
            .orchestrator
            .set_tenant_ports(&self.registry.assigned_ports())
        {
            warn!(error = %e, "Failed to persist tenant port assignments");
        }
    }
}
