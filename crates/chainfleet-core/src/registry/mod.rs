//! Process registry.
//!
//! Owns every [`Supervisor`] the daemon runs: at most one for the shared
//! publisher node and one per tenant. Tenant ports are allocated here from
//! the configured range and never handed out twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::gate::{Readiness, ReadinessGate};
use crate::process::{ProcessError, ProcessId, ProcessLauncher};
use crate::supervisor::{Supervisor, SupervisorOptions};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Every port in the tenant range is taken.
    #[error("no free port for tenant {tenant} in {base}..{end}")]
    PortsExhausted {
        /// Tenant name.
        tenant: String,
        /// First port of the range.
        base: u16,
        /// One past the last port of the range.
        end: u32,
    },

    /// Tenant names are embedded in paths and arguments.
    #[error("invalid tenant name: {0:?}")]
    InvalidTenant(String),

    /// The publisher is running on another port.
    #[error("publisher already running on port {running}, requested {requested}")]
    PublisherPortInUse {
        /// Port of the running publisher.
        running: u16,
        /// Requested port.
        requested: u16,
    },

    /// Stopping a replaced supervisor failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// 32-bit FNV-1a.
#[must_use]
pub fn fnv1a(input: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    input
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

/// Whether something is already listening on `127.0.0.1:port`.
fn port_bound(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

fn valid_tenant(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != ".."
}

/// Explicit registry of supervised node processes.
pub struct ProcessRegistry {
    config: Arc<FleetConfig>,
    launcher: Arc<dyn ProcessLauncher>,
    publisher: Mutex<Option<Arc<Supervisor>>>,
    tenants: Mutex<HashMap<String, Arc<Supervisor>>>,
    assignments: Mutex<HashMap<String, u16>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: Arc<FleetConfig>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            launcher,
            publisher: Mutex::new(None),
            tenants: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Seed tenant port assignments, e.g. from persisted state. A tenant
    /// gets its previous port back when that port is still free.
    #[must_use]
    pub fn with_assignments(self, assignments: HashMap<String, u16>) -> Self {
        *lock(&self.assignments) = assignments;
        self
    }

    /// Fleet configuration.
    #[must_use]
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// The publisher supervisor, if one was created.
    #[must_use]
    pub fn publisher(&self) -> Option<Arc<Supervisor>> {
        lock(&self.publisher).clone()
    }

    /// Port of the publisher supervisor, or the configured port.
    #[must_use]
    pub fn publisher_port(&self) -> u16 {
        self.publisher()
            .map_or(self.config.publisher.port, |sup| sup.port())
    }

    /// Get the publisher supervisor, creating it on first use.
    ///
    /// `port` overrides the configured port. An idle supervisor on another
    /// port is stopped and replaced; a running one is an error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PublisherPortInUse`] when the running
    /// publisher listens on a different port.
    pub async fn publisher_for_port(
        &self,
        port: Option<u16>,
    ) -> Result<Arc<Supervisor>, RegistryError> {
        let requested = port.unwrap_or(self.config.publisher.port);

        let existing = self.publisher();
        if let Some(sup) = existing {
            if sup.port() == requested {
                return Ok(sup);
            }
            if sup.is_alive().await {
                return Err(RegistryError::PublisherPortInUse {
                    running: sup.port(),
                    requested,
                });
            }
            info!(from = sup.port(), to = requested, "Moving publisher to new port");
            sup.stop().await?;
        }

        let sup = Arc::new(self.build_publisher(requested));
        let mut slot = lock(&self.publisher);
        // A concurrent caller may have installed one for the same port.
        if let Some(current) = slot.as_ref() {
            if current.port() == requested {
                return Ok(Arc::clone(current));
            }
        }
        *slot = Some(Arc::clone(&sup));
        Ok(sup)
    }

    fn build_publisher(&self, port: u16) -> Supervisor {
        let publisher = &self.config.publisher;
        let spec = publisher.launch.render("publisher", port, None);
        let options = SupervisorOptions {
            start_grace: publisher.start_grace,
            stop_timeout: self.config.supervisor.stop_timeout,
            port_probe_timeout: publisher.probe_port.then_some(publisher.probe_timeout),
            gate: self.config.gate,
        };

        Supervisor::new(
            ProcessId::Publisher,
            spec,
            port,
            Arc::clone(&self.launcher),
            self.config.supervisor.publisher.clone(),
            options,
        )
    }

    /// A tenant supervisor, if one exists.
    #[must_use]
    pub fn get_tenant(&self, tenant: &str) -> Option<Arc<Supervisor>> {
        lock(&self.tenants).get(tenant).cloned()
    }

    /// Get the supervisor for `tenant`, creating it (and allocating its
    /// port) on first use.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names or when no port is free.
    pub fn tenant(&self, tenant: &str) -> Result<Arc<Supervisor>, RegistryError> {
        if !valid_tenant(tenant) {
            return Err(RegistryError::InvalidTenant(tenant.to_string()));
        }

        let mut tenants = lock(&self.tenants);
        if let Some(sup) = tenants.get(tenant) {
            return Ok(Arc::clone(sup));
        }

        let port = self.allocate_port(tenant, &tenants)?;
        let sup = Arc::new(self.build_tenant(tenant, port));
        tenants.insert(tenant.to_string(), Arc::clone(&sup));
        lock(&self.assignments).insert(tenant.to_string(), port);
        info!(tenant, port, "Registered tenant");
        Ok(sup)
    }

    fn build_tenant(&self, tenant: &str, port: u16) -> Supervisor {
        let config = &self.config.tenants;
        let spec = config
            .launch
            .render(&format!("tenant-{tenant}"), port, Some(tenant));
        let options = SupervisorOptions {
            start_grace: Duration::ZERO,
            stop_timeout: self.config.supervisor.stop_timeout,
            port_probe_timeout: Some(config.probe_timeout),
            gate: self.config.gate,
        };

        Supervisor::new(
            ProcessId::Tenant(tenant.to_string()),
            spec,
            port,
            Arc::clone(&self.launcher),
            self.config.supervisor.tenant.clone(),
            options,
        )
    }

    /// Pick a port for `tenant`.
    ///
    /// A previous assignment wins if that port is still free. Otherwise
    /// probing starts at `port_base + fnv1a(tenant) % port_span` and walks
    /// forward, wrapping at the end of the range, past ports owned by other
    /// tenants, the publisher, or anything already bound on localhost.
    fn allocate_port(
        &self,
        tenant: &str,
        tenants: &HashMap<String, Arc<Supervisor>>,
    ) -> Result<u16, RegistryError> {
        let config = &self.config.tenants;
        let base = u32::from(config.port_base);
        let span = u32::from(config.port_span);
        let publisher_port = self.publisher_port();

        let assignments = lock(&self.assignments);
        let taken = |port: u16| {
            port == publisher_port
                || tenants.values().any(|sup| sup.port() == port)
                || assignments
                    .iter()
                    .any(|(name, assigned)| name != tenant && *assigned == port)
        };

        if let Some(&previous) = assignments.get(tenant) {
            if !taken(previous) && !port_bound(previous) {
                debug!(tenant, port = previous, "Reusing previous port");
                return Ok(previous);
            }
        }

        let offset = fnv1a(tenant) % span;
        for step in 0..span {
            let candidate = base + (offset + step) % span;
            let Ok(port) = u16::try_from(candidate) else {
                continue;
            };
            if taken(port) {
                continue;
            }
            if port_bound(port) {
                debug!(tenant, port, "Port in use, probing next");
                continue;
            }
            return Ok(port);
        }

        warn!(tenant, "Tenant port range exhausted");
        Err(RegistryError::PortsExhausted {
            tenant: tenant.to_string(),
            base: config.port_base,
            end: base + span,
        })
    }

    /// Tenant name to port, for every known tenant.
    #[must_use]
    pub fn assigned_ports(&self) -> HashMap<String, u16> {
        lock(&self.assignments).clone()
    }

    /// Every supervisor, tenants first.
    #[must_use]
    pub fn supervisors(&self) -> Vec<Arc<Supervisor>> {
        let mut all: Vec<_> = lock(&self.tenants).values().cloned().collect();
        all.extend(self.publisher());
        all
    }

    /// Stop every supervisor: tenants first, then the publisher.
    ///
    /// Failures are logged; every supervisor is attempted.
    pub async fn stop_all(&self) {
        let tenants: Vec<_> = lock(&self.tenants).values().cloned().collect();
        for sup in tenants {
            if let Err(e) = sup.stop().await {
                warn!(process = %sup.id(), error = %e, "Failed to stop tenant");
            }
        }
        if let Some(sup) = self.publisher() {
            if let Err(e) = sup.stop().await {
                warn!(process = %sup.id(), error = %e, "Failed to stop publisher");
            }
        }
    }
}

/// Gate of the publisher, whichever supervisor currently owns it. Waits for
/// the supervisor to exist before waiting on it.
#[async_trait]
impl ReadinessGate for ProcessRegistry {
    async fn wait_ready(&self, timeout: Duration) -> Readiness {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(sup) = self.publisher() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                return sup.wait_ready(remaining).await;
            }
            let now = Instant::now();
            if now >= deadline {
                return Readiness::NotReadyYet;
            }
            tokio::time::sleep(self.config.gate.poll_interval.min(deadline - now)).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::OsLauncher;

    fn registry(base: u16, span: u16) -> ProcessRegistry {
        let mut config = FleetConfig::default();
        config.tenants.port_base = base;
        config.tenants.port_span = span;
        ProcessRegistry::new(Arc::new(config), Arc::new(OsLauncher::new()))
    }

    /// A base port with `span` free ports after it.
    fn free_range(span: u16) -> u16 {
        'outer: for base in (30_000u16..60_000).step_by(usize::from(span) + 7) {
            for port in base..base + span {
                if port_bound(port) {
                    continue 'outer;
                }
            }
            return base;
        }
        panic!("no free port range");
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(""), 0x811c_9dc5);
        assert_eq!(fnv1a("a"), 0xe40c_292c);
        assert_eq!(fnv1a("foobar"), 0xbf9c_f968);
    }

    #[tokio::test]
    async fn test_tenant_port_is_hash_derived_and_stable() {
        let base = free_range(50);
        let reg = registry(base, 50);

        let alice = reg.tenant("alice").unwrap();
        let expected = base + u16::try_from(fnv1a("alice") % 50).unwrap();
        assert_eq!(alice.port(), expected);

        // Same supervisor on repeat lookups
        let again = reg.tenant("alice").unwrap();
        assert!(Arc::ptr_eq(&alice, &again));
    }

    #[tokio::test]
    async fn test_tenant_ports_are_unique() {
        let base = free_range(4);
        let reg = registry(base, 4);

        let mut ports: Vec<u16> = ["a", "b", "c", "d"]
            .iter()
            .map(|t| reg.tenant(t).unwrap().port())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
        assert!(ports.iter().all(|p| (base..base + 4).contains(p)));

        assert!(matches!(
            reg.tenant("e"),
            Err(RegistryError::PortsExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_bound_port_is_skipped() {
        let base = free_range(3);
        let reg = registry(base, 3);
        let preferred = base + u16::try_from(fnv1a("bob") % 3).unwrap();

        let _listener = std::net::TcpListener::bind(("127.0.0.1", preferred)).unwrap();
        let bob = reg.tenant("bob").unwrap();
        assert_ne!(bob.port(), preferred);
    }

    #[tokio::test]
    async fn test_previous_assignment_is_reused() {
        let base = free_range(20);
        let reg = registry(base, 20)
            .with_assignments(HashMap::from([("carol".to_string(), base + 17)]));

        assert_eq!(reg.tenant("carol").unwrap().port(), base + 17);
    }

    #[test]
    fn test_invalid_tenant_names() {
        let reg = registry(40_000, 10);
        for name in ["", "..", "a/b", "x y", "evil;rm"] {
            assert!(matches!(
                reg.tenant(name),
                Err(RegistryError::InvalidTenant(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_publisher_created_once_per_port() {
        let reg = registry(40_000, 10);

        let first = reg.publisher_for_port(None).await.unwrap();
        let second = reg.publisher_for_port(Some(8080)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.publisher_port(), 8080);

        // Idle publisher moves to the requested port
        let moved = reg.publisher_for_port(Some(8090)).await.unwrap();
        assert_eq!(moved.port(), 8090);
        assert_eq!(reg.publisher_port(), 8090);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_without_publisher_is_not_ready() {
        let reg = registry(40_000, 10);
        assert_eq!(
            reg.wait_ready(Duration::from_secs(2)).await,
            Readiness::NotReadyYet
        );
    }
}
