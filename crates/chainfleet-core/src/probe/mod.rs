//! Liveness probes.
//!
//! A probe answers "is the service alive right now?" without side effects and
//! without failing: every error resolves to "not alive".

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// One liveness observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Whether the target answered.
    pub alive: bool,
    /// Identity of the observed instance (the pid). A change of identity
    /// means the service was restarted between observations.
    pub identity: Option<u32>,
}

impl Observation {
    /// A dead observation.
    #[must_use]
    pub const fn dead() -> Self {
        Self {
            alive: false,
            identity: None,
        }
    }

    /// A live observation of `identity`.
    #[must_use]
    pub const fn alive(identity: Option<u32>) -> Self {
        Self {
            alive: true,
            identity,
        }
    }
}

/// Source of liveness observations.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Observe the target once.
    async fn observe(&self) -> Observation;

    /// Reason the target will never become ready, if it is known to have
    /// failed permanently.
    fn failure(&self) -> Option<String> {
        None
    }
}

/// Whether a TCP connect to `addr` succeeds within `timeout`.
async fn tcp_alive(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Probe that only checks a TCP port.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `addr` with a connect timeout.
    #[must_use]
    pub const fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// Probe `127.0.0.1:port`.
    #[must_use]
    pub fn localhost(port: u16, timeout: Duration) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)), timeout)
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn observe(&self) -> Observation {
        if tcp_alive(self.addr, self.timeout).await {
            Observation::alive(None)
        } else {
            Observation::dead()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(addr, Duration::from_secs(2));
        assert_eq!(probe.observe().await, Observation::alive(None));
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port_is_dead() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = TcpProbe::new(addr, Duration::from_secs(2));
        assert!(!probe.observe().await.alive);
    }

    #[tokio::test]
    async fn test_default_failure_is_none() {
        let probe = TcpProbe::localhost(1, Duration::from_millis(100));
        assert!(probe.failure().is_none());
    }
}
