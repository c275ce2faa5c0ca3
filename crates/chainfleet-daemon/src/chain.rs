//! Chain operations against the publisher node's GraphQL service.
//!
//! Two operations back the queue:
//!
//! - **open**: run `openAndCreate` on the match application, then discover
//!   the chain it created by diffing `allOpenedChains` against a snapshot
//!   taken beforehand, and look up the child application on it.
//! - **submit**: run `recordScore` on a child application and extract the
//!   operation id.
//!
//! Mutations go through the [`RemoteOperationExecutor`] so they wait for the
//! publisher to be stable and retry transient failures. The read-only
//! discovery queries are plain calls with a short timeout.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chainfleet_core::config::{CallProfile, ChainConfig};
use chainfleet_core::executor::{ExecutorError, RemoteOperationExecutor};
use chainfleet_core::gate::ReadinessGate;
use chainfleet_core::registry::ProcessRegistry;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::state::OrchestratorStateStore;
use crate::store::SubmitJob;

const OPEN_MUTATION: &str = "mutation { openAndCreate }";
const OPENED_CHAINS_QUERY: &str = "query { allOpenedChains }";
const CHILD_APPS_QUERY: &str = "query { allChildApps { chainId appId } }";
const RECORD_SCORE_MUTATION: &str = "mutation recordScore($matchResult: MatchResultInput!) { recordScore(matchResult: $matchResult) }";

/// Match type acknowledged without a chain call.
const TOURNAMENT: &str = "tournament";

/// Chain operation errors.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Orchestrator state lacks the ids needed to address the publisher.
    #[error("chain operations not configured: {0}")]
    NotConfigured(&'static str),

    /// The gated remote call failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The open mutation succeeded but no new chain showed up.
    #[error("no new chain found after polling allOpenedChains {attempts} time(s)")]
    Discovery {
        /// Polls made.
        attempts: u32,
    },

    /// The submit payload is unusable.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The service answered with GraphQL errors.
    #[error("graphql error: {0}")]
    GraphQl(String),

    /// A discovery query got no answer: refused, timed out or non-2xx.
    #[error("publisher query failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The service answer could not be parsed.
    #[error("unparseable response: {0}")]
    Parse(String),
}

impl OperationError {
    /// Whether the operation ran out of time (maps to 504).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Executor(e) => e.is_timeout(),
            Self::Transport(e) => e.is_timeout(),
            Self::Discovery { .. } => true,
            _ => false,
        }
    }

    /// Whether the publisher never became ready (maps to 503/504).
    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self, Self::Executor(e) if e.is_not_ready())
    }

    /// Whether the payload was rejected before any call (maps to 400).
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::InvalidPayload(_))
    }
}

/// A freshly opened chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedChain {
    /// New chain id.
    pub chain_id: String,
    /// Child application on the new chain, if the contract reported one.
    pub app_id: Option<String>,
    /// Match type the caller asked for.
    pub match_type: Option<String>,
}

/// Result of a submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Target chain.
    pub chain_id: String,
    /// Target application.
    pub app_id: String,
    /// Match id from the payload, or the chain id.
    pub match_id: String,
    /// Operation id returned by the mutation.
    pub op_id: Option<String>,
    /// Whether the node acknowledged an operation id.
    pub verified: bool,
    /// Acknowledged without a chain call.
    pub skipped: bool,
}

/// The two operations the queue runs.
#[async_trait]
pub trait ChainOperations: Send + Sync {
    /// Open a new chain.
    async fn open(&self, match_type: Option<&str>) -> Result<OpenedChain, OperationError>;

    /// Record one match result.
    async fn submit(&self, job: &SubmitJob) -> Result<SubmitReceipt, OperationError>;
}

/// Where the publisher's GraphQL service is reachable.
pub trait NodeEndpoint: Send + Sync {
    /// Base URL without a trailing slash, e.g. `http://localhost:8080`.
    fn base_url(&self) -> String;
}

impl NodeEndpoint for String {
    fn base_url(&self) -> String {
        self.trim_end_matches('/').to_string()
    }
}

/// Publisher endpoint that follows the registry's current port.
pub struct PublisherEndpoint {
    registry: Arc<ProcessRegistry>,
    host: String,
}

impl PublisherEndpoint {
    /// Endpoint on `host` at whatever port the publisher uses.
    #[must_use]
    pub fn new(registry: Arc<ProcessRegistry>, host: impl Into<String>) -> Self {
        Self {
            registry,
            host: host.into(),
        }
    }
}

impl NodeEndpoint for PublisherEndpoint {
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.registry.publisher_port())
    }
}

/// Which match type a payload carries, normalized.
#[must_use]
pub fn match_type(payload: &Value) -> Option<String> {
    payload
        .get("matchType")
        .and_then(Value::as_str)
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
}

/// Operation id from a `recordScore` response: either `data` itself or
/// `data.recordScore`, when it is a string.
#[must_use]
pub fn extract_op_id(response: &Value) -> Option<String> {
    let data = response.get("data")?;
    data.as_str()
        .or_else(|| data.get("recordScore").and_then(Value::as_str))
        .map(str::to_string)
}

fn graphql_errors(response: &Value) -> Option<String> {
    let errors = response.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .map(|e| e.get("message").and_then(Value::as_str).map_or_else(|| e.to_string(), str::to_string))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn chain_ids(response: &Value) -> Result<Vec<String>, OperationError> {
    let list = response
        .pointer("/data/allOpenedChains")
        .and_then(Value::as_array)
        .ok_or_else(|| OperationError::Parse("missing data.allOpenedChains".to_string()))?;
    Ok(list
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}

/// GraphQL-backed [`ChainOperations`].
pub struct NodeChainOperations {
    executor: RemoteOperationExecutor,
    gate: Arc<dyn ReadinessGate>,
    endpoint: Arc<dyn NodeEndpoint>,
    state: Arc<OrchestratorStateStore>,
    config: ChainConfig,
    open_profile: CallProfile,
    submit_profile: CallProfile,
    /// Chains already handed to an open, so concurrent opens never claim the
    /// same one.
    known_chains: Mutex<HashSet<String>>,
}

impl NodeChainOperations {
    /// Create the operations.
    #[must_use]
    pub fn new(
        executor: RemoteOperationExecutor,
        gate: Arc<dyn ReadinessGate>,
        endpoint: Arc<dyn NodeEndpoint>,
        state: Arc<OrchestratorStateStore>,
        config: ChainConfig,
        open_profile: CallProfile,
        submit_profile: CallProfile,
    ) -> Self {
        Self {
            executor,
            gate,
            endpoint,
            state,
            config,
            open_profile,
            submit_profile,
            known_chains: Mutex::new(HashSet::new()),
        }
    }

    fn application_url(&self, chain_id: &str, app_id: &str) -> String {
        format!(
            "{}/chains/{chain_id}/applications/{app_id}",
            self.endpoint.base_url()
        )
    }

    fn match_app_url(&self) -> Result<String, OperationError> {
        let state = self.state.snapshot();
        let chain = state
            .publisher_chain_id
            .ok_or(OperationError::NotConfigured("publisherChainId is not set"))?;
        let app = state
            .match_app_id
            .ok_or(OperationError::NotConfigured("matchAppId is not set"))?;
        Ok(self.application_url(&chain, &app))
    }

    /// Gated mutation. Fails on GraphQL errors in the answer.
    async fn mutate(&self, url: &str, body: &Value, profile: CallProfile) -> Result<Value, OperationError> {
        let bytes = serde_json::to_vec(body).map_err(|e| OperationError::InvalidPayload(e.to_string()))?;
        let factory = move || bytes.clone();
        let response = self
            .executor
            .execute(self.gate.as_ref(), url, &factory, profile)
            .await?;
        let json = response
            .json()
            .map_err(|e| OperationError::Parse(e.to_string()))?;
        if let Some(errors) = graphql_errors(&json) {
            return Err(OperationError::GraphQl(errors));
        }
        Ok(json)
    }

    /// Plain query with the short timeout, no gate and no retry.
    async fn query(&self, url: &str, query: &str) -> Result<Value, OperationError> {
        let response = self
            .executor
            .client()
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(json!({ "query": query }).to_string())
            .timeout(self.config.seed_timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(OperationError::Transport)?;
        let body = response.bytes().await.map_err(OperationError::Transport)?;
        let json: Value =
            serde_json::from_slice(&body).map_err(|e| OperationError::Parse(e.to_string()))?;
        if let Some(errors) = graphql_errors(&json) {
            return Err(OperationError::GraphQl(errors));
        }
        Ok(json)
    }

    async fn discover_chain(&self, url: &str, seed: &HashSet<String>) -> Result<String, OperationError> {
        let attempts = self.config.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.discovery_interval).await;

            let ids = match self.query(url, OPENED_CHAINS_QUERY).await.and_then(|r| chain_ids(&r)) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to poll allOpenedChains");
                    continue;
                },
            };

            let claimed = {
                let mut known = self
                    .known_chains
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let fresh = ids
                    .into_iter()
                    .find(|id| !seed.contains(id) && !known.contains(id));
                if let Some(id) = &fresh {
                    known.insert(id.clone());
                }
                fresh
            };
            if let Some(chain_id) = claimed {
                debug!(attempt, chain_id = %chain_id, "Discovered new chain");
                return Ok(chain_id);
            }
        }
        Err(OperationError::Discovery { attempts })
    }

    async fn child_app(&self, url: &str, chain_id: &str) -> Option<String> {
        let response = match self.query(url, CHILD_APPS_QUERY).await {
            Ok(response) => response,
            Err(e) => {
                warn!(chain_id, error = %e, "Failed to query allChildApps");
                return None;
            },
        };
        response
            .pointer("/data/allChildApps")
            .and_then(Value::as_array)?
            .iter()
            .find(|entry| entry.get("chainId").and_then(Value::as_str) == Some(chain_id))
            .and_then(|entry| entry.get("appId").and_then(Value::as_str))
            .map(str::to_string)
    }
}

#[async_trait]
impl ChainOperations for NodeChainOperations {
    async fn open(&self, match_type: Option<&str>) -> Result<OpenedChain, OperationError> {
        let url = self.match_app_url()?;
        let started = Instant::now();

        let seed: HashSet<String> = match self.query(&url, OPENED_CHAINS_QUERY).await.and_then(|r| chain_ids(&r)) {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read allOpenedChains seed, assuming none");
                HashSet::new()
            },
        };

        self.mutate(&url, &json!({ "query": OPEN_MUTATION }), self.open_profile)
            .await?;

        let chain_id = self.discover_chain(&url, &seed).await?;
        let app_id = self.child_app(&url, &chain_id).await;
        if app_id.is_none() {
            warn!(chain_id = %chain_id, "No child application reported for new chain");
        }

        info!(
            chain_id = %chain_id,
            app_id = app_id.as_deref().unwrap_or("-"),
            latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Opened chain"
        );
        Ok(OpenedChain {
            chain_id,
            app_id,
            match_type: match_type.map(str::to_string),
        })
    }

    async fn submit(&self, job: &SubmitJob) -> Result<SubmitReceipt, OperationError> {
        if job.chain_id.trim().is_empty() {
            return Err(OperationError::InvalidPayload("chainId is required".to_string()));
        }
        if job.app_id.trim().is_empty() {
            return Err(OperationError::InvalidPayload("appId is required".to_string()));
        }
        if !job.payload.is_object() {
            return Err(OperationError::InvalidPayload("matchResult must be an object".to_string()));
        }

        let match_id = job
            .payload
            .get("matchId")
            .and_then(Value::as_str)
            .map_or_else(|| job.chain_id.clone(), str::to_string);

        if match_type(&job.payload).as_deref() == Some(TOURNAMENT) {
            info!(match_id = %match_id, "Tournament match, skipping chain submit");
            return Ok(SubmitReceipt {
                chain_id: job.chain_id.clone(),
                app_id: job.app_id.clone(),
                match_id,
                op_id: None,
                verified: false,
                skipped: true,
            });
        }

        let url = self.application_url(&job.chain_id, &job.app_id);
        let body = json!({
            "query": RECORD_SCORE_MUTATION,
            "variables": { "matchResult": job.payload },
        });
        let started = Instant::now();
        let response = self.mutate(&url, &body, self.submit_profile).await?;

        let op_id = extract_op_id(&response);
        if op_id.is_none() {
            warn!(chain_id = %job.chain_id, match_id = %match_id, "recordScore returned no operation id");
        }
        info!(
            chain_id = %job.chain_id,
            match_id = %match_id,
            op_id = op_id.as_deref().unwrap_or("-"),
            latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Submitted match result"
        );

        Ok(SubmitReceipt {
            chain_id: job.chain_id.clone(),
            app_id: job.app_id.clone(),
            match_id,
            verified: op_id.is_some(),
            op_id,
            skipped: false,
        })
    }
}
