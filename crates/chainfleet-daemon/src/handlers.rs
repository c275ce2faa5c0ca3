//! Operator HTTP surface.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Daemon liveness |
//! | `/linera/start-linera-service` | POST | Start the publisher (`?port=` overrides) |
//! | `/linera/stop-linera-service` | POST | Stop the publisher |
//! | `/linera/linera-health` | GET | Publisher pid and running flag |
//! | `/linera/linera-config` | GET, PUT | Orchestrator state plus `isReady` |
//! | `/linera/open-and-create` | POST | Queue an open |
//! | `/linera/submit-match-result` | POST | Queue a submit |
//! | `/linera/tenants/{tenant}/start` | POST | Start a tenant node |
//! | `/linera/tenants/{tenant}/stop` | POST | Stop a tenant node |
//! | `/linera/tenants/{tenant}/health` | GET | Tenant node status |
//! | `/metrics` | GET | Prometheus text |

use std::future::Future;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chainfleet_core::registry::RegistryError;
use chainfleet_core::supervisor::Supervisor;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::queue::{QueueError, SubmitOutcome};
use crate::state::{OrchestratorPatch, OrchestratorState, SharedState};

/// Error body: `{success: false, error}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn from_registry(err: &RegistryError) -> Self {
        let status = match err {
            RegistryError::InvalidTenant(_) => StatusCode::BAD_REQUEST,
            RegistryError::PublisherPortInUse { .. } => StatusCode::CONFLICT,
            RegistryError::PortsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Process(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }

    /// Opens report every wait as a gateway timeout.
    fn from_open(err: &QueueError) -> Self {
        let status = match err {
            QueueError::Operation(e) if e.is_timeout() || e.is_not_ready() => {
                StatusCode::GATEWAY_TIMEOUT
            },
            QueueError::Closed | QueueError::Canceled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }

    fn from_submit(err: &QueueError) -> Self {
        let status = match err {
            QueueError::Operation(e) if e.is_not_ready() => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Operation(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            QueueError::Operation(e) if e.is_invalid() => StatusCode::BAD_REQUEST,
            QueueError::Store(e) if e.is_full() => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Closed | QueueError::Canceled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Build the router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/linera/start-linera-service", post(start_service))
        .route("/linera/stop-linera-service", post(stop_service))
        .route("/linera/linera-health", get(service_health))
        .route("/linera/linera-config", get(get_config).put(put_config))
        .route("/linera/open-and-create", post(open_and_create))
        .route("/linera/submit-match-result", post(submit_match_result))
        .route("/linera/tenants/{tenant}/start", post(start_tenant))
        .route("/linera/tenants/{tenant}/stop", post(stop_tenant))
        .route("/linera/tenants/{tenant}/health", get(tenant_health))
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Serve the router on `listener` until `signal` resolves.
///
/// When the signal fires the shutdown flag is set and the queue is shut
/// down before the server drains its connections. Requests parked on the
/// publisher gate are answered by the queue shutdown (opens with 503,
/// queued submits as persisted), so the drain always completes.
///
/// # Errors
///
/// Returns the server's I/O error.
pub async fn serve<F>(listener: TcpListener, state: SharedState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let drain = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            drain.request_shutdown();
            info!("Stopping queue");
            drain.queue().shutdown().await;
        })
        .await
}

async fn track_requests(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());
    let response = next.run(request).await;
    if let Some(metrics) = state.metrics() {
        metrics
            .daemon_metrics()
            .http_request_completed(&endpoint, response.status().as_str());
    }
    response
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": if state.is_shutdown_requested() { "shutting_down" } else { "ok" },
        "uptimeSecs": state.uptime_secs(),
        "pendingOpens": state.queue().pending_opens(),
    }))
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    port: Option<u16>,
}

async fn start_service(State(state): State<SharedState>, Query(query): Query<StartQuery>) -> ApiResult {
    let sup = state
        .registry()
        .publisher_for_port(query.port)
        .await
        .map_err(|e| ApiError::from_registry(&e))?;
    let pid = sup.start().await.map_err(|e| {
        error!(error = %e, "Failed to start publisher");
        ApiError::internal(e.to_string())
    })?;
    info!(pid, port = sup.port(), "Publisher started via API");
    Ok(Json(json!({ "success": true, "pid": pid, "port": sup.port() })))
}

async fn stop_service(State(state): State<SharedState>) -> ApiResult {
    let Some(sup) = state.registry().publisher() else {
        return Ok(Json(json!({ "success": true, "pid": null })));
    };
    let pid = sup
        .stop()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "success": true, "pid": pid })))
}

async fn service_health(State(state): State<SharedState>) -> Json<Value> {
    let registry = state.registry();
    let Some(sup) = registry.publisher() else {
        return Json(json!({
            "success": true,
            "pid": null,
            "isRunning": false,
            "port": registry.publisher_port(),
        }));
    };
    Json(node_status(&sup).await)
}

async fn node_status(sup: &Supervisor) -> Value {
    json!({
        "success": true,
        "pid": sup.pid(),
        "isRunning": sup.is_alive().await,
        "port": sup.port(),
        "state": sup.state().to_string(),
        "restarts": sup.restarts(),
    })
}

fn config_body(snapshot: &OrchestratorState) -> ApiResult {
    let mut body = serde_json::to_value(snapshot).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Value::Object(map) = &mut body {
        map.insert("isReady".to_string(), Value::Bool(snapshot.is_ready()));
        map.insert("success".to_string(), Value::Bool(true));
    }
    Ok(Json(body))
}

async fn get_config(State(state): State<SharedState>) -> ApiResult {
    config_body(&state.orchestrator().snapshot())
}

async fn put_config(State(state): State<SharedState>, Json(patch): Json<OrchestratorPatch>) -> ApiResult {
    let updated = state.orchestrator().merge(patch).map_err(|e| {
        error!(error = %e, "Failed to persist orchestrator state");
        ApiError::internal(e.to_string())
    })?;
    info!(ready = updated.is_ready(), "Orchestrator state updated");
    config_body(&updated)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenRequest {
    #[serde(default)]
    match_type: Option<String>,
}

async fn open_and_create(State(state): State<SharedState>, body: Option<Json<OpenRequest>>) -> ApiResult {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let match_type = request
        .match_type
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty());

    let opened = state
        .queue()
        .enqueue_open(match_type)
        .await
        .map_err(|e| {
            warn!(error = %e, "Open request failed");
            ApiError::from_open(&e)
        })?;

    Ok(Json(json!({
        "success": true,
        "chainId": opened.chain_id,
        "appId": opened.app_id,
        "matchType": opened.match_type,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(default)]
    chain_id: Option<String>,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    match_result: Option<Value>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

async fn submit_match_result(State(state): State<SharedState>, Json(request): Json<SubmitRequest>) -> ApiResult {
    let (Some(chain_id), Some(app_id)) = (non_empty(request.chain_id), non_empty(request.app_id)) else {
        return Err(ApiError::bad_request("chainId and appId are required"));
    };
    let Some(Value::Object(mut payload)) = request.match_result else {
        return Err(ApiError::bad_request("matchResult must be an object"));
    };

    let match_id = match payload.get("matchId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            payload.insert("matchId".to_string(), Value::String(chain_id.clone()));
            chain_id.clone()
        },
    };

    let outcome = state
        .queue()
        .enqueue_submit(chain_id.clone(), app_id.clone(), Value::Object(payload))
        .await
        .map_err(|e| {
            warn!(chain_id = %chain_id, error = %e, "Submit request failed");
            ApiError::from_submit(&e)
        })?;

    let body = match outcome {
        SubmitOutcome::Executed(receipt) => json!({
            "success": true,
            "queued": false,
            "matchId": receipt.match_id,
            "chainId": receipt.chain_id,
            "appId": receipt.app_id,
            "opId": receipt.op_id,
            "verified": receipt.verified,
            "skipped": receipt.skipped,
        }),
        SubmitOutcome::Queued { job_id, message } => json!({
            "success": true,
            "queued": true,
            "matchId": match_id,
            "chainId": chain_id,
            "appId": app_id,
            "jobId": job_id,
            "message": message,
        }),
    };
    Ok(Json(body))
}

async fn start_tenant(State(state): State<SharedState>, Path(tenant): Path<String>) -> ApiResult {
    let sup = state
        .registry()
        .tenant(&tenant)
        .map_err(|e| ApiError::from_registry(&e))?;
    state.persist_tenant_ports();

    let pid = sup.start().await.map_err(|e| {
        error!(tenant = %tenant, error = %e, "Failed to start tenant");
        ApiError::internal(e.to_string())
    })?;
    Ok(Json(json!({
        "success": true,
        "tenant": tenant,
        "pid": pid,
        "port": sup.port(),
    })))
}

async fn stop_tenant(State(state): State<SharedState>, Path(tenant): Path<String>) -> ApiResult {
    let Some(sup) = state.registry().get_tenant(&tenant) else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("unknown tenant {tenant}"),
        ));
    };
    let pid = sup
        .stop()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "success": true, "tenant": tenant, "pid": pid })))
}

async fn tenant_health(State(state): State<SharedState>, Path(tenant): Path<String>) -> ApiResult {
    let Some(sup) = state.registry().get_tenant(&tenant) else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("unknown tenant {tenant}"),
        ));
    };
    let mut body = node_status(&sup).await;
    if let Value::Object(map) = &mut body {
        map.insert("tenant".to_string(), Value::String(tenant));
    }
    Ok(Json(body))
}

async fn metrics(State(state): State<SharedState>) -> Response {
    let Some(registry) = state.metrics() else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    let daemon_metrics = registry.daemon_metrics();
    for sup in state.registry().supervisors() {
        daemon_metrics.set_process_restarts(&sup.id().label(), sup.restarts());
    }
    if let Ok(backlog) = state.queue().backlog_len() {
        daemon_metrics.set_durable_backlog(backlog);
    }

    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}
