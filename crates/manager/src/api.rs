//! HTTP API: health checks, Prometheus metrics and the manager operations

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use manager_lib::{
    health::ComponentStatus, AgentMetric, InstanceKey, InstanceSample, Manager, ManagerError,
    PluginMetric, RuntimeStatus, ScheduleTask, TaskAction,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

/// Error body returned by every failing API call
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Manager error mapped onto an HTTP status
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match &err {
            ManagerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ManagerError::QueueFull | ManagerError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub agent_ip: String,
}

/// Report body; the agent id comes from the path
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReportRequest {
    pub agent_ip: String,
    #[serde(default)]
    pub running_instances: Vec<InstanceKey>,
    #[serde(default)]
    pub metric: AgentMetric,
    #[serde(default)]
    pub instance_metrics: HashMap<String, InstanceSample>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub instance_id: String,
    pub version: String,
    #[serde(default = "default_action")]
    pub action: TaskAction,
}

fn default_action() -> TaskAction {
    TaskAction::Start
}

#[derive(Debug, Default, Deserialize)]
pub struct RuntimeFilter {
    pub status: Option<RuntimeStatus>,
    pub agent: Option<String>,
}

/// Peak usage of one instance
#[derive(Debug, Serialize, Deserialize)]
pub struct InstancePeak {
    #[serde(flatten)]
    pub key: InstanceKey,
    #[serde(flatten)]
    pub metric: PluginMetric,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.manager.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 503 while the store is unreachable
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.manager.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    state
        .manager
        .metrics()
        .set_queue_depth(state.manager.queue_depth());

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let agent = state
        .manager
        .register_agent(&req.agent_id, &req.agent_ip)
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.list_agents().await?))
}

async fn unregister_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match state.manager.unregister_agent(&agent_id).await? {
        Some(agent) => Ok(Json(agent)),
        None => Err(ApiError::not_found(format!("agent {} not found", agent_id))),
    }
}

async fn report(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .manager
        .report(manager_lib::AgentReport {
            agent_id,
            agent_ip: req.agent_ip,
            running_instances: req.running_instances,
            metric: req.metric,
            instance_metrics: req.instance_metrics,
        })
        .await?;
    Ok(Json(outcome))
}

async fn list_runtimes(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RuntimeFilter>,
) -> ApiResult<impl IntoResponse> {
    let runtimes: Vec<_> = state
        .manager
        .list_runtimes()
        .await?
        .into_iter()
        .filter(|r| filter.status.map_or(true, |s| r.status == s))
        .filter(|r| filter.agent.as_deref().map_or(true, |a| r.agent_id == a))
        .collect();
    Ok(Json(runtimes))
}

async fn instance_peaks(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let peaks: Vec<InstancePeak> = state
        .manager
        .instance_metrics()
        .await?
        .into_iter()
        .map(|(key, metric)| InstancePeak { key, metric })
        .collect();
    Ok(Json(peaks))
}

async fn push_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = InstanceKey::new(req.instance_id, req.version);
    let task = match req.action {
        TaskAction::Start => ScheduleTask::start(&key),
        TaskAction::Stop => ScheduleTask::stop(&key),
    };
    state.manager.push_task(task.clone()).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/agents", post(register_agent).get(list_agents))
        .route("/api/v1/agents/:agent_id", delete(unregister_agent))
        .route("/api/v1/agents/:agent_id/report", post(report))
        .route("/api/v1/runtimes", get(list_runtimes))
        .route("/api/v1/metrics/instances", get(instance_peaks))
        .route("/api/v1/tasks", post(push_task))
        .with_state(state)
}

/// Start the API server; returns once `shutdown` fires
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
