//! Integration tests for the manager API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fleet_manager::api::{create_router, AppState};
use manager_lib::{
    clock::ManualClock,
    health::components,
    scheduler::SchedulerConfig,
    Manager, ManagerConfig, RecordingCommander,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_with(config: ManagerConfig) -> (Router, Arc<Manager>) {
    let manager = Arc::new(
        Manager::builder()
            .config(config)
            .commander(Arc::new(RecordingCommander::new()))
            .clock(Arc::new(ManualClock::new(1_000_000)))
            .build(),
    );
    let router = create_router(Arc::new(AppState::new(manager.clone())));
    (router, manager)
}

async fn setup_test_app() -> (Router, Arc<Manager>) {
    setup_with(ManagerConfig::default()).await
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_healthz_lists_components() {
    let (app, manager) = setup_test_app().await;
    manager.mark_ready().await;

    let (status, health) = send(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["scheduler"].is_object());
    assert!(health["components"]["store"].is_object());
    // No desired-state source configured
    assert!(health["components"]["desired_monitor"].is_null());
}

#[tokio::test]
async fn test_readyz_returns_503_until_marked_ready() {
    let (app, manager) = setup_test_app().await;

    let (status, readiness) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    manager.mark_ready().await;
    let (status, readiness) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_store_unhealthy() {
    let (app, manager) = setup_test_app().await;
    manager.mark_ready().await;
    manager
        .health()
        .set_unhealthy(components::STORE, "store unavailable")
        .await;

    let (status, readiness) = send(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Unhealthy components: store");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, manager) = setup_test_app().await;
    manager.metrics().observe_scheduling_latency(0.002);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("fleet_manager_scheduling_latency_seconds_bucket"));
    assert!(metrics_text.contains("fleet_manager_queue_depth"));
    assert!(metrics_text.contains("fleet_manager_agents"));
}

#[tokio::test]
async fn test_register_and_list_agents() {
    let (app, _manager) = setup_test_app().await;

    let (status, agent) = send(
        &app,
        "POST",
        "/api/v1/agents",
        Some(json!({"agent_id": "a1", "agent_ip": "10.0.0.1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(agent["agent_id"], "a1");
    assert_eq!(agent["last_timestamp"], 1_000_000);

    let (status, agents) = send(&app, "GET", "/api/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agents.as_array().unwrap().len(), 1);
    assert_eq!(agents[0]["agent_ip"], "10.0.0.1");
}

#[tokio::test]
async fn test_register_without_id_is_bad_request() {
    let (app, _manager) = setup_test_app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/agents",
        Some(json!({"agent_id": "", "agent_ip": "10.0.0.1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("agent_id"));
}

#[tokio::test]
async fn test_report_then_query_runtimes_and_peaks() {
    let (app, _manager) = setup_test_app().await;

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/v1/agents/a1/report",
        Some(json!({
            "agent_ip": "10.0.0.1",
            "running_instances": [{"instance_id": "p1", "version": "1"}],
            "instance_metrics": {"p1/1": {"cpu": 0.5, "memory": 64.0, "observed_at": 42}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["accepted"], true);
    assert_eq!(outcome["adopted"], 1);

    let (status, runtimes) = send(&app, "GET", "/api/v1/runtimes?status=running&agent=a1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runtimes.as_array().unwrap().len(), 1);
    assert_eq!(runtimes[0]["instance_id"], "p1");

    let (_, runtimes) = send(&app, "GET", "/api/v1/runtimes?agent=a2", None).await;
    assert!(runtimes.as_array().unwrap().is_empty());

    let (status, peaks) = send(&app, "GET", "/api/v1/metrics/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(peaks[0]["instance_id"], "p1");
    assert_eq!(peaks[0]["memory"], 64.0);
    assert_eq!(peaks[0]["memory_time"], 42);
}

#[tokio::test]
async fn test_unknown_status_filter_is_rejected() {
    let (app, _manager) = setup_test_app().await;

    let (status, _) = send(&app, "GET", "/api/v1/runtimes?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unregister_cascades_and_blocks_reports() {
    let (app, manager) = setup_test_app().await;
    let report = json!({
        "agent_ip": "10.0.0.1",
        "running_instances": [{"instance_id": "p1", "version": "1"}]
    });
    send(&app, "POST", "/api/v1/agents/a1/report", Some(report.clone())).await;

    let (status, removed) = send(&app, "DELETE", "/api/v1/agents/a1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["agent_id"], "a1");
    assert!(manager.list_runtimes().await.unwrap().is_empty());

    let (status, _) = send(&app, "DELETE", "/api/v1/agents/a1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, outcome) = send(&app, "POST", "/api/v1/agents/a1/report", Some(report)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["accepted"], false);
    assert!(manager.list_runtimes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_push_task() {
    let (app, manager) = setup_test_app().await;

    let (status, task) = send(
        &app,
        "POST",
        "/api/v1/tasks",
        Some(json!({"instance_id": "p1", "version": "1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(task["action"], "start");
    assert_eq!(task["retry_count"], 0);
    assert_eq!(manager.queue_depth(), 1);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/tasks",
        Some(json!({"instance_id": "p1", "version": "", "action": "stop"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_push_task_on_full_queue_is_unavailable() {
    let (app, _manager) = setup_with(ManagerConfig {
        scheduler: SchedulerConfig {
            queue_capacity: 1,
            push_timeout: Duration::from_millis(10),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let task = json!({"instance_id": "p1", "version": "1"});

    let (status, _) = send(&app, "POST", "/api/v1/tasks", Some(task.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = send(&app, "POST", "/api/v1/tasks", Some(task)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "task queue is full");
}
