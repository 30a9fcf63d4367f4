//! Integration tests for the control API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use control_api::{create_router, AppState};
use deploy_engine::mock::demo_environment;
use deploy_engine::{Engine, EngineConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

/// Helper to create a test app over the demo cluster
async fn create_test_app() -> Router {
    let demo = demo_environment().await;
    let engine = Engine::new(
        Arc::new(demo.orchestrator),
        Arc::new(demo.registry),
        Arc::new(demo.log_store),
        EngineConfig::default(),
    );
    create_router(AppState::new(engine, 50))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    read(response).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app().await;
    let (status, json) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "control-api");
}

#[tokio::test]
async fn test_list_clusters_and_services() {
    let app = create_test_app().await;

    let (status, json) = get(&app, "/api/clusters").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["clusters"], json!(["demo"]));

    let (status, json) = get(&app, "/api/clusters/demo/services").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["services"], json!(["web", "worker"]));
}

#[tokio::test]
async fn test_cluster_overview() {
    let app = create_test_app().await;
    let (status, json) = get(&app, "/api/clusters/demo/overview").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["summary"]["total"], 2);
    assert_eq!(json["summary"]["updates_available"], 2);
    assert_eq!(json["services"][0]["status"], "UPDATES_AVAILABLE");
}

#[tokio::test]
async fn test_task_count_route() {
    let app = create_test_app().await;

    let (status, json) = get(&app, "/api/clusters/demo/task-count").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 3);
    assert_eq!(json["service"], Value::Null);

    let (status, json) = get(&app, "/api/clusters/demo/task-count?service=web").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    assert_eq!(json["service"], "web");
}

#[tokio::test]
async fn test_service_views() {
    let app = create_test_app().await;

    let (status, json) = get(&app, "/api/clusters/demo/services/web/tasks").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);

    let (status, json) = get(&app, "/api/clusters/demo/services/web/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "COMPLETED");

    let (status, json) = get(&app, "/api/clusters/demo/services/web/image-info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["has_any_updates"], true);

    let (status, json) = get(&app, "/api/clusters/demo/services/worker/task-details").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["service_uses_latest_tag"], true);
    assert_eq!(json[0]["images"][0]["is_latest"], false);
}

#[tokio::test]
async fn test_unknown_service_is_not_found() {
    let app = create_test_app().await;
    let (status, json) = get(&app, "/api/clusters/demo/services/nope/status").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("Service not found"));
}

#[tokio::test]
async fn test_historical_logs_fall_back_to_streams() {
    let app = create_test_app().await;
    let (status, json) = get(&app, "/api/clusters/demo/services/web/logs?limit=5").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["method"], "log_streams");
    assert_eq!(json["total"], 5);
    assert_eq!(json["log_group"], "/ecs/demo/web");
}

#[tokio::test]
async fn test_historical_logs_rejects_bad_timestamp() {
    let app = create_test_app().await;
    let (status, _) = get(
        &app,
        "/api/clusters/demo/services/web/logs?start_time=yesterday",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deploy_then_rollback() {
    let app = create_test_app().await;

    let (status, json) = post(
        &app,
        "/api/deploy",
        json!({ "cluster": "demo", "service": "web", "user": "alice" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["deployment"]["deployment_type"], "versioned_tag_update");
    assert_eq!(json["deployment"]["status"], "IN_PROGRESS");
    let deployment_id = json["deployment_id"].as_str().unwrap().to_string();

    let (status, json) = get(&app, "/api/deployments?cluster=demo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);

    let (status, json) = post(
        &app,
        &format!("/api/deployments/{}/rollback", deployment_id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["original_deployment_id"], deployment_id.as_str());
    assert!(json["deployment_id"].as_str().unwrap().starts_with("rollback-"));
    assert!(json["rollback_to"].as_str().unwrap().ends_with("web:1"));
}

#[tokio::test]
async fn test_rollback_without_previous_revision() {
    let app = create_test_app().await;

    let (_, json) = post(
        &app,
        "/api/services/force-new-deployment",
        json!({ "cluster": "demo", "service": "web" }),
    )
    .await;
    let deployment_id = json["deployment_id"].as_str().unwrap().to_string();

    let (status, json) = post(
        &app,
        &format!("/api/deployments/{}/rollback", deployment_id),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("No previous version"));
}

#[tokio::test]
async fn test_negative_desired_count() {
    let app = create_test_app().await;
    let (status, _) = post(
        &app,
        "/api/services/desired-count",
        json!({ "cluster": "demo", "service": "web", "desired_count": -1 }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_credentials_are_rejected() {
    let app = create_test_app().await;
    let (status, json) = post(
        &app,
        "/api/deploy",
        json!({
            "cluster": "demo",
            "service": "web",
            "credentials": {
                "aws_access_key_id": "ASIAEXAMPLE",
                "aws_secret_access_key": "secret"
            }
        }),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].as_str().unwrap().contains("Session token"));

    let (_, json) = get(&app, "/api/deployments").await;
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn test_task_definition_update() {
    let app = create_test_app().await;
    let (status, json) = post(
        &app,
        "/api/task-definitions/update",
        json!({
            "cluster": "demo",
            "service": "web",
            "memory": "1024",
            "container_updates": [
                { "container_name": "web", "environment_variables": { "MODE": "blue" } }
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["deployment_id"].as_str().unwrap().starts_with("td-update-"));
    assert_eq!(json["deployment"]["changes"]["memory"], "1024");

    let (_, json) = get(&app, "/api/clusters/demo/services/web/task-definition").await;
    assert_eq!(json["memory"], "1024");
}

#[tokio::test]
async fn test_unknown_deployment() {
    let app = create_test_app().await;
    let (status, _) = get(&app, "/api/deployments/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
