//! Deckhand control API
//!
//! Thin HTTP and WebSocket transport over the deployment engine.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/clusters` - List clusters
//! - `GET /api/clusters/{cluster}/overview` - Freshness of every service
//! - `GET /api/clusters/{cluster}/services/{service}/...` - Service views and logs
//! - `POST /api/deploy` - Roll a service onto its newest image
//! - `POST /api/services/force-new-deployment` - Restart on the current revision
//! - `POST /api/services/desired-count` - Scale a service
//! - `POST /api/task-definitions/update` - Register and deploy a changed revision
//! - `GET /api/deployments` - Deployment history, reconciled
//! - `POST /api/deployments/{id}/rollback` - Roll back to the previous revision
//! - `GET /ws/logs` - Live log tail

pub mod config;
pub mod handlers;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use deploy_engine::Engine;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use config::Config;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,

    /// Records returned by a history listing without `limit`
    pub history_default_limit: usize,
}

impl AppState {
    pub fn new(engine: Engine, history_default_limit: usize) -> Self {
        Self {
            engine,
            history_default_limit,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);
    let service_routes = "/api/clusters/{cluster}/services/{service}";

    Router::new()
        .route("/health", get(handlers::health_handler))
        // Cluster and service views
        .route("/api/clusters", get(handlers::list_clusters_handler))
        .route(
            "/api/clusters/{cluster}/overview",
            get(handlers::cluster_overview_handler),
        )
        .route(
            "/api/clusters/{cluster}/services",
            get(handlers::list_services_handler),
        )
        .route(
            "/api/clusters/{cluster}/task-count",
            get(handlers::task_count_handler),
        )
        .route(
            &format!("{}/tasks", service_routes),
            get(handlers::list_tasks_handler),
        )
        .route(
            &format!("{}/task-details", service_routes),
            get(handlers::task_details_handler),
        )
        .route(
            &format!("{}/events", service_routes),
            get(handlers::service_events_handler),
        )
        .route(
            &format!("{}/image-info", service_routes),
            get(handlers::image_info_handler),
        )
        .route(
            &format!("{}/status", service_routes),
            get(handlers::deployment_status_handler),
        )
        .route(
            &format!("{}/task-definition", service_routes),
            get(handlers::task_definition_handler),
        )
        .route(
            &format!("{}/log-target", service_routes),
            get(handlers::log_target_handler),
        )
        .route(
            &format!("{}/logs", service_routes),
            get(handlers::historical_logs_handler),
        )
        // Mutations
        .route("/api/deploy", post(handlers::deploy_handler))
        .route(
            "/api/services/force-new-deployment",
            post(handlers::force_new_deployment_handler),
        )
        .route(
            "/api/services/desired-count",
            post(handlers::desired_count_handler),
        )
        .route(
            "/api/task-definitions/update",
            post(handlers::update_task_definition_handler),
        )
        // Deployment ledger
        .route("/api/deployments", get(handlers::list_deployments_handler))
        .route("/api/deployments/{id}", get(handlers::get_deployment_handler))
        .route(
            "/api/deployments/{id}/refresh",
            post(handlers::refresh_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/rollback",
            post(handlers::rollback_handler),
        )
        // Live logs
        .route("/ws/logs", get(ws::logs_ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
