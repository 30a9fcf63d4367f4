//! API request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use deckhand_common::{CredentialsRequest, Error, ServiceEvent, TaskDefinition};
use deploy_engine::{
    ClusterOverview, DeployRequest, DeploymentRecord, DesiredCountChange, HistoricalLogs,
    HistoricalLogsQuery, HistoryFilter, LiveDeploymentStatus, LogTarget, ServiceImageInfo,
    TaskDefinitionUpdate, TaskDetails,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::AppState;

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            e if e.is_invalid_input() => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            e if e.is_collaborator_failure() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Validate credentials carried by a request body, when present
fn check_credentials(credentials: &Option<CredentialsRequest>) -> Result<(), ApiError> {
    if let Some(credentials) = credentials {
        credentials.validate()?;
    }
    Ok(())
}

/// Outcome of a mutation that wrote a ledger record
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub success: bool,
    pub message: String,
    pub deployment_id: String,
    pub deployment: DeploymentRecord,
}

impl From<DeploymentRecord> for DeploymentResponse {
    fn from(record: DeploymentRecord) -> Self {
        Self {
            success: true,
            message: record.message.clone(),
            deployment_id: record.id.clone(),
            deployment: record,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeployBody {
    #[serde(flatten)]
    pub request: DeployRequest,

    #[serde(default)]
    pub credentials: Option<CredentialsRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceBody {
    pub cluster: String,
    pub service: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub credentials: Option<CredentialsRequest>,
}

#[derive(Debug, Deserialize)]
pub struct DesiredCountBody {
    pub cluster: String,
    pub service: String,
    pub desired_count: i64,

    #[serde(default)]
    pub credentials: Option<CredentialsRequest>,
}

#[derive(Debug, Deserialize)]
pub struct TaskDefinitionBody {
    #[serde(flatten)]
    pub update: TaskDefinitionUpdate,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub credentials: Option<CredentialsRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub credentials: Option<CredentialsRequest>,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub success: bool,
    pub message: String,
    pub deployment_id: String,
    pub rollback_to: String,
    pub original_deployment_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentsQuery {
    pub cluster: Option<String>,
    pub service: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<usize>,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "control-api"
    }))
}

pub async fn list_clusters_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<serde_json::Value> {
    let clusters = state.engine.inspector.list_clusters().await?;
    Ok(Json(json!({ "clusters": clusters })))
}

pub async fn cluster_overview_handler(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<String>,
) -> ApiResult<ClusterOverview> {
    Ok(Json(state.engine.inspector.cluster_overview(&cluster).await?))
}

pub async fn list_services_handler(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<String>,
) -> ApiResult<serde_json::Value> {
    let services = state.engine.inspector.list_services(&cluster).await?;
    Ok(Json(json!({ "cluster": cluster, "services": services })))
}

pub async fn list_tasks_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let tasks = state.engine.inspector.list_tasks(&cluster, &service).await?;
    Ok(Json(json!({ "count": tasks.len(), "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
pub struct TaskCountQuery {
    pub service: Option<String>,
}

pub async fn task_count_handler(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<String>,
    Query(query): Query<TaskCountQuery>,
) -> ApiResult<serde_json::Value> {
    let count = state
        .engine
        .inspector
        .task_count(&cluster, query.service.as_deref())
        .await?;
    Ok(Json(json!({ "cluster": cluster, "service": query.service, "count": count })))
}

pub async fn task_details_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<Vec<TaskDetails>> {
    Ok(Json(state.engine.inspector.task_details(&cluster, &service).await?))
}

pub async fn service_events_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<Vec<ServiceEvent>> {
    Ok(Json(state.engine.inspector.service_events(&cluster, &service).await?))
}

pub async fn image_info_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<ServiceImageInfo> {
    Ok(Json(state.engine.inspector.service_image_info(&cluster, &service).await?))
}

pub async fn deployment_status_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<LiveDeploymentStatus> {
    Ok(Json(state.engine.inspector.deployment_status(&cluster, &service).await?))
}

pub async fn task_definition_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<TaskDefinition> {
    Ok(Json(state.engine.deployments.task_definition(&cluster, &service).await?))
}

pub async fn log_target_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
) -> ApiResult<LogTarget> {
    Ok(Json(state.engine.logs.log_target(&cluster, &service).await?))
}

pub async fn historical_logs_handler(
    State(state): State<Arc<AppState>>,
    Path((cluster, service)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<HistoricalLogs> {
    let query = HistoricalLogsQuery {
        cluster,
        service,
        start_time: query.start_time,
        end_time: query.end_time,
        limit: query.limit.unwrap_or(deploy_engine::logs::DEFAULT_HISTORY_LIMIT),
    };
    Ok(Json(state.engine.logs.historical_logs(&query).await?))
}

/// Roll a service onto its newest image
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeployBody>,
) -> ApiResult<DeploymentResponse> {
    check_credentials(&body.credentials)?;
    info!(
        "Deploy requested for {}/{}",
        body.request.cluster, body.request.service
    );

    let record = state.engine.deployments.deploy_new_image(&body.request).await?;
    Ok(Json(record.into()))
}

pub async fn force_new_deployment_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ServiceBody>,
) -> ApiResult<DeploymentResponse> {
    check_credentials(&body.credentials)?;

    let record = state
        .engine
        .deployments
        .force_new_deployment(&body.cluster, &body.service, body.user)
        .await?;
    Ok(Json(record.into()))
}

pub async fn desired_count_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DesiredCountBody>,
) -> ApiResult<DesiredCountChange> {
    check_credentials(&body.credentials)?;

    let change = state
        .engine
        .deployments
        .update_desired_count(&body.cluster, &body.service, body.desired_count)
        .await?;
    Ok(Json(change))
}

pub async fn update_task_definition_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TaskDefinitionBody>,
) -> ApiResult<DeploymentResponse> {
    check_credentials(&body.credentials)?;

    let record = state
        .engine
        .deployments
        .update_task_definition(&body.update, body.user)
        .await?;
    Ok(Json(record.into()))
}

/// Deployment history, newest first, with pending records reconciled
pub async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeploymentsQuery>,
) -> ApiResult<serde_json::Value> {
    let filter = HistoryFilter {
        cluster: query.cluster,
        service: query.service,
    };
    let limit = query.limit.unwrap_or(state.history_default_limit);

    let deployments = state.engine.deployments.history(&filter, limit).await;
    Ok(Json(json!({
        "total": deployments.len(),
        "deployments": deployments,
    })))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeploymentRecord> {
    Ok(Json(state.engine.deployments.get(&id)?))
}

pub async fn refresh_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeploymentRecord> {
    Ok(Json(state.engine.deployments.refresh(&id).await?))
}

pub async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<RollbackResponse> {
    check_credentials(&body.credentials)?;

    let outcome = state.engine.deployments.rollback(&id, body.user).await?;
    Ok(Json(RollbackResponse {
        success: true,
        message: outcome.record.message.clone(),
        deployment_id: outcome.record.id,
        rollback_to: outcome.rollback_to,
        original_deployment_id: outcome.original_deployment_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let status = |err: Error| ApiError::from(err).status;

        assert_eq!(status(Error::InvalidDesiredCount(-1)), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(Error::InvalidCredentials("missing".to_string())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(Error::service_not_found("prod", "api")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(Error::NoPreviousRevision {
                family: "api".to_string(),
                active: 1
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(Error::Timeout("insights".to_string())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(Error::Other(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
