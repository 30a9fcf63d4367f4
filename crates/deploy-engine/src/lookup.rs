//! Orchestrator lookups shared by the engine services

use deckhand_common::{
    collect_all, Error, Orchestrator, Result, ServiceDescription, TaskDefinition, TaskDesiredStatus,
    TaskFilter,
};

/// The service, or `ServiceNotFound`
pub(crate) async fn service(
    orchestrator: &dyn Orchestrator,
    cluster: &str,
    service: &str,
) -> Result<ServiceDescription> {
    orchestrator
        .describe_service(cluster, service)
        .await?
        .ok_or_else(|| Error::service_not_found(cluster, service))
}

/// The task definition revision the service currently points at
pub(crate) async fn current_task_definition(
    orchestrator: &dyn Orchestrator,
    service: &ServiceDescription,
) -> Result<TaskDefinition> {
    let reference = service.task_definition.as_deref().ok_or_else(|| {
        Error::TaskDefinitionNotFound(format!("no task definition on service {}", service.service_name))
    })?;
    orchestrator.describe_task_definition(reference).await
}

/// Every task ARN of a service with the given desired status
pub(crate) async fn task_arns(
    orchestrator: &dyn Orchestrator,
    cluster: &str,
    service: Option<&str>,
    desired_status: TaskDesiredStatus,
) -> Result<Vec<String>> {
    let filter = TaskFilter {
        cluster: cluster.to_string(),
        service: service.map(str::to_string),
        desired_status: Some(desired_status),
    };
    collect_all(|token| orchestrator.list_tasks(&filter, token)).await
}

pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} is required", field)));
    }
    Ok(())
}
