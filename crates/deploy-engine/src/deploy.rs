//! Orchestration use cases
//!
//! Every mutation follows the same shape: read current state, ask the
//! orchestrator to change it, and append a ledger record only once the
//! orchestrator has accepted the change. A failed mutation leaves no record.

use deckhand_common::{
    Error, Orchestrator, Registry, Result, ServiceUpdate, TaskDefinition, TaskDefinitionSpec,
    TaskDesiredStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::freshness;
use crate::image::ImageReference;
use crate::ledger::{DeploymentLedger, DeploymentRecord, DeploymentType, HistoryFilter, NewDeployment};
use crate::lookup;
use crate::reconciler::Reconciler;
use crate::task_definition::{apply_update, TaskDefinitionUpdate};

/// How a floating-tag service is restarted to re-pull its image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Ask the orchestrator for a fresh rollout of the current revision
    #[default]
    ForceNewDeployment,
    /// Stop running tasks and let the scheduler replace them
    StopTasks,
}

/// Request to move a service onto its newest image
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    pub cluster: String,
    pub service: String,

    /// Only rewrite this container; all containers when absent
    #[serde(default)]
    pub container_name: Option<String>,

    #[serde(default)]
    pub restart_strategy: RestartStrategy,

    #[serde(default)]
    pub user: Option<String>,
}

/// Result of a rollback
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub record: DeploymentRecord,
    pub rollback_to: String,
    pub original_deployment_id: String,
}

/// Result of a desired-count change
#[derive(Debug, Clone, Serialize)]
pub struct DesiredCountChange {
    pub cluster: String,
    pub service: String,
    pub previous_count: u32,
    pub new_count: u32,
    pub service_arn: String,
    pub message: String,
}

/// Deployment use cases over the orchestrator, the registry and the ledger
#[derive(Clone)]
pub struct DeploymentService {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn Registry>,
    ledger: Arc<DeploymentLedger>,
    reconciler: Reconciler,
    config: EngineConfig,
}

impl DeploymentService {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn Registry>,
        ledger: Arc<DeploymentLedger>,
        config: EngineConfig,
    ) -> Self {
        let reconciler = Reconciler::new(ledger.clone(), orchestrator.clone());
        Self {
            orchestrator,
            registry,
            ledger,
            reconciler,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<DeploymentLedger> {
        &self.ledger
    }

    /// Roll the service onto the newest image.
    ///
    /// A floating tag on any container restarts tasks on the current revision.
    /// Otherwise a new revision is registered with the newest versioned tag of
    /// each eligible container and the service is pointed at it.
    pub async fn deploy_new_image(&self, request: &DeployRequest) -> Result<DeploymentRecord> {
        lookup::require("cluster", &request.cluster)?;
        lookup::require("service", &request.service)?;

        let service =
            lookup::service(self.orchestrator.as_ref(), &request.cluster, &request.service).await?;
        let definition =
            lookup::current_task_definition(self.orchestrator.as_ref(), &service).await?;

        if let Some(name) = &request.container_name {
            if !definition.container_definitions.iter().any(|c| &c.name == name) {
                return Err(Error::InvalidInput(format!(
                    "Container {} not found in task definition {}",
                    name, definition.family
                )));
            }
        }

        let uses_floating_tag = definition
            .container_definitions
            .iter()
            .filter_map(|c| ImageReference::parse(&c.image))
            .any(|r| r.is_floating());

        if uses_floating_tag {
            return self.restart_floating(request, &service.service_arn).await;
        }

        let (spec, changes) = self.rewrite_images(&definition, request).await;
        let registered = self.orchestrator.register_task_definition(spec).await?;
        let updated = self
            .orchestrator
            .update_service(
                &request.cluster,
                &request.service,
                ServiceUpdate::task_definition(registered.task_definition_arn.clone()),
            )
            .await?;

        info!(
            "Deploying {} to {}/{} ({} image change(s))",
            registered.task_definition_arn,
            request.cluster,
            request.service,
            changes.len()
        );

        let mut entry = NewDeployment::new(
            &request.cluster,
            &request.service,
            DeploymentType::VersionedTagUpdate,
        );
        entry.message = "Deployment started successfully".to_string();
        entry.service_arn = Some(updated.service_arn);
        entry.new_task_definition = Some(registered.task_definition_arn);
        entry.user = request.user.clone();
        if !changes.is_empty() {
            entry.changes = Some(json!({ "images": changes }));
        }

        Ok(self.ledger.insert(entry))
    }

    async fn restart_floating(
        &self,
        request: &DeployRequest,
        service_arn: &str,
    ) -> Result<DeploymentRecord> {
        let mut entry = NewDeployment::new(
            &request.cluster,
            &request.service,
            DeploymentType::LatestTagRestart,
        );
        entry.user = request.user.clone();

        match request.restart_strategy {
            RestartStrategy::ForceNewDeployment => {
                let updated = self
                    .orchestrator
                    .update_service(
                        &request.cluster,
                        &request.service,
                        ServiceUpdate::force_new_deployment(),
                    )
                    .await?;
                entry.message = "Force new deployment started - the orchestrator will pull the latest image and start new tasks".to_string();
                entry.service_arn = Some(updated.service_arn);
            }
            RestartStrategy::StopTasks => {
                let running = lookup::task_arns(
                    self.orchestrator.as_ref(),
                    &request.cluster,
                    Some(&request.service),
                    TaskDesiredStatus::Running,
                )
                .await?;

                let mut stopped = 0u32;
                let mut failures = Vec::new();
                for task_arn in &running {
                    match self
                        .orchestrator
                        .stop_task(
                            &request.cluster,
                            task_arn,
                            Some("Restarting to pull the latest image"),
                        )
                        .await
                    {
                        Ok(()) => stopped += 1,
                        Err(e) => {
                            warn!("Failed to stop task {}: {}", task_arn, e);
                            failures.push((task_arn.clone(), e));
                        }
                    }
                }

                // Nothing changed, so there is nothing to record.
                if stopped == 0 && !failures.is_empty() {
                    return Err(failures.swap_remove(0).1);
                }

                entry.message = if running.is_empty() {
                    "No running tasks to restart".to_string()
                } else if failures.is_empty() {
                    format!("Stopped {} running task(s) to pull the latest image", stopped)
                } else {
                    format!(
                        "Stopped {} of {} running task(s) to pull the latest image; {} failed",
                        stopped,
                        running.len(),
                        failures.len()
                    )
                };
                if !failures.is_empty() {
                    let failed: Vec<_> = failures
                        .iter()
                        .map(|(task_arn, e)| json!({ "task_arn": task_arn, "error": e.to_string() }))
                        .collect();
                    entry.changes = Some(json!({ "failed_tasks": failed }));
                }
                entry.stopped_task_count = stopped;
                entry.service_arn = Some(service_arn.to_string());
            }
        }

        info!(
            "Restarting {}/{} to re-pull floating tags ({:?})",
            request.cluster, request.service, request.restart_strategy
        );
        Ok(self.ledger.insert(entry))
    }

    /// Copy of `definition` with eligible container images moved to their newest tag
    async fn rewrite_images(
        &self,
        definition: &TaskDefinition,
        request: &DeployRequest,
    ) -> (TaskDefinitionSpec, Vec<serde_json::Value>) {
        let mut spec = TaskDefinitionSpec::from_definition(definition);
        let mut changes = Vec::new();

        for container in spec.container_definitions.iter_mut() {
            if let Some(only) = &request.container_name {
                if &container.name != only {
                    continue;
                }
            }

            let Some(current) = ImageReference::parse(&container.image) else {
                debug!("Container {} does not use a managed image", container.name);
                continue;
            };

            match freshness::check(self.registry.as_ref(), &current, None).await {
                Ok(result) if result.has_update => {
                    let latest = result.latest_reference.uri();
                    changes.push(json!({
                        "container": container.name,
                        "from": container.image,
                        "to": latest,
                    }));
                    container.image = latest;
                }
                Ok(_) => debug!("Container {} already runs {}", container.name, current),
                Err(e) => warn!(
                    "Could not resolve newest image for container {}: {}",
                    container.name, e
                ),
            }
        }

        (spec, changes)
    }

    /// Restart every task of the service on its current revision
    pub async fn force_new_deployment(
        &self,
        cluster: &str,
        service: &str,
        user: Option<String>,
    ) -> Result<DeploymentRecord> {
        lookup::require("cluster", cluster)?;
        lookup::require("service", service)?;
        lookup::service(self.orchestrator.as_ref(), cluster, service).await?;

        let updated = self
            .orchestrator
            .update_service(cluster, service, ServiceUpdate::force_new_deployment())
            .await?;

        info!("Forced new deployment of {}/{}", cluster, service);

        let mut entry = NewDeployment::new(cluster, service, DeploymentType::ForceNewDeployment);
        entry.message = "Force new deployment started - the orchestrator will start new tasks with the current task definition".to_string();
        entry.service_arn = Some(updated.service_arn);
        entry.user = user;
        Ok(self.ledger.insert(entry))
    }

    /// Point the service of record `deployment_id` at the second most recent
    /// active revision of its task definition family
    pub async fn rollback(
        &self,
        deployment_id: &str,
        user: Option<String>,
    ) -> Result<RollbackOutcome> {
        let target = self
            .ledger
            .find(deployment_id)
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))?;
        if target.cluster.is_empty() || target.service.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Deployment {} does not name a service",
                deployment_id
            )));
        }

        let service =
            lookup::service(self.orchestrator.as_ref(), &target.cluster, &target.service).await?;
        let definition =
            lookup::current_task_definition(self.orchestrator.as_ref(), &service).await?;

        let revisions = self
            .orchestrator
            .list_task_definition_revisions(&definition.family)
            .await?;
        let rollback_to = match revisions.get(1) {
            Some(arn) => arn.clone(),
            None => {
                return Err(Error::NoPreviousRevision {
                    family: definition.family,
                    active: revisions.len(),
                })
            }
        };

        let updated = self
            .orchestrator
            .update_service(
                &target.cluster,
                &target.service,
                ServiceUpdate::task_definition(rollback_to.clone()),
            )
            .await?;

        info!(
            "Rolling back {}/{} to {} (from deployment {})",
            target.cluster, target.service, rollback_to, deployment_id
        );

        let mut entry = NewDeployment::new(&target.cluster, &target.service, DeploymentType::Rollback);
        entry.message = format!("Rollback to deployment {}", deployment_id);
        entry.service_arn = Some(updated.service_arn);
        entry.new_task_definition = Some(rollback_to.clone());
        entry.original_deployment_id = Some(deployment_id.to_string());
        entry.user = user;

        Ok(RollbackOutcome {
            record: self.ledger.insert(entry),
            rollback_to,
            original_deployment_id: deployment_id.to_string(),
        })
    }

    /// Register a revision with `update` applied and deploy it
    pub async fn update_task_definition(
        &self,
        update: &TaskDefinitionUpdate,
        user: Option<String>,
    ) -> Result<DeploymentRecord> {
        lookup::require("cluster", &update.cluster)?;
        lookup::require("service", &update.service)?;

        let service =
            lookup::service(self.orchestrator.as_ref(), &update.cluster, &update.service).await?;
        let definition =
            lookup::current_task_definition(self.orchestrator.as_ref(), &service).await?;

        let spec = apply_update(&definition, update);
        let changes = serde_json::to_value(update)?;

        let registered = self.orchestrator.register_task_definition(spec).await?;
        let updated = self
            .orchestrator
            .update_service(
                &update.cluster,
                &update.service,
                ServiceUpdate::task_definition(registered.task_definition_arn.clone()),
            )
            .await?;

        info!(
            "Updated task definition of {}/{} to {}",
            update.cluster, update.service, registered.task_definition_arn
        );

        let mut entry = NewDeployment::new(
            &update.cluster,
            &update.service,
            DeploymentType::TaskDefinitionUpdate,
        );
        entry.message = "Task definition updated successfully".to_string();
        entry.service_arn = Some(updated.service_arn);
        entry.new_task_definition = Some(registered.task_definition_arn);
        entry.changes = Some(changes);
        entry.user = user;
        Ok(self.ledger.insert(entry))
    }

    /// Change the number of tasks the service keeps running; writes no ledger record
    pub async fn update_desired_count(
        &self,
        cluster: &str,
        service: &str,
        desired_count: i64,
    ) -> Result<DesiredCountChange> {
        let new_count =
            u32::try_from(desired_count).map_err(|_| Error::InvalidDesiredCount(desired_count))?;
        lookup::require("cluster", cluster)?;
        lookup::require("service", service)?;

        let current = lookup::service(self.orchestrator.as_ref(), cluster, service).await?;
        let updated = self
            .orchestrator
            .update_service(cluster, service, ServiceUpdate::desired_count(new_count))
            .await?;

        info!(
            "Desired count of {}/{}: {} -> {}",
            cluster, service, current.desired_count, new_count
        );

        Ok(DesiredCountChange {
            cluster: cluster.to_string(),
            service: service.to_string(),
            previous_count: current.desired_count,
            new_count,
            service_arn: updated.service_arn,
            message: format!(
                "Service desired count updated from {} to {}",
                current.desired_count, new_count
            ),
        })
    }

    /// Reconcile pending records matching `filter`, then list at most `limit` of them
    pub async fn history(&self, filter: &HistoryFilter, limit: usize) -> Vec<DeploymentRecord> {
        self.reconciler
            .reconcile_pending(filter, self.config.refresh_batch_limit)
            .await;
        self.ledger.list(filter, limit)
    }

    /// Reconcile a single record and return it
    pub async fn refresh(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        match self.reconciler.reconcile(deployment_id).await {
            Some(record) => Ok(record),
            None => self.get(deployment_id),
        }
    }

    pub fn get(&self, deployment_id: &str) -> Result<DeploymentRecord> {
        self.ledger
            .find(deployment_id)
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Current task definition of a service
    pub async fn task_definition(&self, cluster: &str, service: &str) -> Result<TaskDefinition> {
        let service = lookup::service(self.orchestrator.as_ref(), cluster, service).await?;
        lookup::current_task_definition(self.orchestrator.as_ref(), &service).await
    }
}
