//! Read-only views over clusters, services and tasks

use deckhand_common::{
    arn_name, collect_all, ContainerDefinition, Orchestrator, Registry, RepositoryImage, Result,
    ServiceEvent, TaskDefinition, TaskDescription, TaskDesiredStatus, TaskFilter,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::freshness::{self, FreshnessResult};
use crate::image::{tag_of, ImageReference};
use crate::ledger::DeploymentStatus;
use crate::lookup;

/// Stopped tasks reported when a service runs nothing
const STOPPED_TASKS_REPORTED: usize = 2;

/// Live counts of a service with an inferred rollout status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveDeploymentStatus {
    pub status: DeploymentStatus,
    pub desired_count: u32,
    pub running_count: u32,
    pub pending_count: u32,
}

impl LiveDeploymentStatus {
    fn from_counts(desired_count: u32, running_count: u32, pending_count: u32) -> Self {
        let status = if running_count < desired_count || pending_count > 0 {
            DeploymentStatus::InProgress
        } else if running_count == 0 {
            DeploymentStatus::Pending
        } else {
            DeploymentStatus::Completed
        };
        Self {
            status,
            desired_count,
            running_count,
            pending_count,
        }
    }
}

/// Freshness of one container image of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerImageInfo {
    pub container_name: String,
    pub current_image: String,
    pub latest_image: String,
    pub has_updates: bool,
    pub uses_latest_tag: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceImageInfo {
    pub service: String,
    pub cluster: String,
    pub task_definition_arn: String,
    pub container_image_info: Vec<ContainerImageInfo>,
    pub has_any_updates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    Stopped,
}

/// An image inside a task, with its freshness
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskImage {
    pub container_name: String,

    /// Image the container runs, pinned to its digest when known
    pub uri: String,

    /// Image named by the task definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_definition_uri: Option<String>,

    pub latest_tag: Option<String>,
    pub latest_image_uri: Option<String>,
    pub is_latest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDetails {
    pub task_id: String,
    pub task_arn: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,

    /// `family:revision`
    pub task_definition: String,
    pub images: Vec<TaskImage>,
    pub status: TaskState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_uses_latest_tag: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceHealth {
    NoTasks,
    UpdatesAvailable,
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOverview {
    pub service_name: String,
    pub status: ServiceHealth,
    pub running_count: u32,
    pub desired_count: u32,
    pub current_image_uri: Option<String>,
    pub latest_image_uri: Option<String>,
    pub task_definition: Option<String>,
    pub has_updates: bool,
    pub uses_latest_tag: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverviewSummary {
    pub total: usize,
    pub no_tasks: usize,
    pub updates_available: usize,
    pub up_to_date: usize,
    pub latest_tag_services: usize,
    pub latest_tag_updates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterOverview {
    pub services: Vec<ServiceOverview>,
    pub summary: OverviewSummary,
}

/// Repository listings memoized for the duration of one view
struct RegistryCache<'a> {
    registry: &'a dyn Registry,
    repositories: HashMap<(String, String), Vec<RepositoryImage>>,
}

impl<'a> RegistryCache<'a> {
    fn new(registry: &'a dyn Registry) -> Self {
        Self {
            registry,
            repositories: HashMap::new(),
        }
    }

    async fn freshness(
        &mut self,
        reference: &ImageReference,
        observed_digest: Option<&str>,
    ) -> Result<FreshnessResult> {
        let key = (reference.region.clone(), reference.repository.clone());
        if !self.repositories.contains_key(&key) {
            let images = self
                .registry
                .list_tagged_images(&reference.region, &reference.repository)
                .await?;
            self.repositories.insert(key.clone(), images);
        }

        let images = self.repositories.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        Ok(freshness::resolve(reference, images, observed_digest))
    }
}

fn uses_floating_tag(definition: &TaskDefinition) -> bool {
    definition
        .container_definitions
        .iter()
        .filter_map(|c| ImageReference::parse(&c.image))
        .any(|r| r.is_floating())
}

fn revision_label(definition: &TaskDefinition) -> String {
    format!("{}:{}", definition.family, definition.revision)
}

/// Cluster inspection
#[derive(Clone)]
pub struct ClusterInspector {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn Registry>,
    config: EngineConfig,
}

impl ClusterInspector {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn Registry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            config,
        }
    }

    /// Cluster names
    pub async fn list_clusters(&self) -> Result<Vec<String>> {
        let orchestrator = self.orchestrator.as_ref();
        let arns = collect_all(|token| orchestrator.list_clusters(token)).await?;
        Ok(arns.iter().map(|arn| arn_name(arn).to_string()).collect())
    }

    /// Service names of a cluster
    pub async fn list_services(&self, cluster: &str) -> Result<Vec<String>> {
        let orchestrator = self.orchestrator.as_ref();
        let arns = collect_all(|token| orchestrator.list_services(cluster, token)).await?;
        Ok(arns.iter().map(|arn| arn_name(arn).to_string()).collect())
    }

    /// Running task ARNs of a service
    pub async fn list_tasks(&self, cluster: &str, service: &str) -> Result<Vec<String>> {
        lookup::task_arns(
            self.orchestrator.as_ref(),
            cluster,
            Some(service),
            TaskDesiredStatus::Running,
        )
        .await
    }

    /// Running tasks of a service, or of the whole cluster
    pub async fn task_count(&self, cluster: &str, service: Option<&str>) -> Result<usize> {
        let arns = lookup::task_arns(
            self.orchestrator.as_ref(),
            cluster,
            service,
            TaskDesiredStatus::Running,
        )
        .await?;
        Ok(arns.len())
    }

    /// Service events, newest first
    pub async fn service_events(&self, cluster: &str, service: &str) -> Result<Vec<ServiceEvent>> {
        let description = lookup::service(self.orchestrator.as_ref(), cluster, service).await?;
        let mut events = description.events;
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    pub async fn deployment_status(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<LiveDeploymentStatus> {
        let description = lookup::service(self.orchestrator.as_ref(), cluster, service).await?;
        Ok(LiveDeploymentStatus::from_counts(
            description.desired_count,
            description.running_count,
            description.pending_count,
        ))
    }

    /// Current and newest image of every container of a service.
    ///
    /// Registry failures degrade to "no update" with the error attached.
    pub async fn service_image_info(&self, cluster: &str, service: &str) -> Result<ServiceImageInfo> {
        let description = lookup::service(self.orchestrator.as_ref(), cluster, service).await?;
        let definition =
            lookup::current_task_definition(self.orchestrator.as_ref(), &description).await?;

        let mut images = RegistryCache::new(self.registry.as_ref());
        let mut container_image_info = Vec::with_capacity(definition.container_definitions.len());

        for container in &definition.container_definitions {
            container_image_info.push(self.container_image_info(&mut images, container).await);
        }

        let has_any_updates = container_image_info.iter().any(|c| c.has_updates);
        Ok(ServiceImageInfo {
            service: service.to_string(),
            cluster: cluster.to_string(),
            task_definition_arn: definition.task_definition_arn,
            container_image_info,
            has_any_updates,
        })
    }

    async fn container_image_info(
        &self,
        images: &mut RegistryCache<'_>,
        container: &ContainerDefinition,
    ) -> ContainerImageInfo {
        let mut info = ContainerImageInfo {
            container_name: container.name.clone(),
            current_image: container.image.clone(),
            latest_image: container.image.clone(),
            has_updates: false,
            uses_latest_tag: false,
            error: None,
        };

        let Some(reference) = ImageReference::parse(&container.image) else {
            return info;
        };
        info.uses_latest_tag = reference.is_floating();

        match images.freshness(&reference, None).await {
            Ok(result) => {
                info.has_updates = result.has_update;
                info.latest_image = result.latest_reference.uri();
            }
            Err(e) => {
                warn!("Image lookup failed for container {}: {}", container.name, e);
                info.error = Some(e.to_string());
            }
        }
        info
    }

    /// Running tasks with per-container freshness, or up to two stopped
    /// tasks with their stop reason when nothing runs
    pub async fn task_details(&self, cluster: &str, service: &str) -> Result<Vec<TaskDetails>> {
        let orchestrator = self.orchestrator.as_ref();
        let mut images = RegistryCache::new(self.registry.as_ref());

        let running =
            lookup::task_arns(orchestrator, cluster, Some(service), TaskDesiredStatus::Running)
                .await?;

        if running.is_empty() {
            let stopped =
                lookup::task_arns(orchestrator, cluster, Some(service), TaskDesiredStatus::Stopped)
                    .await?;
            if stopped.is_empty() {
                return Ok(Vec::new());
            }

            let recent: Vec<String> = stopped.into_iter().take(STOPPED_TASKS_REPORTED).collect();
            let tasks = orchestrator.describe_tasks(cluster, &recent).await?;

            let mut details = Vec::with_capacity(tasks.len());
            for task in tasks {
                details.push(self.stopped_task_details(&mut images, task).await?);
            }
            return Ok(details);
        }

        let service_uses_latest_tag = self.service_uses_floating_tag(cluster, service).await;
        let tasks = orchestrator.describe_tasks(cluster, &running).await?;

        let mut details = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mut entry = self.running_task_details(&mut images, task).await?;
            entry.service_uses_latest_tag = Some(service_uses_latest_tag);
            details.push(entry);
        }
        Ok(details)
    }

    async fn task_definition_of(&self, task: &TaskDescription) -> Result<Option<TaskDefinition>> {
        match &task.task_definition_arn {
            Some(arn) => Ok(Some(self.orchestrator.describe_task_definition(arn).await?)),
            None => Ok(None),
        }
    }

    async fn running_task_details(
        &self,
        images: &mut RegistryCache<'_>,
        task: TaskDescription,
    ) -> Result<TaskDetails> {
        let definition = self.task_definition_of(&task).await?;
        let containers = definition
            .as_ref()
            .map(|d| d.container_definitions.as_slice())
            .unwrap_or(&[]);

        let mut task_images = Vec::with_capacity(containers.len());
        for container in containers {
            let live = task.containers.iter().find(|c| c.name == container.name);
            let digest = live.and_then(|c| c.image_digest.clone());
            let running_image = live
                .and_then(|c| c.image.clone())
                .unwrap_or_else(|| container.image.clone());

            let uri = match &digest {
                Some(digest) if !running_image.contains('@') => {
                    format!("{}@{}", running_image, digest)
                }
                _ => running_image,
            };

            let (latest_image_uri, is_latest) =
                Self::image_freshness(images, &container.image, digest.as_deref()).await;

            task_images.push(TaskImage {
                container_name: container.name.clone(),
                uri,
                task_definition_uri: Some(container.image.clone()),
                latest_tag: latest_image_uri.as_deref().map(|u| tag_of(u).to_string()),
                latest_image_uri,
                is_latest,
            });
        }

        Ok(Self::task_summary(task, definition.as_ref(), task_images, TaskState::Running))
    }

    async fn stopped_task_details(
        &self,
        images: &mut RegistryCache<'_>,
        task: TaskDescription,
    ) -> Result<TaskDetails> {
        let definition = self.task_definition_of(&task).await?;
        let containers = definition
            .as_ref()
            .map(|d| d.container_definitions.as_slice())
            .unwrap_or(&[]);

        let mut task_images = Vec::with_capacity(containers.len());
        for container in containers {
            let (latest_image_uri, is_latest) =
                Self::image_freshness(images, &container.image, None).await;
            task_images.push(TaskImage {
                container_name: container.name.clone(),
                uri: container.image.clone(),
                task_definition_uri: None,
                latest_tag: latest_image_uri.as_deref().map(|u| tag_of(u).to_string()),
                latest_image_uri,
                is_latest,
            });
        }

        let (exit_code, container_reason) = task
            .containers
            .first()
            .map(|c| (c.exit_code, c.reason.clone()))
            .unwrap_or((None, None));
        let stopped_reason = task.stopped_reason.clone();

        let mut details =
            Self::task_summary(task, definition.as_ref(), task_images, TaskState::Stopped);
        details.stopped_reason = stopped_reason;
        details.exit_code = exit_code;
        details.container_reason = container_reason;
        Ok(details)
    }

    /// `(latest image uri, running image is current)`; unknown on lookup failure
    async fn image_freshness(
        images: &mut RegistryCache<'_>,
        image: &str,
        observed_digest: Option<&str>,
    ) -> (Option<String>, bool) {
        let Some(reference) = ImageReference::parse(image) else {
            return (None, false);
        };
        match images.freshness(&reference, observed_digest).await {
            Ok(result) => (Some(result.latest_reference.uri()), !result.has_update),
            Err(e) => {
                debug!("Image lookup failed for {}: {}", image, e);
                (None, false)
            }
        }
    }

    fn task_summary(
        task: TaskDescription,
        definition: Option<&TaskDefinition>,
        images: Vec<TaskImage>,
        status: TaskState,
    ) -> TaskDetails {
        let task_definition = match definition {
            Some(definition) => revision_label(definition),
            None => task.task_definition_arn.clone().unwrap_or_default(),
        };

        TaskDetails {
            task_id: arn_name(&task.task_arn).to_string(),
            cpu: definition.and_then(|d| d.cpu.clone()).or(task.cpu),
            memory: definition.and_then(|d| d.memory.clone()).or(task.memory),
            task_arn: task.task_arn,
            task_definition,
            images,
            status,
            stopped_reason: None,
            exit_code: None,
            container_reason: None,
            service_uses_latest_tag: None,
        }
    }

    async fn service_uses_floating_tag(&self, cluster: &str, service: &str) -> bool {
        let orchestrator = self.orchestrator.as_ref();
        let description = match lookup::service(orchestrator, cluster, service).await {
            Ok(description) => description,
            Err(_) => return false,
        };
        match lookup::current_task_definition(orchestrator, &description).await {
            Ok(definition) => uses_floating_tag(&definition),
            Err(_) => false,
        }
    }

    /// Digest of the first running container of a service that reports one
    async fn running_digest(&self, cluster: &str, service: &str) -> Option<String> {
        let orchestrator = self.orchestrator.as_ref();
        let filter = TaskFilter::service(cluster, service)
            .with_status(TaskDesiredStatus::Running);

        let page = match orchestrator.list_tasks(&filter, None).await {
            Ok(page) => page,
            Err(e) => {
                debug!("Digest probe of {}/{} failed: {}", cluster, service, e);
                return None;
            }
        };
        let first = page.items.into_iter().next()?;

        let tasks = orchestrator.describe_tasks(cluster, &[first]).await.ok()?;
        tasks
            .into_iter()
            .next()?
            .containers
            .into_iter()
            .find_map(|c| c.image_digest)
    }

    /// Every service of a cluster with its freshness status and a summary
    pub async fn cluster_overview(&self, cluster: &str) -> Result<ClusterOverview> {
        let orchestrator = self.orchestrator.as_ref();
        let names = self.list_services(cluster).await?;

        let mut definitions: HashMap<String, TaskDefinition> = HashMap::new();
        let mut images = RegistryCache::new(self.registry.as_ref());
        let mut probes = 0;
        let mut services = Vec::with_capacity(names.len());
        let mut summary = OverviewSummary::default();

        for name in names {
            let Some(description) = orchestrator.describe_service(cluster, &name).await? else {
                debug!("Service {}/{} vanished during overview", cluster, name);
                continue;
            };

            let mut overview = ServiceOverview {
                service_name: description.service_name.clone(),
                status: ServiceHealth::UpToDate,
                running_count: description.running_count,
                desired_count: description.desired_count,
                current_image_uri: None,
                latest_image_uri: None,
                task_definition: description.task_definition.clone(),
                has_updates: false,
                uses_latest_tag: false,
            };

            if let Some(arn) = &description.task_definition {
                if !definitions.contains_key(arn) {
                    match orchestrator.describe_task_definition(arn).await {
                        Ok(definition) => {
                            definitions.insert(arn.clone(), definition);
                        }
                        Err(e) => warn!("Could not describe {}: {}", arn, e),
                    }
                }
            }

            let definition = description
                .task_definition
                .as_ref()
                .and_then(|arn| definitions.get(arn));

            if let Some(definition) = definition {
                overview.uses_latest_tag = uses_floating_tag(definition);

                let managed = definition
                    .container_definitions
                    .iter()
                    .find_map(|c| ImageReference::parse(&c.image).map(|r| (c, r)));

                if let Some((container, reference)) = managed {
                    overview.current_image_uri = Some(container.image.clone());

                    let observed = if reference.is_floating()
                        && probes < self.config.latest_digest_probes
                    {
                        probes += 1;
                        self.running_digest(cluster, &name).await
                    } else {
                        None
                    };

                    match images.freshness(&reference, observed.as_deref()).await {
                        Ok(result) => {
                            overview.has_updates = result.has_update;
                            overview.latest_image_uri = Some(result.latest_reference.uri());
                        }
                        Err(e) => warn!("Image lookup failed for service {}: {}", name, e),
                    }
                }
            }

            overview.status = if overview.running_count == 0 {
                summary.no_tasks += 1;
                ServiceHealth::NoTasks
            } else if overview.has_updates {
                summary.updates_available += 1;
                ServiceHealth::UpdatesAvailable
            } else {
                summary.up_to_date += 1;
                ServiceHealth::UpToDate
            };

            if overview.uses_latest_tag {
                summary.latest_tag_services += 1;
                if overview.has_updates {
                    summary.latest_tag_updates += 1;
                }
            }

            services.push(overview);
        }

        summary.total = services.len();
        Ok(ClusterOverview { services, summary })
    }
}
