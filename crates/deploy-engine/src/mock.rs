//! In-memory collaborators for development and testing
//!
//! Simulate the orchestrator, registry and log store without any cloud
//! account. Every mutation is recorded so tests can assert on it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deckhand_common::{
    ContainerDefinition, DeploymentRole, Error, LogConfiguration, LogEvent, LogEventsPage,
    LogEventsQuery, LogStore, LogStreamInfo, Orchestrator, Page, Registry, RepositoryImage,
    Result, RolloutState, ServiceDeployment, ServiceDescription, ServiceUpdate, TaskContainer,
    TaskDefinition, TaskDefinitionSpec, TaskDescription, TaskDesiredStatus, TaskFilter, TimeRange,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const ACCOUNT: &str = "123456789012";
const REGION: &str = "us-east-1";

fn page_of<T: Clone>(items: &[T], token: Option<String>, page_size: usize) -> Result<Page<T>> {
    let start = match token {
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| Error::InvalidInput(format!("Invalid page token: {}", token)))?,
        None => 0,
    };
    let end = (start + page_size).min(items.len());
    let items_page = items.get(start..end).unwrap_or_default().to_vec();
    let next_token = (end < items.len()).then(|| end.to_string());

    Ok(Page {
        items: items_page,
        next_token,
    })
}

/// Build a service description pointing at `task_definition`
pub fn service_description(name: &str, task_definition: &str, desired_count: u32) -> ServiceDescription {
    ServiceDescription {
        service_name: name.to_string(),
        service_arn: format!("arn:aws:ecs:{}:{}:service/{}", REGION, ACCOUNT, name),
        task_definition: Some(task_definition.to_string()),
        desired_count,
        running_count: desired_count,
        pending_count: 0,
        deployments: vec![ServiceDeployment {
            id: format!("ecs-svc/{}", name),
            status: DeploymentRole::Primary,
            rollout_state: Some(RolloutState::Completed),
            task_definition: Some(task_definition.to_string()),
        }],
        events: Vec::new(),
    }
}

/// Build a revision of `family` holding `containers`
pub fn task_definition(family: &str, revision: u32, containers: Vec<ContainerDefinition>) -> TaskDefinition {
    TaskDefinition {
        task_definition_arn: task_definition_arn(family, revision),
        family: family.to_string(),
        revision,
        cpu: Some("256".to_string()),
        memory: Some("512".to_string()),
        network_mode: Some("awsvpc".to_string()),
        requires_compatibilities: vec!["FARGATE".to_string()],
        execution_role_arn: None,
        task_role_arn: None,
        container_definitions: containers,
        volumes: Vec::new(),
        placement_constraints: Vec::new(),
        proxy_configuration: None,
        inference_accelerators: Vec::new(),
        ephemeral_storage: None,
        tags: Vec::new(),
    }
}

pub fn task_definition_arn(family: &str, revision: u32) -> String {
    format!(
        "arn:aws:ecs:{}:{}:task-definition/{}:{}",
        REGION, ACCOUNT, family, revision
    )
}

/// Container shipping its logs to `log_group`
pub fn logging_container(name: &str, image: &str, log_group: &str) -> ContainerDefinition {
    let mut container = ContainerDefinition::new(name, image);
    let mut options = BTreeMap::new();
    options.insert("awslogs-group".to_string(), log_group.to_string());
    options.insert("awslogs-region".to_string(), REGION.to_string());
    container.log_configuration = Some(LogConfiguration {
        log_driver: "awslogs".to_string(),
        options,
    });
    container
}

/// A mutation received by [`MockOrchestrator::update_service`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpdate {
    pub cluster: String,
    pub service: String,
    pub update: ServiceUpdate,
}

#[derive(Debug, Clone)]
struct MockTask {
    cluster: String,
    service: String,
    desired_status: TaskDesiredStatus,
    description: TaskDescription,
}

struct OrchestratorState {
    clusters: BTreeMap<String, BTreeMap<String, ServiceDescription>>,
    task_definitions: Vec<TaskDefinition>,
    tasks: Vec<MockTask>,
    registered: Vec<TaskDefinitionSpec>,
    updates: Vec<RecordedUpdate>,
    stopped: Vec<String>,
    stop_failures: Vec<String>,
    failure: Option<String>,
    page_size: usize,
}

impl OrchestratorState {
    fn check(&self) -> Result<()> {
        match &self.failure {
            Some(message) => Err(Error::Orchestrator(message.clone())),
            None => Ok(()),
        }
    }

    fn find_definition(&self, reference: &str) -> Option<&TaskDefinition> {
        if let Some(found) = self
            .task_definitions
            .iter()
            .find(|td| td.task_definition_arn == reference)
        {
            return Some(found);
        }

        match reference.rsplit_once(':') {
            Some((family, revision)) if revision.parse::<u32>().is_ok() => {
                let family = family.rsplit('/').next().unwrap_or(family);
                self.task_definitions
                    .iter()
                    .find(|td| td.family == family && td.revision.to_string() == revision)
            }
            _ => self
                .task_definitions
                .iter()
                .filter(|td| td.family == reference)
                .max_by_key(|td| td.revision),
        }
    }
}

/// Mock orchestrator
#[derive(Clone)]
pub struct MockOrchestrator {
    state: Arc<Mutex<OrchestratorState>>,
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(OrchestratorState {
                clusters: BTreeMap::new(),
                task_definitions: Vec::new(),
                tasks: Vec::new(),
                registered: Vec::new(),
                updates: Vec::new(),
                stopped: Vec::new(),
                stop_failures: Vec::new(),
                failure: None,
                page_size: 100,
            })),
        }
    }

    /// Page size of every listing
    pub async fn set_page_size(&self, page_size: usize) {
        self.state.lock().await.page_size = page_size.max(1);
    }

    pub async fn add_cluster(&self, cluster: &str) {
        self.state
            .lock()
            .await
            .clusters
            .entry(cluster.to_string())
            .or_default();
    }

    pub async fn add_service(&self, cluster: &str, service: ServiceDescription) {
        let mut state = self.state.lock().await;
        state
            .clusters
            .entry(cluster.to_string())
            .or_default()
            .insert(service.service_name.clone(), service);
    }

    pub async fn remove_service(&self, cluster: &str, service: &str) {
        if let Some(services) = self.state.lock().await.clusters.get_mut(cluster) {
            services.remove(service);
        }
    }

    pub async fn add_task_definition(&self, definition: TaskDefinition) {
        self.state.lock().await.task_definitions.push(definition);
    }

    pub async fn add_task(
        &self,
        cluster: &str,
        service: &str,
        desired_status: TaskDesiredStatus,
        description: TaskDescription,
    ) {
        self.state.lock().await.tasks.push(MockTask {
            cluster: cluster.to_string(),
            service: service.to_string(),
            desired_status,
            description,
        });
    }

    /// Overwrite the counts and primary rollout state of a service
    pub async fn set_rollout(
        &self,
        cluster: &str,
        service: &str,
        running: u32,
        desired: u32,
        pending: u32,
        rollout_state: Option<RolloutState>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(description) = state
            .clusters
            .get_mut(cluster)
            .and_then(|services| services.get_mut(service))
        {
            description.running_count = running;
            description.desired_count = desired;
            description.pending_count = pending;
            for deployment in description.deployments.iter_mut() {
                if deployment.status == DeploymentRole::Primary {
                    deployment.rollout_state = rollout_state.clone();
                }
            }
        }
    }

    /// Make every call fail with `message` until cleared with `None`
    pub async fn fail_with(&self, message: Option<&str>) {
        self.state.lock().await.failure = message.map(str::to_string);
    }

    /// Make `stop_task` fail for this task only
    pub async fn fail_stop(&self, task_arn: &str) {
        self.state.lock().await.stop_failures.push(task_arn.to_string());
    }

    /// Specs received by `register_task_definition`, oldest first
    pub async fn registered(&self) -> Vec<TaskDefinitionSpec> {
        self.state.lock().await.registered.clone()
    }

    pub async fn updates(&self) -> Vec<RecordedUpdate> {
        self.state.lock().await.updates.clone()
    }

    pub async fn stopped_tasks(&self) -> Vec<String> {
        self.state.lock().await.stopped.clone()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn list_clusters(&self, next_token: Option<String>) -> Result<Page<String>> {
        let state = self.state.lock().await;
        state.check()?;
        let arns: Vec<String> = state
            .clusters
            .keys()
            .map(|name| format!("arn:aws:ecs:{}:{}:cluster/{}", REGION, ACCOUNT, name))
            .collect();
        page_of(&arns, next_token, state.page_size)
    }

    async fn list_services(&self, cluster: &str, next_token: Option<String>) -> Result<Page<String>> {
        let state = self.state.lock().await;
        state.check()?;
        let arns: Vec<String> = state
            .clusters
            .get(cluster)
            .map(|services| services.values().map(|s| s.service_arn.clone()).collect())
            .unwrap_or_default();
        page_of(&arns, next_token, state.page_size)
    }

    async fn describe_service(&self, cluster: &str, service: &str) -> Result<Option<ServiceDescription>> {
        let state = self.state.lock().await;
        state.check()?;
        debug!("Mock orchestrator: describe_service({}, {})", cluster, service);
        Ok(state
            .clusters
            .get(cluster)
            .and_then(|services| services.get(service))
            .cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter, next_token: Option<String>) -> Result<Page<String>> {
        let state = self.state.lock().await;
        state.check()?;
        let desired = filter.desired_status.unwrap_or(TaskDesiredStatus::Running);
        let arns: Vec<String> = state
            .tasks
            .iter()
            .filter(|t| t.cluster == filter.cluster)
            .filter(|t| filter.service.as_deref().map_or(true, |s| s == t.service))
            .filter(|t| t.desired_status == desired)
            .map(|t| t.description.task_arn.clone())
            .collect();
        page_of(&arns, next_token, state.page_size)
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<TaskDescription>> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(task_arns
            .iter()
            .filter_map(|arn| {
                state
                    .tasks
                    .iter()
                    .find(|t| t.cluster == cluster && &t.description.task_arn == arn)
                    .map(|t| t.description.clone())
            })
            .collect())
    }

    async fn describe_task_definition(&self, reference: &str) -> Result<TaskDefinition> {
        let state = self.state.lock().await;
        state.check()?;
        state
            .find_definition(reference)
            .cloned()
            .ok_or_else(|| Error::TaskDefinitionNotFound(reference.to_string()))
    }

    async fn register_task_definition(&self, spec: TaskDefinitionSpec) -> Result<TaskDefinition> {
        let mut state = self.state.lock().await;
        state.check()?;

        let revision = state
            .task_definitions
            .iter()
            .filter(|td| td.family == spec.family)
            .map(|td| td.revision)
            .max()
            .unwrap_or(0)
            + 1;

        let definition = TaskDefinition {
            task_definition_arn: task_definition_arn(&spec.family, revision),
            family: spec.family.clone(),
            revision,
            cpu: spec.cpu.clone(),
            memory: spec.memory.clone(),
            network_mode: spec.network_mode.clone(),
            requires_compatibilities: spec.requires_compatibilities.clone().unwrap_or_default(),
            execution_role_arn: spec.execution_role_arn.clone(),
            task_role_arn: spec.task_role_arn.clone(),
            container_definitions: spec.container_definitions.clone(),
            volumes: spec.volumes.clone(),
            placement_constraints: spec.placement_constraints.clone(),
            proxy_configuration: spec.proxy_configuration.clone(),
            inference_accelerators: spec.inference_accelerators.clone(),
            ephemeral_storage: spec.ephemeral_storage.clone(),
            tags: spec.tags.clone(),
        };

        debug!(
            "Mock orchestrator: registered {}",
            definition.task_definition_arn
        );
        state.registered.push(spec);
        state.task_definitions.push(definition.clone());
        Ok(definition)
    }

    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        update: ServiceUpdate,
    ) -> Result<ServiceDescription> {
        let mut state = self.state.lock().await;
        state.check()?;

        let description = state
            .clusters
            .get_mut(cluster)
            .and_then(|services| services.get_mut(service))
            .ok_or_else(|| Error::service_not_found(cluster, service))?;

        if let Some(task_definition) = &update.task_definition {
            description.task_definition = Some(task_definition.clone());
        }
        if let Some(desired_count) = update.desired_count {
            description.desired_count = desired_count;
        }
        if update.task_definition.is_some() || update.force_new_deployment {
            for deployment in description.deployments.iter_mut() {
                deployment.status = DeploymentRole::Active;
            }
            let sequence = description.deployments.len() + 1;
            description.deployments.insert(
                0,
                ServiceDeployment {
                    id: format!("ecs-svc/{}-{}", service, sequence),
                    status: DeploymentRole::Primary,
                    rollout_state: Some(RolloutState::InProgress),
                    task_definition: description.task_definition.clone(),
                },
            );
        }

        let updated = description.clone();
        state.updates.push(RecordedUpdate {
            cluster: cluster.to_string(),
            service: service.to_string(),
            update,
        });
        Ok(updated)
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str, _reason: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        if state.stop_failures.iter().any(|arn| arn == task_arn) {
            return Err(Error::Orchestrator(format!("Failed to stop {}", task_arn)));
        }

        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.cluster == cluster && t.description.task_arn == task_arn)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown task {}", task_arn)))?;
        task.desired_status = TaskDesiredStatus::Stopped;
        task.description.last_status = Some("STOPPED".to_string());

        state.stopped.push(task_arn.to_string());
        Ok(())
    }

    async fn list_task_definition_revisions(&self, family: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        state.check()?;
        let mut revisions: Vec<&TaskDefinition> = state
            .task_definitions
            .iter()
            .filter(|td| td.family == family)
            .collect();
        revisions.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(revisions
            .into_iter()
            .map(|td| td.task_definition_arn.clone())
            .collect())
    }
}

/// Mock image registry keyed by repository name
#[derive(Clone, Default)]
pub struct MockRegistry {
    state: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    repositories: HashMap<String, Vec<RepositoryImage>>,
    failure: Option<String>,
    calls: usize,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_image(&self, repository: &str, digest: &str, tags: &[&str], pushed_at: DateTime<Utc>) {
        self.state
            .lock()
            .await
            .repositories
            .entry(repository.to_string())
            .or_default()
            .push(RepositoryImage {
                digest: Some(digest.to_string()),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                pushed_at: Some(pushed_at),
            });
    }

    pub async fn fail_with(&self, message: Option<&str>) {
        self.state.lock().await.failure = message.map(str::to_string);
    }

    /// Number of `list_tagged_images` calls served
    pub async fn calls(&self) -> usize {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn list_tagged_images(&self, region: &str, repository: &str) -> Result<Vec<RepositoryImage>> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        if let Some(message) = &state.failure {
            return Err(Error::Registry(message.clone()));
        }
        debug!("Mock registry: list_tagged_images({}, {})", region, repository);
        Ok(state
            .repositories
            .get(repository)
            .map(|images| images.iter().filter(|i| !i.tags.is_empty()).cloned().collect())
            .unwrap_or_default())
    }
}

/// How the mock answers insights queries
#[derive(Debug, Clone)]
pub enum InsightsBehavior {
    Results(Vec<LogEvent>),
    Fail(String),
    /// Never completes
    Hang,
}

#[derive(Default)]
struct LogStoreState {
    streams: BTreeMap<String, Vec<LogStreamInfo>>,
    events: HashMap<(String, String), Vec<LogEvent>>,
    insights: Option<InsightsBehavior>,
    failure: Option<String>,
    event_calls: usize,
}

/// Mock log store
#[derive(Clone, Default)]
pub struct MockLogStore {
    state: Arc<Mutex<LogStoreState>>,
}

impl MockLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events (sorted by the caller) to a stream, creating it when needed
    pub async fn append_events(&self, log_group: &str, log_stream: &str, events: Vec<LogEvent>) {
        let mut state = self.state.lock().await;
        let key = (log_group.to_string(), log_stream.to_string());
        let stored = state.events.entry(key).or_default();
        stored.extend(events);

        let first = stored.first().map(|e| e.timestamp);
        let last = stored.last().map(|e| e.timestamp);

        let streams = state.streams.entry(log_group.to_string()).or_default();
        match streams.iter_mut().find(|s| s.log_stream_name == log_stream) {
            Some(stream) => {
                stream.first_event_timestamp = first;
                stream.last_event_timestamp = last;
            }
            None => streams.push(LogStreamInfo {
                log_stream_name: log_stream.to_string(),
                first_event_timestamp: first,
                last_event_timestamp: last,
            }),
        }
    }

    pub async fn set_insights(&self, behavior: InsightsBehavior) {
        self.state.lock().await.insights = Some(behavior);
    }

    pub async fn fail_with(&self, message: Option<&str>) {
        self.state.lock().await.failure = message.map(str::to_string);
    }

    /// Number of `get_log_events` calls served
    pub async fn event_calls(&self) -> usize {
        self.state.lock().await.event_calls
    }
}

fn forward_token(position: usize) -> String {
    format!("f/{}", position)
}

fn parse_forward_token(token: &str) -> Result<usize> {
    token
        .strip_prefix("f/")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::LogStore(format!("Invalid next token: {}", token)))
}

#[async_trait]
impl LogStore for MockLogStore {
    async fn describe_log_streams(&self, log_group: &str, next_token: Option<String>) -> Result<Page<LogStreamInfo>> {
        let state = self.state.lock().await;
        if let Some(message) = &state.failure {
            return Err(Error::LogStore(message.clone()));
        }
        let mut streams = state.streams.get(log_group).cloned().unwrap_or_default();
        streams.sort_by(|a, b| b.last_event_timestamp.cmp(&a.last_event_timestamp));
        page_of(&streams, next_token, 50)
    }

    async fn get_log_events(&self, query: &LogEventsQuery) -> Result<LogEventsPage> {
        let mut state = self.state.lock().await;
        state.event_calls += 1;
        if let Some(message) = &state.failure {
            return Err(Error::LogStore(message.clone()));
        }

        let key = (query.log_group.clone(), query.log_stream.clone());
        let events: Vec<LogEvent> = state
            .events
            .get(&key)
            .ok_or_else(|| Error::LogStore(format!("Log stream {} not found", query.log_stream)))?
            .iter()
            .filter(|e| query.range.map_or(true, |r: TimeRange| r.contains(e.timestamp)))
            .cloned()
            .collect();

        let limit = query.limit as usize;
        let (start, end) = match &query.next_token {
            Some(token) => {
                let start = parse_forward_token(token)?.min(events.len());
                (start, (start + limit).min(events.len()))
            }
            None if query.start_from_head => (0, limit.min(events.len())),
            None => (events.len().saturating_sub(limit), events.len()),
        };

        Ok(LogEventsPage {
            events: events[start..end].to_vec(),
            next_forward_token: Some(forward_token(end)),
        })
    }

    async fn run_insights_query(
        &self,
        _log_group: &str,
        range: TimeRange,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        let behavior = self.state.lock().await.insights.clone();
        match behavior {
            Some(InsightsBehavior::Results(events)) => Ok(events
                .into_iter()
                .filter(|e| range.contains(e.timestamp))
                .take(limit)
                .collect()),
            Some(InsightsBehavior::Fail(message)) => Err(Error::LogStore(message)),
            Some(InsightsBehavior::Hang) => std::future::pending().await,
            None => Err(Error::LogStore("Insights not available".to_string())),
        }
    }
}

/// Collaborators seeded with a small demo cluster
pub struct DemoEnvironment {
    pub orchestrator: MockOrchestrator,
    pub registry: MockRegistry,
    pub log_store: MockLogStore,
}

/// Seed a `demo` cluster with a versioned-tag service (`web`, one release
/// behind) and a floating-tag service (`worker`, a newer push available)
pub async fn demo_environment() -> DemoEnvironment {
    let orchestrator = MockOrchestrator::new();
    let registry = MockRegistry::new();
    let log_store = MockLogStore::new();
    let now = Utc::now();
    let host = format!("{}.dkr.ecr.{}.amazonaws.com", ACCOUNT, REGION);

    let web_image = format!("{}/web:v1.0.0", host);
    let web = task_definition(
        "web",
        1,
        vec![logging_container("web", &web_image, "/ecs/demo/web")],
    );
    orchestrator.add_task_definition(web.clone()).await;
    orchestrator
        .add_service("demo", service_description("web", &web.task_definition_arn, 2))
        .await;

    let worker_image = format!("{}/worker:latest", host);
    let worker = task_definition(
        "worker",
        3,
        vec![logging_container("worker", &worker_image, "/ecs/demo/worker")],
    );
    orchestrator.add_task_definition(worker.clone()).await;
    orchestrator
        .add_service("demo", service_description("worker", &worker.task_definition_arn, 1))
        .await;

    let tasks = [
        ("web", "0a1b2c", &web, &web_image, "sha256:web100"),
        ("web", "3d4e5f", &web, &web_image, "sha256:web100"),
        ("worker", "6a7b8c", &worker, &worker_image, "sha256:worker-old"),
    ];
    for (service, id, definition, image, digest) in tasks {
        orchestrator
            .add_task(
                "demo",
                service,
                TaskDesiredStatus::Running,
                TaskDescription {
                    task_arn: format!("arn:aws:ecs:{}:{}:task/demo/{}", REGION, ACCOUNT, id),
                    task_definition_arn: Some(definition.task_definition_arn.clone()),
                    last_status: Some("RUNNING".to_string()),
                    cpu: definition.cpu.clone(),
                    memory: definition.memory.clone(),
                    stopped_reason: None,
                    containers: vec![TaskContainer {
                        name: service.to_string(),
                        image: Some(image.to_string()),
                        image_digest: Some(digest.to_string()),
                        exit_code: None,
                        reason: None,
                    }],
                },
            )
            .await;
    }

    registry
        .push_image("web", "sha256:web100", &["v1.0.0"], now - Duration::days(7))
        .await;
    registry
        .push_image("web", "sha256:web110", &["v1.1.0"], now - Duration::days(1))
        .await;
    registry
        .push_image("worker", "sha256:worker-old", &["build-41"], now - Duration::days(3))
        .await;
    registry
        .push_image("worker", "sha256:worker-new", &["latest", "build-42"], now - Duration::hours(2))
        .await;

    for (group, stream) in [
        ("/ecs/demo/web", "web/web/0a1b2c"),
        ("/ecs/demo/worker", "worker/worker/6a7b8c"),
    ] {
        let events = (0..20)
            .map(|i| LogEvent {
                message: format!("{} request {} handled", stream, i),
                timestamp: (now - Duration::minutes(20 - i)).timestamp_millis(),
            })
            .collect();
        log_store.append_events(group, stream, events).await;
    }

    DemoEnvironment {
        orchestrator,
        registry,
        log_store,
    }
}
