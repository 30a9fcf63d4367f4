//! Container orchestrator collaborator: wire models and the narrow interface
//! the engine consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::page::Page;

/// Role of a deployment object within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeploymentRole {
    Primary,
    Active,
    Inactive,
    Other(String),
}

impl From<String> for DeploymentRole {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PRIMARY" => DeploymentRole::Primary,
            "ACTIVE" => DeploymentRole::Active,
            "INACTIVE" => DeploymentRole::Inactive,
            _ => DeploymentRole::Other(value),
        }
    }
}

impl From<DeploymentRole> for String {
    fn from(value: DeploymentRole) -> Self {
        match value {
            DeploymentRole::Primary => "PRIMARY".to_string(),
            DeploymentRole::Active => "ACTIVE".to_string(),
            DeploymentRole::Inactive => "INACTIVE".to_string(),
            DeploymentRole::Other(other) => other,
        }
    }
}

/// Orchestrator-reported progress of an in-flight service update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RolloutState {
    Completed,
    Failed,
    InProgress,
    Pending,
    Started,
    Other(String),
}

impl RolloutState {
    pub fn as_str(&self) -> &str {
        match self {
            RolloutState::Completed => "COMPLETED",
            RolloutState::Failed => "FAILED",
            RolloutState::InProgress => "IN_PROGRESS",
            RolloutState::Pending => "PENDING",
            RolloutState::Started => "STARTED",
            RolloutState::Other(other) => other.as_str(),
        }
    }
}

impl From<String> for RolloutState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "COMPLETED" => RolloutState::Completed,
            "FAILED" => RolloutState::Failed,
            "IN_PROGRESS" => RolloutState::InProgress,
            "PENDING" => RolloutState::Pending,
            "STARTED" => RolloutState::Started,
            _ => RolloutState::Other(value),
        }
    }
}

impl From<&str> for RolloutState {
    fn from(value: &str) -> Self {
        RolloutState::from(value.to_string())
    }
}

impl From<RolloutState> for String {
    fn from(value: RolloutState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment object of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub id: String,

    pub status: DeploymentRole,

    /// Absent while the orchestrator has not reported a rollout state yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_state: Option<RolloutState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<String>,
}

/// Event emitted by the orchestrator for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub id: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub message: String,
}

/// Live description of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub service_name: String,

    pub service_arn: String,

    /// Task definition the service currently runs
    #[serde(default)]
    pub task_definition: Option<String>,

    #[serde(default)]
    pub desired_count: u32,

    #[serde(default)]
    pub running_count: u32,

    #[serde(default)]
    pub pending_count: u32,

    #[serde(default)]
    pub deployments: Vec<ServiceDeployment>,

    #[serde(default)]
    pub events: Vec<ServiceEvent>,
}

impl ServiceDescription {
    /// The deployment object currently marked PRIMARY, if any
    pub fn primary_deployment(&self) -> Option<&ServiceDeployment> {
        self.deployments
            .iter()
            .find(|d| d.status == DeploymentRole::Primary)
    }
}

/// A plain `name`/`value` environment entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub name: String,
    pub value: String,
}

/// A secret reference injected into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub value_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Log driver configuration of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfiguration {
    pub log_driver: String,

    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl LogConfiguration {
    /// Log group of an `awslogs` configuration
    pub fn awslogs_group(&self) -> Option<&str> {
        if self.log_driver != "awslogs" {
            return None;
        }
        self.options.get("awslogs-group").map(String::as_str)
    }
}

/// A container within a task definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,

    /// Hard memory limit (MiB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,

    /// Soft memory reservation (MiB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reservation: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essential: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<KeyValuePair>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_configuration: Option<LogConfiguration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_point: Vec<String>,

    /// Every other field, carried through revisions untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContainerDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cpu: None,
            memory: None,
            memory_reservation: None,
            essential: None,
            environment: Vec::new(),
            secrets: Vec::new(),
            port_mappings: Vec::new(),
            log_configuration: None,
            command: Vec::new(),
            entry_point: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// A registered task definition revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_definition_arn: String,

    pub family: String,

    pub revision: u32,

    #[serde(default)]
    pub cpu: Option<String>,

    #[serde(default)]
    pub memory: Option<String>,

    #[serde(default)]
    pub network_mode: Option<String>,

    #[serde(default)]
    pub requires_compatibilities: Vec<String>,

    #[serde(default)]
    pub execution_role_arn: Option<String>,

    #[serde(default)]
    pub task_role_arn: Option<String>,

    #[serde(default)]
    pub container_definitions: Vec<ContainerDefinition>,

    #[serde(default)]
    pub volumes: Vec<Value>,

    #[serde(default)]
    pub placement_constraints: Vec<Value>,

    #[serde(default)]
    pub proxy_configuration: Option<Value>,

    #[serde(default)]
    pub inference_accelerators: Vec<Value>,

    #[serde(default)]
    pub ephemeral_storage: Option<Value>,

    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Registration request for a new task definition revision.
///
/// Absent optionals and empty tag lists are left out of the serialized
/// request entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinitionSpec {
    pub family: String,

    pub container_definitions: Vec<ContainerDefinition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_compatibilities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_role_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_role_arn: Option<String>,

    pub volumes: Vec<Value>,

    pub placement_constraints: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_configuration: Option<Value>,

    pub inference_accelerators: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_storage: Option<Value>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
}

impl TaskDefinitionSpec {
    /// Carry every field of an existing revision into a new registration
    pub fn from_definition(definition: &TaskDefinition) -> Self {
        Self {
            family: definition.family.clone(),
            container_definitions: definition.container_definitions.clone(),
            cpu: definition.cpu.clone(),
            memory: definition.memory.clone(),
            network_mode: definition.network_mode.clone(),
            requires_compatibilities: if definition.requires_compatibilities.is_empty() {
                None
            } else {
                Some(definition.requires_compatibilities.clone())
            },
            execution_role_arn: definition.execution_role_arn.clone(),
            task_role_arn: definition.task_role_arn.clone(),
            volumes: definition.volumes.clone(),
            placement_constraints: definition.placement_constraints.clone(),
            proxy_configuration: definition.proxy_configuration.clone(),
            inference_accelerators: definition.inference_accelerators.clone(),
            ephemeral_storage: definition.ephemeral_storage.clone(),
            tags: definition.tags.clone(),
        }
    }
}

/// Mutation applied to a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_count: Option<u32>,

    #[serde(default)]
    pub force_new_deployment: bool,
}

impl ServiceUpdate {
    /// Restart tasks with the current task definition
    pub fn force_new_deployment() -> Self {
        Self {
            force_new_deployment: true,
            ..Self::default()
        }
    }

    /// Point the service at another task definition revision
    pub fn task_definition(reference: impl Into<String>) -> Self {
        Self {
            task_definition: Some(reference.into()),
            ..Self::default()
        }
    }

    pub fn desired_count(count: u32) -> Self {
        Self {
            desired_count: Some(count),
            ..Self::default()
        }
    }
}

/// Task lifecycle filter for task listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskDesiredStatus {
    Running,
    Stopped,
}

/// Selection of tasks to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    pub cluster: String,
    pub service: Option<String>,
    pub desired_status: Option<TaskDesiredStatus>,
}

impl TaskFilter {
    pub fn service(cluster: &str, service: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            service: Some(service.to_string()),
            desired_status: None,
        }
    }

    pub fn with_status(mut self, status: TaskDesiredStatus) -> Self {
        self.desired_status = Some(status);
        self
    }
}

/// A container as observed inside a running (or stopped) task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContainer {
    pub name: String,

    #[serde(default)]
    pub image: Option<String>,

    /// Content digest of the image the container actually pulled
    #[serde(default)]
    pub image_digest: Option<String>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub reason: Option<String>,
}

/// Live description of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub task_arn: String,

    #[serde(default)]
    pub task_definition_arn: Option<String>,

    #[serde(default)]
    pub last_status: Option<String>,

    #[serde(default)]
    pub cpu: Option<String>,

    #[serde(default)]
    pub memory: Option<String>,

    #[serde(default)]
    pub stopped_reason: Option<String>,

    #[serde(default)]
    pub containers: Vec<TaskContainer>,
}

/// Last path segment of an ARN (`.../cluster/name` -> `name`)
pub fn arn_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// The orchestrator operations the engine depends on
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_clusters(&self, next_token: Option<String>) -> Result<Page<String>>;

    async fn list_services(&self, cluster: &str, next_token: Option<String>)
        -> Result<Page<String>>;

    /// `Ok(None)` when the service does not exist in the cluster
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<Option<ServiceDescription>>;

    async fn list_tasks(&self, filter: &TaskFilter, next_token: Option<String>)
        -> Result<Page<String>>;

    async fn describe_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
    ) -> Result<Vec<TaskDescription>>;

    async fn describe_task_definition(&self, reference: &str) -> Result<TaskDefinition>;

    async fn register_task_definition(&self, spec: TaskDefinitionSpec) -> Result<TaskDefinition>;

    async fn update_service(
        &self,
        cluster: &str,
        service: &str,
        update: ServiceUpdate,
    ) -> Result<ServiceDescription>;

    async fn stop_task(&self, cluster: &str, task_arn: &str, reason: Option<&str>) -> Result<()>;

    /// ACTIVE revisions of a family, most recent first
    async fn list_task_definition_revisions(&self, family: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rollout_state_parsing() {
        assert_eq!(RolloutState::from("COMPLETED"), RolloutState::Completed);
        assert_eq!(RolloutState::from("STARTED"), RolloutState::Started);
        assert_eq!(
            RolloutState::from("ROLLING_BACK"),
            RolloutState::Other("ROLLING_BACK".to_string())
        );
        assert_eq!(RolloutState::InProgress.to_string(), "IN_PROGRESS");
    }

    #[test]
    fn test_primary_deployment_lookup() {
        let description: ServiceDescription = serde_json::from_value(json!({
            "service_name": "api",
            "service_arn": "arn:svc/api",
            "deployments": [
                { "id": "d-old", "status": "ACTIVE", "rollout_state": "COMPLETED" },
                { "id": "d-new", "status": "PRIMARY", "rollout_state": "IN_PROGRESS" }
            ]
        }))
        .unwrap();

        let primary = description.primary_deployment().unwrap();
        assert_eq!(primary.id, "d-new");
        assert_eq!(primary.rollout_state, Some(RolloutState::InProgress));
        assert_eq!(description.running_count, 0);
    }

    #[test]
    fn test_spec_drops_absent_fields() {
        let definition = TaskDefinition {
            task_definition_arn: "arn:td/web:3".to_string(),
            family: "web".to_string(),
            revision: 3,
            cpu: None,
            memory: Some("512".to_string()),
            network_mode: None,
            requires_compatibilities: vec![],
            execution_role_arn: None,
            task_role_arn: Some("arn:role/task".to_string()),
            container_definitions: vec![ContainerDefinition::new("web", "nginx:1.25")],
            volumes: vec![],
            placement_constraints: vec![],
            proxy_configuration: None,
            inference_accelerators: vec![],
            ephemeral_storage: None,
            tags: vec![],
        };

        let value = serde_json::to_value(TaskDefinitionSpec::from_definition(&definition)).unwrap();
        let object = value.as_object().unwrap();

        assert!(!object.contains_key("cpu"));
        assert!(!object.contains_key("tags"));
        assert!(!object.contains_key("requires_compatibilities"));
        assert_eq!(object["memory"], "512");
        assert_eq!(object["task_role_arn"], "arn:role/task");
        assert_eq!(object["volumes"], json!([]));
    }

    #[test]
    fn test_container_extra_fields_round_trip() {
        let container: ContainerDefinition = serde_json::from_value(json!({
            "name": "worker",
            "image": "busybox",
            "health_check": { "command": ["CMD", "true"] },
            "ulimits": [{ "name": "nofile", "soft_limit": 1024 }]
        }))
        .unwrap();

        assert_eq!(container.extra.len(), 2);
        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["health_check"]["command"][1], "true");
    }

    #[test]
    fn test_awslogs_group() {
        let mut options = BTreeMap::new();
        options.insert("awslogs-group".to_string(), "/ecs/web".to_string());
        let config = LogConfiguration {
            log_driver: "awslogs".to_string(),
            options: options.clone(),
        };
        assert_eq!(config.awslogs_group(), Some("/ecs/web"));

        let config = LogConfiguration {
            log_driver: "fluentd".to_string(),
            options,
        };
        assert_eq!(config.awslogs_group(), None);
    }

    #[test]
    fn test_arn_name() {
        assert_eq!(arn_name("arn:aws:ecs:us-east-1:1:service/prod/api"), "api");
        assert_eq!(arn_name("plain"), "plain");
    }
}
