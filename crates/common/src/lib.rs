//! Types shared by the deckhand crates: the error taxonomy, the wire models
//! of the orchestrator, registry and log-store collaborators, and the narrow
//! traits the deployment engine consumes them through.

pub mod credentials;
pub mod error;
pub mod log_store;
pub mod orchestrator;
pub mod page;
pub mod registry;

pub use credentials::{Credentials, CredentialsRequest};
pub use error::{Error, Result};
pub use log_store::{LogEvent, LogEventsPage, LogEventsQuery, LogStore, LogStreamInfo, TimeRange};
pub use orchestrator::{
    arn_name, ContainerDefinition, DeploymentRole, KeyValuePair, LogConfiguration, Orchestrator,
    RolloutState, SecretRef, ServiceDeployment, ServiceDescription, ServiceEvent, ServiceUpdate,
    Tag, TaskContainer, TaskDefinition, TaskDefinitionSpec, TaskDescription, TaskDesiredStatus,
    TaskFilter,
};
pub use page::{collect_all, Page};
pub use registry::{Registry, RepositoryImage};
