use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Desired count must be 0 or greater, got {0}")]
    InvalidDesiredCount(i64),

    #[error("Invalid timestamp format: {0}")]
    InvalidTimestamp(String),

    #[error("Service not found: {cluster}/{service}")]
    ServiceNotFound { cluster: String, service: String },

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("Task definition not found: {0}")]
    TaskDefinitionNotFound(String),

    #[error("No CloudWatch logs configured for service {cluster}/{service}")]
    LogGroupNotConfigured { cluster: String, service: String },

    #[error("No log streams found in log group {0}")]
    LogStreamsNotFound(String),

    #[error("No tasks found for service {cluster}/{service}")]
    NoTasks { cluster: String, service: String },

    #[error("No previous version available for rollback of {family} ({active} active revision(s))")]
    NoPreviousRevision { family: String, active: usize },

    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Log store error: {0}")]
    LogStore(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for errors that mean the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ServiceNotFound { .. }
                | Error::DeploymentNotFound(_)
                | Error::TaskDefinitionNotFound(_)
                | Error::LogGroupNotConfigured { .. }
                | Error::LogStreamsNotFound(_)
                | Error::NoTasks { .. }
        )
    }

    /// True for errors caused by the caller's request rather than by a collaborator
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::InvalidDesiredCount(_)
                | Error::InvalidTimestamp(_)
                | Error::NoPreviousRevision { .. }
        )
    }

    /// True for failures reported by (or while talking to) an external collaborator
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            Error::Orchestrator(_) | Error::Registry(_) | Error::LogStore(_) | Error::Timeout(_)
        )
    }

    pub fn service_not_found(cluster: &str, service: &str) -> Self {
        Error::ServiceNotFound {
            cluster: cluster.to_string(),
            service: service.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
