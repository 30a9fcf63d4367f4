//! Deployment lifecycle engine
//!
//! Rolls services onto newer container images, records every accepted
//! change in a bounded in-memory ledger, reconciles the recorded status
//! against the orchestrator and gives read access to cluster state and logs.

pub mod config;
pub mod deploy;
pub mod freshness;
pub mod image;
pub mod inspect;
pub mod ledger;
pub mod logs;
mod lookup;
pub mod mock;
pub mod reconciler;
pub mod task_definition;

pub use config::EngineConfig;
pub use deploy::{DeployRequest, DeploymentService, DesiredCountChange, RestartStrategy, RollbackOutcome};
pub use freshness::FreshnessResult;
pub use image::ImageReference;
pub use inspect::{ClusterInspector, ClusterOverview, LiveDeploymentStatus, ServiceImageInfo, TaskDetails};
pub use ledger::{DeploymentLedger, DeploymentRecord, DeploymentStatus, DeploymentType, HistoryFilter};
pub use logs::{HistoricalLogs, HistoricalLogsQuery, LogService, LogTarget, TailMessage, TailRequest, TailSession};
pub use reconciler::Reconciler;
pub use task_definition::{ContainerUpdate, TaskDefinitionUpdate};

use deckhand_common::{LogStore, Orchestrator, Registry};
use std::sync::Arc;

/// The engine services wired to one set of collaborators
#[derive(Clone)]
pub struct Engine {
    pub deployments: DeploymentService,
    pub inspector: ClusterInspector,
    pub logs: LogService,
    pub ledger: Arc<DeploymentLedger>,
}

impl Engine {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn Registry>,
        log_store: Arc<dyn LogStore>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(DeploymentLedger::new(config.ledger_capacity));
        Self {
            deployments: DeploymentService::new(
                orchestrator.clone(),
                registry.clone(),
                ledger.clone(),
                config.clone(),
            ),
            inspector: ClusterInspector::new(orchestrator.clone(), registry, config.clone()),
            logs: LogService::new(orchestrator, log_store, config),
            ledger,
        }
    }
}
