//! Reconciliation of ledger records against the orchestrator

use deckhand_common::Orchestrator;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ledger::{
    DeploymentLedger, DeploymentRecord, HistoryFilter, PollOutcome, ServiceObservation,
};

/// Polls the orchestrator on behalf of ledger records
#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<DeploymentLedger>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Reconciler {
    pub fn new(ledger: Arc<DeploymentLedger>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            ledger,
            orchestrator,
        }
    }

    /// Poll the service behind record `id` and fold the outcome into the record.
    ///
    /// Returns `None` when the record does not exist (or names no service).
    /// Orchestrator failures are recorded on the record, never returned.
    pub async fn reconcile(&self, id: &str) -> Option<DeploymentRecord> {
        let (cluster, service) = self.ledger.reconcile_target(id)?;
        let outcome = self.poll(&cluster, &service).await;
        self.ledger.apply_reconciliation(id, &outcome)
    }

    /// Reconcile up to `limit` non-terminal records matching `filter`, one at a time
    pub async fn reconcile_pending(&self, filter: &HistoryFilter, limit: usize) -> usize {
        let ids = self.ledger.pending_ids(filter, limit);
        let mut reconciled = 0;

        for id in &ids {
            if self.reconcile(id).await.is_some() {
                reconciled += 1;
            }
        }

        if !ids.is_empty() {
            debug!("Reconciled {}/{} pending deployments", reconciled, ids.len());
        }
        reconciled
    }

    async fn poll(&self, cluster: &str, service: &str) -> PollOutcome {
        match self.orchestrator.describe_service(cluster, service).await {
            Ok(Some(description)) => {
                PollOutcome::Observed(ServiceObservation::from_description(&description))
            }
            Ok(None) => {
                warn!("Service {}/{} no longer exists", cluster, service);
                PollOutcome::ServiceNotFound
            }
            Err(e) => {
                warn!("Failed to poll service {}/{}: {}", cluster, service, e);
                PollOutcome::Failed(e.to_string())
            }
        }
    }
}
