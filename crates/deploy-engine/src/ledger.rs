//! Bounded in-memory deployment ledger
//!
//! Records are kept newest first. Inserting past capacity evicts the oldest
//! record. The lock is never held across an await point: reconciliation reads
//! a snapshot, polls the orchestrator unlocked, then writes the outcome back.

use chrono::{DateTime, Utc};
use deckhand_common::{RolloutState, ServiceDescription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

/// Records kept when no capacity is configured
pub const DEFAULT_CAPACITY: usize = 100;

/// User recorded when the caller does not name one
pub const DEFAULT_USER: &str = "unknown";

/// Lifecycle status of a ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    InProgress,
    Pending,
    Completed,
    Failed,
    /// Last poll failed or the service disappeared
    Unknown,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::InProgress => "IN_PROGRESS",
            DeploymentStatus::Pending => "PENDING",
            DeploymentStatus::Completed => "COMPLETED",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::Unknown => "UNKNOWN",
        }
    }

    /// COMPLETED and FAILED records need no further polling
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Completed | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of change a record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    /// Floating tag, tasks restarted to re-pull
    LatestTagRestart,
    /// New revision registered with newer version tags
    VersionedTagUpdate,
    ForceNewDeployment,
    Rollback,
    TaskDefinitionUpdate,
}

impl DeploymentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentType::LatestTagRestart => "latest_tag_restart",
            DeploymentType::VersionedTagUpdate => "versioned_tag_update",
            DeploymentType::ForceNewDeployment => "force_new_deployment",
            DeploymentType::Rollback => "rollback",
            DeploymentType::TaskDefinitionUpdate => "task_definition_update",
        }
    }

    /// Prefix of generated record ids
    pub fn id_prefix(self) -> &'static str {
        match self {
            DeploymentType::Rollback => "rollback-",
            DeploymentType::TaskDefinitionUpdate => "td-update-",
            _ => "",
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields supplied when a mutating use case succeeds
#[derive(Debug, Clone)]
pub struct NewDeployment {
    /// Caller-chosen id; generated from cluster, service and time when absent
    pub id: Option<String>,
    pub cluster: String,
    pub service: String,
    pub deployment_type: DeploymentType,
    pub message: String,
    pub service_arn: Option<String>,
    pub new_task_definition: Option<String>,
    pub stopped_task_count: u32,
    pub user: Option<String>,
    pub original_deployment_id: Option<String>,
    pub changes: Option<Value>,
}

impl NewDeployment {
    pub fn new(
        cluster: impl Into<String>,
        service: impl Into<String>,
        deployment_type: DeploymentType,
    ) -> Self {
        Self {
            id: None,
            cluster: cluster.into(),
            service: service.into(),
            deployment_type,
            message: String::new(),
            service_arn: None,
            new_task_definition: None,
            stopped_task_count: 0,
            user: None,
            original_deployment_id: None,
            changes: None,
        }
    }
}

/// One tracked deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub cluster: String,
    pub service: String,
    pub deployment_type: DeploymentType,
    pub status: DeploymentStatus,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_arn: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_task_definition: Option<String>,

    pub stopped_task_count: u32,
    pub user: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,

    /// `None` once a terminal status has been observed
    pub next_refresh_at: Option<DateTime<Utc>>,

    /// Reason of the last failed or inconclusive poll
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_error: Option<String>,

    /// Set on rollback records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_deployment_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_count: Option<u32>,

    /// Structured description of a task definition change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

impl DeploymentRecord {
    fn from_entry(id: String, entry: NewDeployment, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            cluster: entry.cluster,
            service: entry.service,
            deployment_type: entry.deployment_type,
            status: DeploymentStatus::InProgress,
            message: entry.message,
            service_arn: entry.service_arn,
            new_task_definition: entry.new_task_definition,
            stopped_task_count: entry.stopped_task_count,
            user: entry.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            last_checked_at: None,
            next_refresh_at: Some(now),
            status_error: None,
            original_deployment_id: entry.original_deployment_id,
            running_count: None,
            desired_count: None,
            pending_count: None,
            changes: entry.changes,
        }
    }

    /// Fold one poll outcome into the record.
    ///
    /// A failed or inconclusive poll never downgrades a COMPLETED record.
    pub fn apply(&mut self, outcome: &PollOutcome, now: DateTime<Utc>) {
        match outcome {
            PollOutcome::Observed(observation) => {
                let status = observation.status();
                self.status = status;
                self.running_count = Some(observation.running_count);
                self.desired_count = Some(observation.desired_count);
                self.pending_count = Some(observation.pending_count);
                self.status_error = None;
                self.next_refresh_at = if status.is_terminal() {
                    None
                } else {
                    Some(now)
                };
            }
            PollOutcome::ServiceNotFound => {
                self.mark_unknown("Service not found");
                self.next_refresh_at = Some(now);
            }
            PollOutcome::Failed(error) => {
                self.mark_unknown(error);
                self.next_refresh_at = Some(now);
            }
        }
        self.last_checked_at = Some(now);
    }

    fn mark_unknown(&mut self, reason: &str) {
        if self.status != DeploymentStatus::Completed {
            self.status = DeploymentStatus::Unknown;
            self.status_error = Some(reason.to_string());
        }
    }
}

/// Counts and rollout state read from a service description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceObservation {
    pub running_count: u32,
    pub desired_count: u32,
    pub pending_count: u32,

    /// Rollout state of the PRIMARY deployment object
    pub rollout_state: Option<RolloutState>,
}

impl ServiceObservation {
    pub fn from_description(description: &ServiceDescription) -> Self {
        Self {
            running_count: description.running_count,
            desired_count: description.desired_count,
            pending_count: description.pending_count,
            rollout_state: description
                .primary_deployment()
                .and_then(|d| d.rollout_state.clone()),
        }
    }

    /// Status implied by this observation; explicit rollout state wins over counts
    pub fn status(&self) -> DeploymentStatus {
        match &self.rollout_state {
            Some(RolloutState::Completed) => DeploymentStatus::Completed,
            Some(RolloutState::Failed) => DeploymentStatus::Failed,
            Some(RolloutState::InProgress | RolloutState::Pending | RolloutState::Started) => {
                DeploymentStatus::InProgress
            }
            Some(RolloutState::Other(_)) | None => self.status_from_counts(),
        }
    }

    fn status_from_counts(&self) -> DeploymentStatus {
        if self.running_count == 0 {
            DeploymentStatus::Pending
        } else if self.running_count < self.desired_count || self.pending_count > 0 {
            DeploymentStatus::InProgress
        } else {
            DeploymentStatus::Completed
        }
    }
}

/// Result of polling the orchestrator for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Observed(ServiceObservation),
    ServiceNotFound,
    Failed(String),
}

/// Optional cluster/service narrowing of ledger listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryFilter {
    pub cluster: Option<String>,
    pub service: Option<String>,
}

impl HistoryFilter {
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        self.cluster.as_deref().map_or(true, |c| c == record.cluster)
            && self.service.as_deref().map_or(true, |s| s == record.service)
    }
}

/// The deployment ledger
#[derive(Debug)]
pub struct DeploymentLedger {
    capacity: usize,
    records: Mutex<VecDeque<DeploymentRecord>>,
}

impl Default for DeploymentLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DeploymentLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Append a new record and return its id
    pub fn record(&self, entry: NewDeployment) -> String {
        self.insert(entry).id
    }

    /// Append a new record and return a snapshot of it
    pub fn insert(&self, entry: NewDeployment) -> DeploymentRecord {
        self.insert_at(entry, Utc::now())
    }

    fn insert_at(&self, mut entry: NewDeployment, now: DateTime<Utc>) -> DeploymentRecord {
        let mut records = self.records.lock();

        let base = entry.id.take().unwrap_or_else(|| {
            format!(
                "{}{}-{}-{}",
                entry.deployment_type.id_prefix(),
                entry.cluster,
                entry.service,
                now.timestamp()
            )
        });
        let id = unique_id(&records, base);

        let record = DeploymentRecord::from_entry(id, entry, now);
        records.push_front(record.clone());

        while records.len() > self.capacity {
            if let Some(evicted) = records.pop_back() {
                debug!("Evicted deployment record {}", evicted.id);
            }
        }

        info!(
            "Recorded {} deployment {} for {}/{}",
            record.deployment_type, record.id, record.cluster, record.service
        );
        record
    }

    pub fn find(&self, id: &str) -> Option<DeploymentRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    /// Newest-first records matching `filter`, at most `limit`
    pub fn list(&self, filter: &HistoryFilter, limit: usize) -> Vec<DeploymentRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Ids of non-terminal records matching `filter`, newest first
    pub fn pending_ids(&self, filter: &HistoryFilter, limit: usize) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| filter.matches(r) && !r.status.is_terminal())
            .take(limit)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Cluster and service a record points at, if it exists and names both
    pub fn reconcile_target(&self, id: &str) -> Option<(String, String)> {
        let records = self.records.lock();
        let record = records.iter().find(|r| r.id == id)?;
        if record.cluster.is_empty() || record.service.is_empty() {
            return None;
        }
        Some((record.cluster.clone(), record.service.clone()))
    }

    /// Write a poll outcome into the record, returning the updated snapshot.
    ///
    /// Returns `None` when the record was evicted while the poll was running.
    pub fn apply_reconciliation(
        &self,
        id: &str,
        outcome: &PollOutcome,
    ) -> Option<DeploymentRecord> {
        let mut records = self.records.lock();
        let record = records.iter_mut().find(|r| r.id == id)?;
        let previous = record.status;
        record.apply(outcome, Utc::now());

        if previous != record.status {
            info!(
                "Deployment {} status changed: {} -> {}",
                record.id, previous, record.status
            );
        }
        Some(record.clone())
    }
}

fn unique_id(records: &VecDeque<DeploymentRecord>, base: String) -> String {
    let taken = |candidate: &str| records.iter().any(|r| r.id == candidate);
    if !taken(&base) {
        return base;
    }

    let mut suffix = 2;
    loop {
        let candidate = format!("{}-{}", base, suffix);
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observed(running: u32, desired: u32, pending: u32, rollout: Option<&str>) -> PollOutcome {
        PollOutcome::Observed(ServiceObservation {
            running_count: running,
            desired_count: desired,
            pending_count: pending,
            rollout_state: rollout.map(RolloutState::from),
        })
    }

    fn entry(service: &str) -> NewDeployment {
        NewDeployment::new("prod", service, DeploymentType::ForceNewDeployment)
    }

    #[test]
    fn test_new_record_defaults() {
        let ledger = DeploymentLedger::default();
        let record = ledger.insert(entry("api"));

        assert_eq!(record.status, DeploymentStatus::InProgress);
        assert_eq!(record.user, "unknown");
        assert!(record.id.starts_with("prod-api-"));
        assert_eq!(record.next_refresh_at, Some(record.created_at));
        assert!(record.last_checked_at.is_none());
    }

    #[test]
    fn test_id_prefixes() {
        let ledger = DeploymentLedger::default();
        let rollback = ledger.record(NewDeployment::new("c", "s", DeploymentType::Rollback));
        let update = ledger.record(NewDeployment::new(
            "c",
            "s",
            DeploymentType::TaskDefinitionUpdate,
        ));

        assert!(rollback.starts_with("rollback-c-s-"));
        assert!(update.starts_with("td-update-c-s-"));
    }

    #[test]
    fn test_colliding_ids_get_suffix() {
        let ledger = DeploymentLedger::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let first = ledger.insert_at(entry("api"), now);
        let second = ledger.insert_at(entry("api"), now);
        let third = ledger.insert_at(entry("api"), now);

        assert_eq!(first.id, format!("prod-api-{}", now.timestamp()));
        assert_eq!(second.id, format!("{}-2", first.id));
        assert_eq!(third.id, format!("{}-3", first.id));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let ledger = DeploymentLedger::new(3);
        let ids: Vec<String> = (0..4)
            .map(|i| {
                let mut e = entry("api");
                e.id = Some(format!("d{}", i));
                ledger.record(e)
            })
            .collect();

        assert_eq!(ledger.len(), 3);
        assert!(ledger.find(&ids[0]).is_none());
        let listed: Vec<String> = ledger
            .list(&HistoryFilter::default(), 10)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(listed, vec!["d3", "d2", "d1"]);
    }

    #[test]
    fn test_list_filters_and_limits() {
        let ledger = DeploymentLedger::default();
        ledger.record(entry("api"));
        ledger.record(entry("worker"));
        ledger.record(NewDeployment::new("staging", "api", DeploymentType::Rollback));

        let filter = HistoryFilter {
            cluster: Some("prod".to_string()),
            service: None,
        };
        assert_eq!(ledger.list(&filter, 10).len(), 2);
        assert_eq!(ledger.list(&filter, 1).len(), 1);

        let filter = HistoryFilter {
            cluster: None,
            service: Some("api".to_string()),
        };
        assert_eq!(ledger.list(&filter, 10).len(), 2);
    }

    #[test]
    fn test_explicit_rollout_state_wins() {
        let now = Utc::now();
        let ledger = DeploymentLedger::default();
        let mut record = ledger.insert(entry("api"));

        record.apply(&observed(0, 3, 0, Some("COMPLETED")), now);
        assert_eq!(record.status, DeploymentStatus::Completed);
        assert_eq!(record.next_refresh_at, None);
        assert_eq!(record.last_checked_at, Some(now));

        record.apply(&observed(3, 3, 0, Some("FAILED")), now);
        assert_eq!(record.status, DeploymentStatus::Failed);

        record.apply(&observed(3, 3, 0, Some("STARTED")), now);
        assert_eq!(record.status, DeploymentStatus::InProgress);
        assert_eq!(record.next_refresh_at, Some(now));
    }

    #[test]
    fn test_status_inferred_from_counts() {
        let now = Utc::now();
        let ledger = DeploymentLedger::default();
        let mut record = ledger.insert(entry("api"));

        record.apply(&observed(0, 2, 0, None), now);
        assert_eq!(record.status, DeploymentStatus::Pending);

        record.apply(&observed(1, 2, 0, None), now);
        assert_eq!(record.status, DeploymentStatus::InProgress);

        record.apply(&observed(2, 2, 1, Some("ROLLING")), now);
        assert_eq!(record.status, DeploymentStatus::InProgress);

        record.apply(&observed(2, 2, 0, None), now);
        assert_eq!(record.status, DeploymentStatus::Completed);
        assert_eq!(record.running_count, Some(2));
        assert_eq!(record.desired_count, Some(2));
        assert_eq!(record.pending_count, Some(0));
    }

    #[test]
    fn test_completed_survives_failed_poll() {
        let now = Utc::now();
        let ledger = DeploymentLedger::default();
        let mut record = ledger.insert(entry("api"));

        record.apply(&observed(1, 1, 0, Some("COMPLETED")), now);
        record.apply(&PollOutcome::Failed("throttled".to_string()), now);

        assert_eq!(record.status, DeploymentStatus::Completed);
        assert_eq!(record.status_error, None);
        assert_eq!(record.next_refresh_at, Some(now));

        record.apply(&PollOutcome::ServiceNotFound, now);
        assert_eq!(record.status, DeploymentStatus::Completed);
    }

    #[test]
    fn test_failed_poll_downgrades_other_statuses() {
        let now = Utc::now();
        let ledger = DeploymentLedger::default();
        let mut record = ledger.insert(entry("api"));

        record.apply(&PollOutcome::Failed("boom".to_string()), now);
        assert_eq!(record.status, DeploymentStatus::Unknown);
        assert_eq!(record.status_error.as_deref(), Some("boom"));

        let mut failed = ledger.insert(entry("worker"));
        failed.apply(&observed(0, 1, 0, Some("FAILED")), now);
        failed.apply(&PollOutcome::ServiceNotFound, now);
        assert_eq!(failed.status, DeploymentStatus::Unknown);
        assert_eq!(failed.status_error.as_deref(), Some("Service not found"));

        failed.apply(&observed(1, 1, 0, None), now);
        assert_eq!(failed.status_error, None);
    }

    #[test]
    fn test_apply_reconciliation_updates_stored_record() {
        let ledger = DeploymentLedger::default();
        let id = ledger.record(entry("api"));

        let updated = ledger
            .apply_reconciliation(&id, &observed(1, 1, 0, Some("COMPLETED")))
            .unwrap();
        assert_eq!(updated.status, DeploymentStatus::Completed);
        assert_eq!(ledger.find(&id).unwrap().status, DeploymentStatus::Completed);
        assert!(ledger.pending_ids(&HistoryFilter::default(), 10).is_empty());

        assert!(ledger
            .apply_reconciliation("missing", &PollOutcome::ServiceNotFound)
            .is_none());
    }

    #[test]
    fn test_record_serializes_wire_names() {
        let ledger = DeploymentLedger::default();
        let record = ledger.insert(NewDeployment::new(
            "prod",
            "api",
            DeploymentType::VersionedTagUpdate,
        ));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "IN_PROGRESS");
        assert_eq!(json["deployment_type"], "versioned_tag_update");
        assert!(json.get("status_error").is_none());
    }
}
