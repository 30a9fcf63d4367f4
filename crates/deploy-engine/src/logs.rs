//! Log access
//!
//! Log target discovery for a service, bounded historical queries (insights
//! first, stream enumeration as the fallback) and live tails that end as soon
//! as their consumer goes away.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use deckhand_common::{
    Error, LogEvent, LogEventsQuery, LogStore, LogStreamInfo, Orchestrator, Result, TaskDefinition,
    TaskDesiredStatus, TaskFilter, TimeRange,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::lookup;

/// Results returned by a historical query when the caller sets no limit
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Shortest delay between two live-tail polls
pub const MIN_TAIL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single `get_log_events` page
const MAX_EVENTS_PER_PAGE: usize = 10_000;

const TAIL_CHANNEL_CAPACITY: usize = 256;

/// Where a service writes its logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTarget {
    pub log_group: String,
    pub log_stream: String,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// A historical log query for one service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoricalLogsQuery {
    pub cluster: String,
    pub service: String,

    /// RFC 3339; a window before `end_time` (or now) when absent
    #[serde(default)]
    pub start_time: Option<String>,

    /// RFC 3339; a window after `start_time` when absent
    #[serde(default)]
    pub end_time: Option<String>,

    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

/// Backend that answered a historical query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogQueryMethod {
    Insights,
    LogStreams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedLogEvent {
    pub message: String,
    pub timestamp: i64,

    /// `YYYY-MM-DD HH:MM:SS` in UTC
    pub formatted_time: String,
}

impl From<LogEvent> for FormattedLogEvent {
    fn from(event: LogEvent) -> Self {
        let formatted_time = Utc
            .timestamp_millis_opt(event.timestamp)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        Self {
            message: event.message,
            timestamp: event.timestamp,
            formatted_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoricalLogs {
    pub logs: Vec<FormattedLogEvent>,
    pub total: usize,
    pub log_group: String,
    pub method: LogQueryMethod,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub streams_checked: Option<usize>,
}

/// Epoch millis of an RFC 3339 timestamp. Offset-less values are read as UTC.
pub fn parse_timestamp(value: &str) -> Result<i64> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().timestamp_millis())
        .map_err(|e| Error::InvalidTimestamp(format!("{}: {}", value, e)))
}

/// Fill in missing bounds with a `window` anchored on the bound that is present, or on `now`
pub fn resolve_window(start: Option<i64>, end: Option<i64>, now_ms: i64, window: Duration) -> TimeRange {
    let window_ms = window.as_millis() as i64;
    match (start, end) {
        (Some(start_ms), Some(end_ms)) => TimeRange { start_ms, end_ms },
        (Some(start_ms), None) => TimeRange {
            start_ms,
            end_ms: start_ms + window_ms,
        },
        (None, Some(end_ms)) => TimeRange {
            start_ms: end_ms - window_ms,
            end_ms,
        },
        (None, None) => TimeRange {
            start_ms: now_ms - window_ms,
            end_ms: now_ms,
        },
    }
}

/// Parameters of a live tail
#[derive(Debug, Clone, Deserialize)]
pub struct TailRequest {
    pub log_group: String,
    pub log_stream: String,

    /// Poll delay; the engine default when absent
    #[serde(default)]
    pub interval: Option<Duration>,
}

/// One message pushed to a tail consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TailMessage {
    Event(LogEvent),
    Error { error: String },
}

/// Handle on a running tail. Dropping it stops the poller.
pub struct TailSession {
    events: mpsc::Receiver<TailMessage>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TailSession {
    /// Next message; `None` once the poller has ended
    pub async fn recv(&mut self) -> Option<TailMessage> {
        self.events.recv().await
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the poller and wait for it to finish
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Debug, Clone, Copy)]
struct TailSettings {
    interval: Duration,
    initial_events: u32,
    batch_events: u32,
}

/// Log access for services
#[derive(Clone)]
pub struct LogService {
    orchestrator: Arc<dyn Orchestrator>,
    log_store: Arc<dyn LogStore>,
    config: EngineConfig,
}

impl LogService {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        log_store: Arc<dyn LogStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            orchestrator,
            log_store,
            config,
        }
    }

    /// Log group and most recent stream of the service's first task
    pub async fn log_target(&self, cluster: &str, service: &str) -> Result<LogTarget> {
        let orchestrator = self.orchestrator.as_ref();
        lookup::service(orchestrator, cluster, service).await?;

        let no_tasks = || Error::NoTasks {
            cluster: cluster.to_string(),
            service: service.to_string(),
        };

        let filter = TaskFilter::service(cluster, service).with_status(TaskDesiredStatus::Running);
        let first_task = orchestrator
            .list_tasks(&filter, None)
            .await?
            .items
            .into_iter()
            .next()
            .ok_or_else(no_tasks)?;

        let task = orchestrator
            .describe_tasks(cluster, &[first_task])
            .await?
            .into_iter()
            .next()
            .ok_or_else(no_tasks)?;
        let reference = task
            .task_definition_arn
            .ok_or_else(|| Error::TaskDefinitionNotFound(format!("no task definition on task {}", task.task_arn)))?;
        let definition = orchestrator.describe_task_definition(&reference).await?;

        let log_group = log_group_of(&definition).ok_or_else(|| Error::LogGroupNotConfigured {
            cluster: cluster.to_string(),
            service: service.to_string(),
        })?;

        let log_stream = self
            .log_store
            .describe_log_streams(&log_group, None)
            .await?
            .items
            .into_iter()
            .next()
            .map(|s| s.log_stream_name)
            .ok_or_else(|| Error::LogStreamsNotFound(log_group.clone()))?;

        Ok(LogTarget {
            log_group,
            log_stream,
        })
    }

    /// Events of the service's log group inside a time window, newest first
    pub async fn historical_logs(&self, query: &HistoricalLogsQuery) -> Result<HistoricalLogs> {
        lookup::require("cluster", &query.cluster)?;
        lookup::require("service", &query.service)?;

        let start = bound(query.start_time.as_deref())?;
        let end = bound(query.end_time.as_deref())?;
        let range = resolve_window(
            start,
            end,
            Utc::now().timestamp_millis(),
            self.config.history_window,
        );
        if range.start_ms > range.end_ms {
            return Err(Error::InvalidInput(
                "start_time must not be after end_time".to_string(),
            ));
        }
        let limit = query.limit.max(1);

        let orchestrator = self.orchestrator.as_ref();
        let service = lookup::service(orchestrator, &query.cluster, &query.service).await?;
        let definition = lookup::current_task_definition(orchestrator, &service).await?;
        let log_group = log_group_of(&definition).ok_or_else(|| Error::LogGroupNotConfigured {
            cluster: query.cluster.clone(),
            service: query.service.clone(),
        })?;

        match self.query_insights(&log_group, range, limit).await {
            Ok(events) => {
                let logs: Vec<FormattedLogEvent> = events.into_iter().map(Into::into).collect();
                debug!("Insights returned {} events from {}", logs.len(), log_group);
                return Ok(HistoricalLogs {
                    total: logs.len(),
                    logs,
                    log_group,
                    method: LogQueryMethod::Insights,
                    streams_checked: None,
                });
            }
            Err(e) => warn!(
                "Insights query on {} failed, scanning log streams instead: {}",
                log_group, e
            ),
        }

        let (events, streams_checked) = self
            .scan_streams(&log_group, range, limit)
            .await
            .map_err(|e| Error::LogStore(format!("Both insights and log streams failed: {}", e)))?;

        let logs: Vec<FormattedLogEvent> = events.into_iter().map(Into::into).collect();
        Ok(HistoricalLogs {
            total: logs.len(),
            logs,
            log_group,
            method: LogQueryMethod::LogStreams,
            streams_checked: Some(streams_checked),
        })
    }

    async fn query_insights(&self, log_group: &str, range: TimeRange, limit: usize) -> Result<Vec<LogEvent>> {
        let cap = limit.min(self.config.insights_result_cap);
        let query = format!(
            "fields @timestamp, @message\n| filter @message != \"\"\n| sort @timestamp desc\n| limit {}",
            cap
        );

        let pending = self.log_store.run_insights_query(log_group, range, &query, cap);
        let mut events = match timeout(self.config.insights_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "insights query on {} after {:?}",
                    log_group, self.config.insights_timeout
                )))
            }
        };

        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    /// Read streams overlapping `range`, returning the newest `limit` events
    /// and the number of streams listed
    async fn scan_streams(&self, log_group: &str, range: TimeRange, limit: usize) -> Result<(Vec<LogEvent>, usize)> {
        let mut streams: Vec<LogStreamInfo> = Vec::new();
        let mut token = None;
        loop {
            let page = self.log_store.describe_log_streams(log_group, token.take()).await?;
            streams.extend(page.items);
            if streams.len() >= self.config.max_log_streams {
                streams.truncate(self.config.max_log_streams);
                break;
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let target = limit.saturating_mul(2);
        let mut collected = Vec::new();

        for stream in &streams {
            let first = stream.first_event_timestamp.unwrap_or(0);
            let last = stream.last_event_timestamp.unwrap_or(0);
            if !range.overlaps(first, last) {
                continue;
            }
            if collected.len() >= target {
                break;
            }
            self.read_stream(log_group, stream, range, target, &mut collected)
                .await;
        }

        collected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        collected.truncate(limit);
        Ok((collected, streams.len()))
    }

    async fn read_stream(
        &self,
        log_group: &str,
        stream: &LogStreamInfo,
        range: TimeRange,
        target: usize,
        collected: &mut Vec<LogEvent>,
    ) {
        let first = stream.first_event_timestamp.unwrap_or(0);
        let last = stream.last_event_timestamp.unwrap_or(0);
        let midpoint = range.midpoint();
        // Start from whichever end of the stream is closer to the window.
        let start_from_head = (midpoint - first) < (last - midpoint);

        let mut token: Option<String> = None;
        let mut read = 0usize;
        let mut found_in_range = false;

        while read < self.config.max_events_per_stream {
            let page_limit = (self.config.max_events_per_stream - read).min(MAX_EVENTS_PER_PAGE);
            let query = LogEventsQuery {
                log_group: log_group.to_string(),
                log_stream: stream.log_stream_name.clone(),
                start_from_head,
                limit: page_limit as u32,
                range: Some(range),
                next_token: token.clone(),
            };

            let page = match self.log_store.get_log_events(&query).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("Skipping log stream {}: {}", stream.log_stream_name, e);
                    return;
                }
            };
            if page.events.is_empty() {
                return;
            }

            read += page.events.len();
            let before = collected.len();
            collected.extend(
                page.events
                    .into_iter()
                    .filter(|e| range.contains(e.timestamp) && !e.message.trim().is_empty()),
            );

            if collected.len() > before {
                found_in_range = true;
            } else if found_in_range {
                // Walked out of the window.
                return;
            }

            if collected.len() >= target {
                return;
            }

            match page.next_forward_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                _ => return,
            }
        }
    }

    /// Start tailing a stream: the latest events first, then new events every interval
    pub fn tail(&self, request: TailRequest) -> TailSession {
        let (tx, rx) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settings = TailSettings {
            interval: request
                .interval
                .unwrap_or(self.config.log_poll_interval)
                .max(MIN_TAIL_INTERVAL),
            initial_events: self.config.initial_tail_events,
            batch_events: self.config.tail_batch_events,
        };

        info!(
            "Tailing {}/{} every {:?}",
            request.log_group, request.log_stream, settings.interval
        );
        let task = tokio::spawn(run_tail(
            self.log_store.clone(),
            request,
            settings,
            tx,
            shutdown_rx,
        ));

        TailSession {
            events: rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

fn bound(value: Option<&str>) -> Result<Option<i64>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => parse_timestamp(value).map(Some),
        None => Ok(None),
    }
}

/// Log group of the first container using the `awslogs` driver
fn log_group_of(definition: &TaskDefinition) -> Option<String> {
    definition
        .container_definitions
        .iter()
        .filter_map(|c| c.log_configuration.as_ref())
        .find_map(|l| l.awslogs_group())
        .map(str::to_string)
}

/// Resolves once shutdown is requested or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Send every event, returning false once the consumer is gone
async fn forward(tx: &mpsc::Sender<TailMessage>, events: Vec<LogEvent>) -> bool {
    for event in events {
        if tx.send(TailMessage::Event(event)).await.is_err() {
            return false;
        }
    }
    true
}

async fn run_tail(
    store: Arc<dyn LogStore>,
    request: TailRequest,
    settings: TailSettings,
    tx: mpsc::Sender<TailMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial = LogEventsQuery::tail(
        &request.log_group,
        &request.log_stream,
        settings.initial_events,
    );

    let result = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => return,
        _ = tx.closed() => return,
        result = store.get_log_events(&initial) => result,
    };

    let mut token = match result {
        Ok(page) => {
            if !forward(&tx, page.events).await {
                return;
            }
            page.next_forward_token
        }
        Err(e) => {
            warn!("Initial read of {} failed: {}", request.log_stream, e);
            let _ = tx
                .send(TailMessage::Error {
                    error: format!("Failed to get initial logs: {}", e),
                })
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tx.closed() => break,
            _ = sleep(settings.interval) => {}
        }

        let mut query = LogEventsQuery::tail(
            &request.log_group,
            &request.log_stream,
            settings.batch_events,
        );
        query.next_token = token.clone();

        let result = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tx.closed() => break,
            result = store.get_log_events(&query) => result,
        };

        match result {
            Ok(page) => {
                if page.events.is_empty() {
                    continue;
                }
                if page.next_forward_token.is_some() {
                    token = page.next_forward_token;
                }
                if !forward(&tx, page.events).await {
                    break;
                }
            }
            Err(e) => {
                warn!("Tail of {} failed: {}", request.log_stream, e);
                let _ = tx
                    .send(TailMessage::Error {
                        error: format!("Failed to fetch logs: {}", e),
                    })
                    .await;
                break;
            }
        }
    }

    debug!("Tail of {}/{} ended", request.log_group, request.log_stream);
}
