//! Log storage collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::page::Page;

/// A log stream and the time span of its events (epoch millis)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamInfo {
    pub log_stream_name: String,

    #[serde(default)]
    pub first_event_timestamp: Option<i64>,

    #[serde(default)]
    pub last_event_timestamp: Option<i64>,
}

/// A single log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub message: String,

    /// Epoch millis
    pub timestamp: i64,
}

/// Inclusive time window in epoch millis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start_ms && timestamp <= self.end_ms
    }

    pub fn midpoint(&self) -> i64 {
        self.start_ms + (self.end_ms - self.start_ms) / 2
    }

    /// True when a stream spanning `[first, last]` has events inside the window
    pub fn overlaps(&self, first: i64, last: i64) -> bool {
        !(last < self.start_ms || first > self.end_ms)
    }
}

/// Parameters of a `get_log_events` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEventsQuery {
    pub log_group: String,
    pub log_stream: String,
    pub start_from_head: bool,
    pub limit: u32,
    pub range: Option<TimeRange>,
    pub next_token: Option<String>,
}

impl LogEventsQuery {
    pub fn tail(log_group: &str, log_stream: &str, limit: u32) -> Self {
        Self {
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
            start_from_head: false,
            limit,
            range: None,
            next_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEventsPage {
    pub events: Vec<LogEvent>,

    #[serde(default)]
    pub next_forward_token: Option<String>,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Streams of a group ordered by last event time, newest first
    async fn describe_log_streams(
        &self,
        log_group: &str,
        next_token: Option<String>,
    ) -> Result<Page<LogStreamInfo>>;

    async fn get_log_events(&self, query: &LogEventsQuery) -> Result<LogEventsPage>;

    /// Run an insights query to completion; may take several seconds
    async fn run_insights_query(
        &self,
        log_group: &str,
        range: TimeRange,
        query: &str,
        limit: usize,
    ) -> Result<Vec<LogEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_overlap() {
        let range = TimeRange {
            start_ms: 1_000,
            end_ms: 2_000,
        };
        assert!(range.overlaps(500, 1_000));
        assert!(range.overlaps(1_500, 3_000));
        assert!(!range.overlaps(100, 999));
        assert!(!range.overlaps(2_001, 2_500));
        assert_eq!(range.midpoint(), 1_500);
        assert!(range.contains(2_000));
        assert!(!range.contains(2_001));
    }
}
