//! Engine tunables

use std::time::Duration;

use crate::ledger::DEFAULT_CAPACITY;

/// Knobs for the deployment engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of ledger records kept in memory
    pub ledger_capacity: usize,

    /// Maximum non-terminal records reconciled by one history listing
    pub refresh_batch_limit: usize,

    /// Delay between two polls of a live log tail
    pub log_poll_interval: Duration,

    /// Events sent when a live tail starts
    pub initial_tail_events: u32,

    /// Events fetched per live tail poll
    pub tail_batch_events: u32,

    /// Upper bound on an insights query, after which stream enumeration is used
    pub insights_timeout: Duration,

    /// Result cap of a single insights query
    pub insights_result_cap: usize,

    /// Window used when a historical query has no start or end
    pub history_window: Duration,

    /// Streams scanned by the stream-enumeration fallback
    pub max_log_streams: usize,

    /// Events read from a single stream by the fallback
    pub max_events_per_stream: usize,

    /// Live-digest probes of floating-tag services per cluster overview
    pub latest_digest_probes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_capacity: DEFAULT_CAPACITY,
            refresh_batch_limit: 100,
            log_poll_interval: Duration::from_secs(3),
            initial_tail_events: 50,
            tail_batch_events: 10,
            insights_timeout: Duration::from_secs(30),
            insights_result_cap: 10_000,
            history_window: Duration::from_secs(3600),
            max_log_streams: 100,
            max_events_per_stream: 10_000,
            latest_digest_probes: 10,
        }
    }
}
