//! Configuration management for the control API
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use deploy_engine::EngineConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Deployment records kept in memory
    pub ledger_capacity: usize,

    /// Seconds between two live-tail polls
    pub log_poll_interval_secs: u64,

    /// Seconds an insights query may run before the stream fallback is used
    pub insights_timeout_secs: u64,

    /// Non-terminal records reconciled per history listing
    pub refresh_batch_limit: usize,

    /// Records returned by a history listing without `limit`
    pub history_default_limit: usize,
}

fn var_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: var_or("API_PORT", "8090")?,
            ledger_capacity: var_or("LEDGER_CAPACITY", "100")?,
            log_poll_interval_secs: var_or("LOG_POLL_INTERVAL_SECS", "3")?,
            insights_timeout_secs: var_or("INSIGHTS_TIMEOUT_SECS", "30")?,
            refresh_batch_limit: var_or("REFRESH_BATCH_LIMIT", "100")?,
            history_default_limit: var_or("HISTORY_DEFAULT_LIMIT", "50")?,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }
        if self.ledger_capacity == 0 {
            anyhow::bail!("LEDGER_CAPACITY must be greater than 0");
        }
        if self.log_poll_interval_secs == 0 {
            anyhow::bail!("LOG_POLL_INTERVAL_SECS must be greater than 0");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Engine tunables derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ledger_capacity: self.ledger_capacity,
            refresh_batch_limit: self.refresh_batch_limit,
            log_poll_interval: Duration::from_secs(self.log_poll_interval_secs),
            insights_timeout: Duration::from_secs(self.insights_timeout_secs),
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 9000,
            ledger_capacity: 100,
            log_poll_interval_secs: 3,
            insights_timeout_secs: 30,
            refresh_batch_limit: 100,
            history_default_limit: 50,
        }
    }

    #[test]
    fn test_api_address() {
        assert_eq!(config().api_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_invalid_port() {
        let mut config = config();
        config.api_port = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("API_PORT must be greater than 0"));
    }

    #[test]
    fn test_validate_zero_capacity() {
        let mut config = config();
        config.ledger_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_config_projection() {
        let mut config = config();
        config.log_poll_interval_secs = 7;
        config.insights_timeout_secs = 5;

        let engine = config.engine_config();
        assert_eq!(engine.log_poll_interval, Duration::from_secs(7));
        assert_eq!(engine.insights_timeout, Duration::from_secs(5));
        assert_eq!(engine.initial_tail_events, 50);
    }
}
