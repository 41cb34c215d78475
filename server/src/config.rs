//! Configuration management for the server.

use std::env;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::sync::SyncSettings;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin server host address
    pub host: String,
    /// Admin server port
    pub port: u16,
    /// PostgreSQL connection URL (durable store)
    pub database_url: String,
    /// Redis connection URL (primary store)
    pub redis_url: String,
    /// Time between reconciliation cycles
    pub sync_interval: Duration,
    /// Backoff policy for establishing store connections at startup
    pub connect_retry: RetryPolicy,
    /// Counter gap above which a reconciliation is logged as a warning
    pub counter_gap_alert: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let interval_secs: u64 = parse_var("SYNC_INTERVAL_SECS", 30)?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid("SYNC_INTERVAL_SECS"));
        }

        let connect_retry = RetryPolicy {
            max_attempts: parse_var("CONNECT_MAX_ATTEMPTS", 5)?,
            base_delay: Duration::from_millis(parse_var("CONNECT_BASE_DELAY_MS", 500)?),
            ..RetryPolicy::default()
        };

        let counter_gap_alert = parse_var("COUNTER_GAP_ALERT", 1000)?;

        Ok(Self {
            host,
            port,
            database_url,
            redis_url,
            sync_interval: Duration::from_secs(interval_secs),
            connect_retry,
            counter_gap_alert,
        })
    }

    /// Settings handed to the sync service.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: self.sync_interval,
            counter_gap_alert: self.counter_gap_alert,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {0}")]
    Invalid(&'static str),
}
