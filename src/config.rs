//! Agent configuration
//!
//! All options are read from `TRANSFORMD_*` environment variables with the
//! documented defaults. Periods are given in seconds.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads for the async runtime.
    pub num_threads: usize,
    /// Normal re-examination spacing of a transform.
    pub poll_time_period: Duration,
    /// Re-examination spacing while an operator request is in flight.
    pub poll_operation_time_period: Duration,
    /// Batch size of one discovery sweep.
    pub retrieve_bulk_size: usize,
    /// Bulk-write hint handed to the store with each commit.
    pub message_bulk_size: usize,
    /// Consecutive handler failures before a transform is marked failed.
    pub retries: u32,
    /// Admission ceiling of the worker pool.
    pub max_number_workers: usize,
    /// Age beyond which an abandoned row lock is cleared.
    pub stale_lock_period: Duration,
    /// Opaque attribute bag handed to work plugins.
    pub agent_attributes: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: 1,
            poll_time_period: Duration::from_secs(1800),
            poll_operation_time_period: Duration::from_secs(240),
            retrieve_bulk_size: 10,
            message_bulk_size: 10_000,
            retries: 100,
            max_number_workers: 3,
            stale_lock_period: Duration::from_secs(3600),
            agent_attributes: serde_json::Value::Null,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_threads: env_parse("TRANSFORMD_NUM_THREADS", defaults.num_threads),
            poll_time_period: env_secs("TRANSFORMD_POLL_TIME_PERIOD", defaults.poll_time_period),
            poll_operation_time_period: env_secs(
                "TRANSFORMD_POLL_OPERATION_TIME_PERIOD",
                defaults.poll_operation_time_period,
            ),
            retrieve_bulk_size: env_parse(
                "TRANSFORMD_RETRIEVE_BULK_SIZE",
                defaults.retrieve_bulk_size,
            ),
            message_bulk_size: env_parse(
                "TRANSFORMD_MESSAGE_BULK_SIZE",
                defaults.message_bulk_size,
            ),
            retries: env_parse("TRANSFORMD_RETRIES", defaults.retries),
            max_number_workers: env_parse(
                "TRANSFORMD_MAX_NUMBER_WORKERS",
                defaults.max_number_workers,
            ),
            stale_lock_period: env_secs(
                "TRANSFORMD_STALE_LOCK_PERIOD",
                defaults.stale_lock_period,
            ),
            agent_attributes: std::env::var("TRANSFORMD_AGENT_ATTRIBUTES")
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(defaults.agent_attributes),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map_or(default, Duration::from_secs)
}
