//! Runtime configuration, read from `RECOPY_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::webhook::DEFAULT_MAX_FAILURES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Collaboration server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous connections per site
    pub max_peers_per_site: usize,
    /// Frames a slow peer may fall behind before losing some
    pub broadcast_capacity: usize,
    /// Server-initiated WebSocket ping interval
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory
    pub storage_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_site: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: PathBuf::from("recopy_data"),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: optional_trimmed(&lookup, "RECOPY_BIND_ADDR")
                .unwrap_or(defaults.bind_addr),
            max_peers_per_site: parse_positive(
                &lookup,
                "RECOPY_MAX_PEERS_PER_SITE",
                defaults.max_peers_per_site as u64,
            )? as usize,
            broadcast_capacity: parse_positive(
                &lookup,
                "RECOPY_BROADCAST_CAPACITY",
                defaults.broadcast_capacity as u64,
            )? as usize,
            heartbeat_interval_secs: parse_positive(
                &lookup,
                "RECOPY_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            storage_path: optional_trimmed(&lookup, "RECOPY_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
        })
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deadline for a regular delivery
    pub timeout: Duration,
    /// Deadline for a test delivery
    pub test_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How often the retry scheduler looks for due jobs
    pub retry_poll_interval: Duration,
    /// Due jobs taken per poll
    pub retry_batch_size: usize,
    /// `max_failures` for webhooks registered without one
    pub default_max_failures: u32,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(1_000),
            backoff_cap: Duration::from_millis(300_000),
            retry_poll_interval: Duration::from_millis(1_000),
            retry_batch_size: 64,
            default_max_failures: DEFAULT_MAX_FAILURES,
            user_agent: "ReCopyFast-Webhooks/1.0".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_failures = parse_positive(
            &lookup,
            "RECOPY_WEBHOOK_MAX_FAILURES",
            defaults.default_max_failures as u64,
        )?;
        let default_max_failures = u32::try_from(max_failures).map_err(|_| {
            ConfigError::Invalid("RECOPY_WEBHOOK_MAX_FAILURES is too large".to_string())
        })?;

        Ok(Self {
            timeout: Duration::from_secs(parse_positive(
                &lookup,
                "RECOPY_WEBHOOK_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            test_timeout: Duration::from_secs(parse_positive(
                &lookup,
                "RECOPY_WEBHOOK_TEST_TIMEOUT_SECS",
                defaults.test_timeout.as_secs(),
            )?),
            retry_poll_interval: Duration::from_millis(parse_positive(
                &lookup,
                "RECOPY_RETRY_POLL_MS",
                defaults.retry_poll_interval.as_millis() as u64,
            )?),
            default_max_failures,
            ..defaults
        })
    }
}

fn parse_positive(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid(format!(
            "{name} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
