//! Process configuration read from the environment (after `dotenvy`).

use std::time::Duration;

use thiserror::Error;

use crate::messaging::{BackoffPolicy, DEFAULT_PUBLISH_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is not a valid number: {value}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Postgres URL; absent means the in-memory store.
    pub database_url: Option<String>,
    pub nats_url: String,
    pub bus_client_name: String,
    pub port: u16,
    pub reconnect_attempts: u32,
    pub backoff_base: Duration,
    /// Upper bound on a single bus publish.
    pub publish_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            bus_client_name: "e_commerce_updates".to_string(),
            port: 8083,
            reconnect_attempts: 5,
            backoff_base: Duration::from_secs(2),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            nats_url: lookup("NATS_URL").unwrap_or(defaults.nats_url),
            bus_client_name: lookup("BUS_CLIENT_NAME").unwrap_or(defaults.bus_client_name),
            port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
            reconnect_attempts: parse(&lookup, "BUS_RECONNECT_ATTEMPTS")?.unwrap_or(defaults.reconnect_attempts),
            backoff_base: parse::<u64>(&lookup, "BUS_BACKOFF_BASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff_base),
            publish_timeout: parse::<u64>(&lookup, "BUS_PUBLISH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_timeout),
        })
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.reconnect_attempts)
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}
