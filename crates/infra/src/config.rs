//! Projector configuration, read from the process environment.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use readmodel_events::{EmptyToken, EndOfStreamToken};

use crate::workers::SupervisorConfig;

pub const SERVICE_NAME: &str = "SERVICE_NAME";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const READ_MODEL_COLLECTION: &str = "READ_MODEL_COLLECTION";
pub const REDIS_URL: &str = "REDIS_URL";
pub const EVENT_STREAM_KEY: &str = "EVENT_STREAM_KEY";
pub const EVENT_CONSUMER_GROUP: &str = "EVENT_CONSUMER_GROUP";
pub const EVENT_CONSUMER_NAME: &str = "EVENT_CONSUMER_NAME";
pub const END_OF_STREAM_TOKEN: &str = "END_OF_STREAM_TOKEN";
pub const DATABASE_CONNECTION_TIMEOUT_MS: &str = "DATABASE_CONNECTION_TIMEOUT_MS";
pub const SUPERVISOR_LANES: &str = "SUPERVISOR_LANES";
pub const SHUTDOWN_GRACE_MS: &str = "SHUTDOWN_GRACE_MS";
pub const CLAIM_MIN_IDLE_MS: &str = "CLAIM_MIN_IDLE_MS";

const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3000;
const DEFAULT_LANES: usize = 16;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;
const DEFAULT_CLAIM_MIN_IDLE_MS: u64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    Missing(&'static str),

    #[error("environment variable {var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl From<EmptyToken> for ConfigError {
    fn from(err: EmptyToken) -> Self {
        ConfigError::Invalid {
            var: END_OF_STREAM_TOKEN,
            reason: err.to_string(),
        }
    }
}

/// Everything the projector binary needs to start.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub service_name: String,
    pub database_url: String,
    pub collection: String,
    pub database_connection_timeout: Duration,
    pub redis_url: String,
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub end_of_stream: EndOfStreamToken,
    pub lanes: usize,
    pub shutdown_grace: Duration,
    /// Idle time after which another consumer's pending entries are claimed.
    pub claim_min_idle: Duration,
}

impl ProjectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| -> Result<String, ConfigError> {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let service_name = required(SERVICE_NAME)?;
        let database_url = required(DATABASE_URL)?;
        let collection = required(READ_MODEL_COLLECTION)?;
        let redis_url = required(REDIS_URL)?;
        let stream_key = required(EVENT_STREAM_KEY)?;
        let consumer_group = required(EVENT_CONSUMER_GROUP)?;
        let end_of_stream = EndOfStreamToken::new(required(END_OF_STREAM_TOKEN)?)?;

        let consumer_name = lookup(EVENT_CONSUMER_NAME)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", service_name, Uuid::now_v7()));

        let timeout_ms = parse_or_default(
            &lookup,
            DATABASE_CONNECTION_TIMEOUT_MS,
            DEFAULT_CONNECTION_TIMEOUT_MS,
        );
        let lanes = match parse_or_default(&lookup, SUPERVISOR_LANES, DEFAULT_LANES) {
            0 => {
                warn!(var = SUPERVISOR_LANES, "lane count must be positive; using default");
                DEFAULT_LANES
            }
            n => n,
        };
        let grace_ms = parse_or_default(&lookup, SHUTDOWN_GRACE_MS, DEFAULT_SHUTDOWN_GRACE_MS);
        let claim_ms = parse_or_default(&lookup, CLAIM_MIN_IDLE_MS, DEFAULT_CLAIM_MIN_IDLE_MS);

        Ok(Self {
            service_name,
            database_url,
            collection,
            database_connection_timeout: Duration::from_millis(timeout_ms),
            redis_url,
            stream_key,
            consumer_group,
            consumer_name,
            end_of_stream,
            lanes,
            shutdown_grace: Duration::from_millis(grace_ms),
            claim_min_idle: Duration::from_millis(claim_ms),
        })
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::default()
            .with_name(self.service_name.clone())
            .with_lanes(self.lanes)
            .with_shutdown_grace(self.shutdown_grace)
    }

    #[cfg(feature = "redis")]
    pub fn redis_streams_config(&self) -> crate::event_bus::RedisStreamsConfig {
        crate::event_bus::RedisStreamsConfig::new(
            self.stream_key.clone(),
            self.consumer_group.clone(),
            self.consumer_name.clone(),
            self.end_of_stream.clone(),
        )
        .with_claim_min_idle(self.claim_min_idle)
    }
}

/// Optional numeric variable; unparsable values fall back to the default.
fn parse_or_default<F, T>(lookup: &F, var: &'static str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(var) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var, value = %raw, "invalid value; using default");
            default
        }),
    }
}
