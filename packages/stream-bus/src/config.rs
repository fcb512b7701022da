use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use uuid::Uuid;

use crate::consumer::{ConsumerConfig, RecoveryConfig};
use crate::dedupe::DeliveryMode;
use crate::error::BusError;

/// Bus configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub redis_url: String,
    pub prefix: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub delivery: DeliveryMode,
    pub dedupe_ttl: Duration,
    pub reclaim_min_idle: Duration,
    pub reclaim_interval: Duration,
}

impl BusConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BusError> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let redis_url = lookup("STREAM_BUS_REDIS_URL")
            .or_else(|| lookup("REDIS_URL"))
            .unwrap_or_else(|| "redis://localhost:6379".to_string());
        let consumer = lookup("STREAM_BUS_CONSUMER")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        let config = Self {
            redis_url,
            prefix: lookup("STREAM_BUS_PREFIX").unwrap_or_else(|| "stream-bus:".to_string()),
            group: lookup("STREAM_BUS_GROUP").unwrap_or_else(|| "default".to_string()),
            consumer,
            batch_size: parse(&lookup, "STREAM_BUS_COUNT", 1)?,
            block_timeout: Duration::from_millis(parse(&lookup, "STREAM_BUS_BLOCK_MS", 5_000)?),
            delivery: parse(&lookup, "STREAM_BUS_DELIVERY", DeliveryMode::AtLeastOnce)?,
            dedupe_ttl: Duration::from_secs(parse(&lookup, "STREAM_BUS_DEDUPE_TTL", 86_400)?),
            reclaim_min_idle: Duration::from_millis(parse(
                &lookup,
                "STREAM_BUS_RECLAIM_IDLE_MS",
                60_000,
            )?),
            reclaim_interval: Duration::from_millis(parse(
                &lookup,
                "STREAM_BUS_RECLAIM_INTERVAL_MS",
                30_000,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Store key for a topic such as `events:outbound`.
    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    /// Consumer loop settings derived from this configuration.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size,
            block_timeout: self.block_timeout,
            recovery: Some(RecoveryConfig {
                min_idle: self.reclaim_min_idle,
                interval: self.reclaim_interval,
                ..Default::default()
            }),
            delivery: self.delivery,
            dedupe_ttl: self.dedupe_ttl,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), BusError> {
        if self.group.trim().is_empty() {
            return Err(BusError::Config("STREAM_BUS_GROUP must not be empty".into()));
        }
        if self.consumer.trim().is_empty() {
            return Err(BusError::Config(
                "STREAM_BUS_CONSUMER must not be empty".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(BusError::Config("STREAM_BUS_COUNT must be at least 1".into()));
        }
        if self.block_timeout.is_zero() {
            return Err(BusError::Config(
                "STREAM_BUS_BLOCK_MS must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, BusError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BusError::Config(format!("{} is invalid ({:?}): {}", key, raw, e))),
    }
}
