//! Delivery modes and best-effort duplicate suppression.
//!
//! The bus delivers at least once. Handlers that cannot tolerate duplicates
//! can run the consumer in [`DeliveryMode::EffectivelyOnce`]: the loop records
//! each envelope id it processed successfully in a [`DedupeStore`] and
//! acknowledges later deliveries of the same id without dispatching them.
//!
//! This narrows the duplicate window, it does not close it. Two members that
//! receive the same envelope concurrently (for example after a reclaim) can
//! both dispatch it before either records it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;

/// How the consumer loop treats repeated deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Dispatch every delivery. Handlers must be idempotent.
    #[default]
    AtLeastOnce,
    /// Skip envelopes whose id was already processed within the dedupe TTL.
    EffectivelyOnce,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::AtLeastOnce => write!(f, "at-least-once"),
            DeliveryMode::EffectivelyOnce => write!(f, "effectively-once"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "at-least-once" => Ok(DeliveryMode::AtLeastOnce),
            "effectively-once" => Ok(DeliveryMode::EffectivelyOnce),
            other => Err(format!(
                "unknown delivery mode {:?} (expected at-least-once or effectively-once)",
                other
            )),
        }
    }
}

/// Key under which a processed envelope id is remembered.
pub fn dedupe_key(stream: &str, envelope_id: &str) -> String {
    format!("{}:dedupe:{}", stream, envelope_id)
}

/// Storage for processed-envelope markers.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Whether `key` was marked and has not expired.
    async fn is_processed(&self, key: &str) -> Result<bool, StoreError>;

    /// Mark `key` as processed for `ttl`.
    async fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

/// Process-local [`DedupeStore`] with expiring keys.
#[derive(Debug, Default)]
pub struct InMemoryDedupe {
    keys: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedupe {
    /// Create an empty marker set.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupeStore for InMemoryDedupe {
    async fn is_processed(&self, key: &str) -> Result<bool, StoreError> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|e| StoreError::connection(format!("mutex poisoned: {}", e)))?;
        let now = Instant::now();
        keys.retain(|_, expires_at| *expires_at > now);
        Ok(keys.contains_key(key))
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|e| StoreError::connection(format!("mutex poisoned: {}", e)))?;
        keys.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }
}
