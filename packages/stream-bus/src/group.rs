//! Consumer group coordination.
//!
//! [`join`] makes sure the stream and the group exist, then hands back a
//! [`Consumer`] bound to `(stream, group, consumer_name)`. Creation is
//! "create if missing": a second process joining an existing group is the
//! normal case, not an error, and any number of processes may join at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{BusError, StoreError};
use crate::retry::RetryPolicy;
use crate::store::{GroupStatus, LogStore, SequenceId, StartPosition, StreamEntry};

/// A member of a consumer group.
///
/// Holds no durable state: what it was given and what it acknowledged lives in
/// the group's pending ledger in the store.
pub struct Consumer<S: LogStore> {
    store: Arc<S>,
    stream: String,
    group: String,
    name: String,
}

impl<S: LogStore> Clone for Consumer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            name: self.name.clone(),
        }
    }
}

impl<S: LogStore> std::fmt::Debug for Consumer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("name", &self.name)
            .finish()
    }
}

impl<S: LogStore> Consumer<S> {
    /// Stream key this consumer reads.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Group this consumer belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Consumer name within the group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store connection this consumer uses.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Fetch up to `max_count` new entries, waiting at most `block_timeout`.
    pub async fn fetch(
        &self,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.store
            .read_group(&self.stream, &self.group, &self.name, max_count, block_timeout)
            .await
    }

    /// Acknowledge a processed entry. Acknowledging twice is harmless.
    pub async fn acknowledge(&self, id: SequenceId) -> Result<bool, StoreError> {
        self.store.acknowledge(&self.stream, &self.group, id).await
    }

    /// Re-create the group if it disappeared (for example, the stream key was deleted).
    pub async fn rejoin(&self) -> Result<GroupStatus, StoreError> {
        self.store
            .ensure_group(&self.stream, &self.group, StartPosition::Beginning)
            .await
    }
}

/// Join `group` on `stream` as `consumer_name`.
///
/// Creates the group at the beginning of the stream's history when it does
/// not exist yet, so entries appended before the first member started are not
/// missed.
pub async fn join<S: LogStore>(
    store: Arc<S>,
    stream: &str,
    group: &str,
    consumer_name: &str,
) -> Result<Consumer<S>, BusError> {
    validate_name("stream", stream)?;
    validate_name("group", group)?;
    validate_name("consumer", consumer_name)?;

    match store
        .ensure_group(stream, group, StartPosition::Beginning)
        .await?
    {
        GroupStatus::Created => info!(stream, group, consumer = consumer_name, "consumer group created"),
        GroupStatus::AlreadyExists => {
            debug!(stream, group, consumer = consumer_name, "joined existing consumer group")
        }
    }

    Ok(Consumer {
        store,
        stream: stream.to_string(),
        group: group.to_string(),
        name: consumer_name.to_string(),
    })
}

/// [`join`], retrying transient store failures according to `policy`.
pub async fn join_with_retry<S: LogStore>(
    store: Arc<S>,
    stream: &str,
    group: &str,
    consumer_name: &str,
    policy: &RetryPolicy,
) -> Result<Consumer<S>, BusError> {
    let mut failures = 0;
    loop {
        match join(store.clone(), stream, group, consumer_name).await {
            Err(e) if e.is_retryable() && policy.should_retry(failures) => {
                let delay = policy.delay_for(failures);
                failures += 1;
                warn!(stream, group, error = %e, delay_ms = delay.as_millis() as u64, "join failed, retrying");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

fn validate_name(kind: &str, value: &str) -> Result<(), BusError> {
    if value.trim().is_empty() {
        return Err(BusError::Config(format!("{} name must not be empty", kind)));
    }
    Ok(())
}
