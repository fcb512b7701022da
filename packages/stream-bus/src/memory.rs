//! In-memory [`LogStore`] for tests and local runs.
//!
//! Models the parts of a consumer-group log the bus relies on: monotonically
//! increasing ids, a per-group delivery cursor, a pending ledger with idle
//! timers and delivery counts, and blocking reads that wake on append.
//!
//! Idle times run on the tokio clock, so tests can pause time and advance past
//! a liveness threshold without sleeping.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::{
    ClaimBatch, GroupStatus, LogStore, PendingEntry, SequenceId, StartPosition, StreamEntry,
};

const NOGROUP: &str = "NOGROUP No such key or consumer group";

struct Delivery {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupLedger {
    last_delivered: SequenceId,
    pending: BTreeMap<SequenceId, Delivery>,
}

#[derive(Default)]
struct StreamLog {
    entries: BTreeMap<SequenceId, Vec<u8>>,
    last_id: SequenceId,
    groups: HashMap<String, GroupLedger>,
}

impl StreamLog {
    fn next_id(&self) -> SequenceId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now > self.last_id.millis {
            SequenceId::new(now, 0)
        } else {
            SequenceId::new(self.last_id.millis, self.last_id.seq + 1)
        }
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    faults: VecDeque<StoreError>,
}

impl State {
    fn ledger(&mut self, stream: &str, group: &str) -> Result<&mut StreamLog, StoreError> {
        match self.streams.get_mut(stream) {
            Some(log) if log.groups.contains_key(group) => Ok(log),
            _ => Err(StoreError::unavailable(stream, NOGROUP)),
        }
    }
}

/// In-memory log store.
#[derive(Default)]
pub struct InMemoryLogStore {
    state: Mutex<State>,
    appended: Notify,
}

impl InMemoryLogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next store call fail with `error`.
    ///
    /// Queued faults are consumed in order, one per call.
    pub fn fail_next(&self, error: StoreError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push_back(error);
        }
    }

    /// All entries currently in `stream`, acknowledged or not.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.state
            .lock()
            .map(|state| {
                state
                    .streams
                    .get(stream)
                    .map(|log| {
                        log.entries
                            .iter()
                            .map(|(id, body)| StreamEntry {
                                id: *id,
                                body: body.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Names of the groups defined on `stream`, sorted.
    pub fn groups(&self, stream: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .map(|state| {
                state
                    .streams
                    .get(stream)
                    .map(|log| log.groups.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Remove an entry from the stream, leaving any pending reference dangling.
    pub fn delete(&self, stream: &str, id: SequenceId) -> bool {
        self.state
            .lock()
            .map(|mut state| {
                state
                    .streams
                    .get_mut(stream)
                    .map(|log| log.entries.remove(&id).is_some())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Drop the whole stream, groups included.
    pub fn remove_stream(&self, stream: &str) -> bool {
        self.state
            .lock()
            .map(|mut state| state.streams.remove(stream).is_some())
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::connection(format!("mutex poisoned: {}", e)))?;
        match state.faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(state),
        }
    }

    fn take_undelivered(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut state = self.lock()?;
        let log = state.ledger(stream, group)?;
        let Some(ledger) = log.groups.get_mut(group) else {
            return Err(StoreError::unavailable(stream, NOGROUP));
        };

        let now = Instant::now();
        let cursor = ledger.last_delivered;
        let mut batch = Vec::new();
        for (id, body) in log
            .entries
            .range(cursor..)
            .filter(|(id, _)| **id > cursor)
            .take(max_count)
        {
            ledger.pending.insert(
                *id,
                Delivery {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            batch.push(StreamEntry {
                id: *id,
                body: body.clone(),
            });
        }
        if let Some(last) = batch.last() {
            ledger.last_delivered = last.id;
        }
        Ok(batch)
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, stream: &str, body: &[u8]) -> Result<SequenceId, StoreError> {
        let id = {
            let mut state = self.lock()?;
            let log = state.streams.entry(stream.to_string()).or_default();
            let id = log.next_id();
            log.entries.insert(id, body.to_vec());
            log.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupStatus, StoreError> {
        let mut state = self.lock()?;
        let log = state.streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }
        let last_delivered = match start {
            StartPosition::Beginning => SequenceId::ZERO,
            StartPosition::Latest => log.last_id,
        };
        log.groups.insert(
            group.to_string(),
            GroupLedger {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupStatus::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        // Timeouts too large to add to the clock wait without a deadline.
        let deadline = Instant::now().checked_add(block_timeout);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_undelivered(stream, group, consumer, max_count)?;
            if !batch.is_empty() || block_timeout.is_zero() {
                return Ok(batch);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        id: SequenceId,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        Ok(state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .map(|ledger| ledger.pending.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn read_backlog(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: SequenceId,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut state = self.lock()?;
        let log = state.ledger(stream, group)?;
        let Some(ledger) = log.groups.get_mut(group) else {
            return Err(StoreError::unavailable(stream, NOGROUP));
        };

        let now = Instant::now();
        let mut batch = Vec::new();
        for (id, delivery) in ledger.pending.iter_mut() {
            if batch.len() == max_count {
                break;
            }
            if *id <= after || delivery.consumer != consumer {
                continue;
            }
            let Some(body) = log.entries.get(id) else {
                continue;
            };
            delivery.delivered_at = now;
            delivery.delivery_count += 1;
            batch.push(StreamEntry {
                id: *id,
                body: body.clone(),
            });
        }
        Ok(batch)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: SequenceId,
        max_count: usize,
    ) -> Result<ClaimBatch, StoreError> {
        let mut state = self.lock()?;
        let log = state.ledger(stream, group)?;
        let Some(ledger) = log.groups.get_mut(group) else {
            return Err(StoreError::unavailable(stream, NOGROUP));
        };

        let now = Instant::now();
        let mut claim = ClaimBatch::default();
        let mut scanned_to = None;
        for (id, delivery) in ledger.pending.range_mut(cursor..) {
            if claim.entries.len() == max_count {
                break;
            }
            scanned_to = Some(*id);
            let Some(body) = log.entries.get(id) else {
                claim.deleted.push(*id);
                continue;
            };
            if now.duration_since(delivery.delivered_at) < min_idle {
                continue;
            }
            delivery.consumer = consumer.to_string();
            delivery.delivered_at = now;
            delivery.delivery_count += 1;
            claim.entries.push(StreamEntry {
                id: *id,
                body: body.clone(),
            });
        }

        for id in &claim.deleted {
            ledger.pending.remove(id);
        }
        claim.next_cursor = scanned_to
            .and_then(|last| {
                ledger
                    .pending
                    .range(last..)
                    .map(|(id, _)| *id)
                    .find(|id| *id > last)
            })
            .unwrap_or(SequenceId::ZERO);
        Ok(claim)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        max_count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut state = self.lock()?;
        let log = state.ledger(stream, group)?;
        let Some(ledger) = log.groups.get(group) else {
            return Err(StoreError::unavailable(stream, NOGROUP));
        };

        let now = Instant::now();
        Ok(ledger
            .pending
            .iter()
            .take(max_count)
            .map(|(id, delivery)| PendingEntry {
                id: *id,
                consumer: delivery.consumer.clone(),
                idle: now.duration_since(delivery.delivered_at),
                delivery_count: delivery.delivery_count,
            })
            .collect())
    }
}

impl std::fmt::Debug for InMemoryLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let streams = self
            .state
            .lock()
            .map(|state| state.streams.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryLogStore")
            .field("streams", &streams)
            .finish()
    }
}
