//! The consumer loop.
//!
//! A [`ConsumerLoop`] drives one group member through
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//! Recovering ─► Idle ─► Fetching ─► Dispatching ─► Acknowledging
//!    ▲                                  │
//!    └── every reclaim interval ◄───────┘
//! ```
//!
//! # Guarantees
//!
//! - **At-least-once**: an entry is acknowledged only after its handler
//!   returned `Ok`. Failed, malformed and abandoned entries stay in the
//!   group's pending ledger.
//! - **Redelivery**: pending entries idle longer than
//!   [`RecoveryConfig::min_idle`] are reclaimed by whichever member scans
//!   first, this one included. Handlers must be idempotent or deduplicate on
//!   [`Envelope::id`].
//! - **No false completion on shutdown**: when the cancellation token fires
//!   while a handler runs, the handler future is dropped and its entry is not
//!   acknowledged. Entries a cancelled fetch already assigned to this member
//!   stay pending and come back through backlog replay or reclaim.
//!
//! # Errors
//!
//! Decode failures and handler failures are per-entry: logged, counted in
//! [`LoopStats`], never fatal (unless `stop_on_error` is set). Log store
//! connection failures back off according to the [`RetryPolicy`]. A stream
//! that is unavailable and whose group cannot be re-created ends the loop.
//! After a survived store error the loop replays this member's own backlog
//! before fetching again, so a batch cut short by a failed acknowledgement is
//! finished without waiting for reclaim.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dedupe::{dedupe_key, DedupeStore, DeliveryMode};
use crate::envelope::Envelope;
use crate::error::{BusError, StoreError};
use crate::group::Consumer;
use crate::retry::RetryPolicy;
use crate::store::{GroupStatus, LogStore, SequenceId, StreamEntry};

// =============================================================================
// Handler
// =============================================================================

/// Application code invoked once per delivered envelope.
///
/// Return `Ok(())` only when the work is done; the entry is acknowledged right
/// after. Any error leaves the entry pending for redelivery.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Process one envelope.
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: EnvelopeHandler + ?Sized> EnvelopeHandler for Arc<H> {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        (**self).handle(envelope).await
    }
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as an [`EnvelopeHandler`].
///
/// ```ignore
/// let handler = handler_fn(|envelope: Envelope| async move {
///     println!("{}", envelope.id);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for HandlerFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        (self.f)(envelope.clone()).await
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Crash recovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// How long an entry may sit unacknowledged before another member may
    /// take it over.
    pub min_idle: Duration,
    /// How often to scan the pending ledger for stale entries.
    pub interval: Duration,
    /// Maximum entries claimed or replayed per scan.
    pub batch_size: usize,
    /// Replay this member's own pending entries on startup.
    pub replay_backlog: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_idle: Duration::from_secs(60),
            interval: Duration::from_secs(30),
            batch_size: 10,
            replay_backlog: true,
        }
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Maximum entries per fetch.
    pub batch_size: usize,
    /// Upper bound on one blocking fetch. Also bounds shutdown latency when
    /// the store cannot be interrupted.
    pub block_timeout: Duration,
    /// Backoff for log store connection failures.
    pub retry: RetryPolicy,
    /// Crash recovery. `None` disables startup backlog replay and reclaim.
    /// The loop still replays its own backlog after a log store error.
    pub recovery: Option<RecoveryConfig>,
    /// Acknowledge successfully handled entries. Off only for inspection runs.
    pub acknowledge: bool,
    /// End the loop on the first handler failure.
    pub stop_on_error: bool,
    /// Duplicate handling.
    pub delivery: DeliveryMode,
    /// How long processed envelope ids are remembered in effectively-once mode.
    pub dedupe_ttl: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            block_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            recovery: Some(RecoveryConfig::default()),
            acknowledge: true,
            stop_on_error: false,
            delivery: DeliveryMode::AtLeastOnce,
            dedupe_ttl: Duration::from_secs(86_400),
        }
    }
}

// =============================================================================
// State and Stats
// =============================================================================

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Between iterations, or stopped.
    Idle,
    /// Waiting on a blocking fetch.
    Fetching,
    /// Decoding entries and running the handler.
    Dispatching,
    /// Acknowledging a handled entry.
    Acknowledging,
    /// Replaying the backlog or reclaiming stale entries.
    Recovering,
}

/// Counters for what the loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Entries received from fetches.
    pub fetched: u64,
    /// Entries received from backlog replay.
    pub replayed: u64,
    /// Entries taken over from idle members.
    pub reclaimed: u64,
    /// Handler invocations that returned `Ok`.
    pub handled: u64,
    /// Entries acknowledged.
    pub acknowledged: u64,
    /// Handler invocations that returned an error.
    pub handler_failures: u64,
    /// Entries that could not be decoded.
    pub malformed: u64,
    /// Entries skipped as already processed.
    pub duplicates: u64,
    /// Handler invocations dropped by shutdown.
    pub abandoned: u64,
    /// Log store failures absorbed by backoff.
    pub store_errors: u64,
}

impl LoopStats {
    fn since(&self, before: &LoopStats) -> LoopStats {
        LoopStats {
            fetched: self.fetched - before.fetched,
            replayed: self.replayed - before.replayed,
            reclaimed: self.reclaimed - before.reclaimed,
            handled: self.handled - before.handled,
            acknowledged: self.acknowledged - before.acknowledged,
            handler_failures: self.handler_failures - before.handler_failures,
            malformed: self.malformed - before.malformed,
            duplicates: self.duplicates - before.duplicates,
            abandoned: self.abandoned - before.abandoned,
            store_errors: self.store_errors - before.store_errors,
        }
    }
}

enum Outcome {
    Done,
    Abandoned,
}

// =============================================================================
// Consumer Loop
// =============================================================================

/// Fetch, decode, dispatch, acknowledge; repeat until cancelled.
pub struct ConsumerLoop<S: LogStore, H: EnvelopeHandler> {
    consumer: Consumer<S>,
    handler: H,
    config: ConsumerConfig,
    dedupe: Option<Arc<dyn DedupeStore>>,
    state: LoopState,
    claim_cursor: SequenceId,
    stats: LoopStats,
}

impl<S: LogStore, H: EnvelopeHandler> ConsumerLoop<S, H> {
    /// Create a loop for `consumer` dispatching to `handler`.
    pub fn new(consumer: Consumer<S>, handler: H, config: ConsumerConfig) -> Self {
        Self {
            consumer,
            handler,
            config,
            dedupe: None,
            state: LoopState::Idle,
            claim_cursor: SequenceId::ZERO,
            stats: LoopStats::default(),
        }
    }

    /// Use `dedupe` to remember processed envelope ids.
    ///
    /// Required for [`DeliveryMode::EffectivelyOnce`].
    pub fn with_dedupe(mut self, dedupe: Arc<dyn DedupeStore>) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Totals since the loop was created.
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// The group member this loop drives.
    pub fn consumer(&self) -> &Consumer<S> {
        &self.consumer
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Returns the accumulated stats on clean shutdown. Returns an error for
    /// invalid configuration, an unavailable stream, an exhausted retry budget,
    /// or a handler failure when `stop_on_error` is set.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<LoopStats, BusError> {
        self.validate()?;
        info!(
            stream = self.consumer.stream(),
            group = self.consumer.group(),
            consumer = self.consumer.name(),
            batch_size = self.config.batch_size,
            delivery = %self.config.delivery,
            "consumer loop starting"
        );

        let mut failures = 0u32;
        let mut next_reclaim = self.config.recovery.as_ref().map(|_| Instant::now());
        let mut replay_due = self
            .config
            .recovery
            .as_ref()
            .is_some_and(|recovery| recovery.replay_backlog);

        while !shutdown.is_cancelled() {
            if replay_due {
                match self.replay_backlog(&shutdown).await {
                    Ok(_) => replay_due = false,
                    Err(e) => {
                        self.absorb(e, &mut failures, &shutdown).await?;
                        continue;
                    }
                }
            }

            if let Some(due) = next_reclaim.filter(|due| Instant::now() >= *due) {
                match self.reclaim(&shutdown).await {
                    Ok(_) => {
                        failures = 0;
                        next_reclaim = Some(self.next_reclaim_after(due));
                    }
                    Err(e) => {
                        self.absorb(e, &mut failures, &shutdown).await?;
                        replay_due = true;
                        continue;
                    }
                }
            }

            match self.run_once(&shutdown).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    self.absorb(e, &mut failures, &shutdown).await?;
                    // Entries fetched before the error are still assigned to
                    // this member.
                    replay_due = true;
                }
            }
        }

        self.transition(LoopState::Idle);
        info!(
            stream = self.consumer.stream(),
            group = self.consumer.group(),
            consumer = self.consumer.name(),
            acknowledged = self.stats.acknowledged,
            handler_failures = self.stats.handler_failures,
            malformed = self.stats.malformed,
            "consumer loop stopped"
        );
        Ok(self.stats)
    }

    /// One fetch-and-dispatch pass. Returns what this pass did.
    ///
    /// Errors are returned as-is; no backoff is applied.
    pub async fn run_once(&mut self, shutdown: &CancellationToken) -> Result<LoopStats, BusError> {
        self.validate()?;
        let before = self.stats;

        self.transition(LoopState::Fetching);
        let fetched = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.consumer.fetch(self.config.batch_size, self.config.block_timeout) => Some(result),
        };
        let entries = match fetched {
            Some(result) => result?,
            None => {
                self.transition(LoopState::Idle);
                return Ok(LoopStats::default());
            }
        };

        if !entries.is_empty() {
            debug!(
                stream = self.consumer.stream(),
                consumer = self.consumer.name(),
                count = entries.len(),
                "fetched entries"
            );
        }
        self.stats.fetched += entries.len() as u64;
        self.dispatch_all(entries, shutdown).await?;
        self.transition(LoopState::Idle);

        Ok(self.stats.since(&before))
    }

    /// One recovery pass: replay this member's backlog, then claim stale
    /// entries from other members.
    pub async fn recover(&mut self, shutdown: &CancellationToken) -> Result<LoopStats, BusError> {
        self.validate()?;
        let before = self.stats;
        if self.config.recovery.is_some() {
            self.replay_backlog(shutdown).await?;
            self.reclaim(shutdown).await?;
        }
        self.transition(LoopState::Idle);
        Ok(self.stats.since(&before))
    }

    fn validate(&self) -> Result<(), BusError> {
        if self.config.batch_size == 0 {
            return Err(BusError::Config("batch size must be at least 1".into()));
        }
        if self.config.block_timeout.is_zero() {
            return Err(BusError::Config("block timeout must be positive".into()));
        }
        if self.config.delivery == DeliveryMode::EffectivelyOnce && self.dedupe.is_none() {
            return Err(BusError::Config(
                "effectively-once delivery needs a dedupe store".into(),
            ));
        }
        if let Some(recovery) = &self.config.recovery {
            if recovery.batch_size == 0 {
                return Err(BusError::Config(
                    "recovery batch size must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    fn next_reclaim_after(&self, due: Instant) -> Instant {
        // Keep paging while the previous scan stopped mid-ledger.
        if !self.claim_cursor.is_zero() {
            return Instant::now();
        }
        let interval = self
            .config
            .recovery
            .as_ref()
            .map(|recovery| recovery.interval)
            .unwrap_or_default();
        (due + interval).max(Instant::now())
    }

    /// Decide whether a failed iteration is survivable. Sleeps for the backoff
    /// delay when it is.
    async fn absorb(
        &mut self,
        err: BusError,
        failures: &mut u32,
        shutdown: &CancellationToken,
    ) -> Result<(), BusError> {
        self.transition(LoopState::Idle);
        match err {
            BusError::Store(StoreError::Connection { .. }) => {
                self.stats.store_errors += 1;
                if !self.config.retry.should_retry(*failures) {
                    error!(
                        stream = self.consumer.stream(),
                        consumer = self.consumer.name(),
                        failures = *failures,
                        error = %err,
                        "log store unreachable, giving up"
                    );
                    return Err(err);
                }
                let delay = self.config.retry.delay_for(*failures);
                *failures += 1;
                warn!(
                    stream = self.consumer.stream(),
                    consumer = self.consumer.name(),
                    attempt = *failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "log store error, backing off"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(())
            }
            BusError::Store(StoreError::StreamUnavailable { .. }) => {
                self.stats.store_errors += 1;
                match self.consumer.rejoin().await {
                    Ok(GroupStatus::Created) => {
                        warn!(
                            stream = self.consumer.stream(),
                            group = self.consumer.group(),
                            error = %err,
                            "consumer group was missing, re-created it"
                        );
                        Ok(())
                    }
                    Ok(GroupStatus::AlreadyExists) => {
                        error!(stream = self.consumer.stream(), error = %err, "stream unavailable");
                        Err(err)
                    }
                    Err(rejoin) => {
                        error!(
                            stream = self.consumer.stream(),
                            error = %err,
                            rejoin_error = %rejoin,
                            "stream unavailable and group cannot be created"
                        );
                        Err(err)
                    }
                }
            }
            _ => Err(err),
        }
    }

    async fn replay_backlog(&mut self, shutdown: &CancellationToken) -> Result<(), BusError> {
        let batch_size = self
            .config
            .recovery
            .as_ref()
            .map_or(self.config.batch_size, |recovery| recovery.batch_size);
        self.transition(LoopState::Recovering);

        let mut after = SequenceId::ZERO;
        while !shutdown.is_cancelled() {
            let batch = self
                .consumer
                .store()
                .read_backlog(
                    self.consumer.stream(),
                    self.consumer.group(),
                    self.consumer.name(),
                    after,
                    batch_size,
                )
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = last.id;

            info!(
                stream = self.consumer.stream(),
                consumer = self.consumer.name(),
                count = batch.len(),
                "replaying pending backlog"
            );
            self.stats.replayed += batch.len() as u64;
            if !self.dispatch_all(batch, shutdown).await? {
                break;
            }
            self.transition(LoopState::Recovering);
        }
        Ok(())
    }

    async fn reclaim(&mut self, shutdown: &CancellationToken) -> Result<(), BusError> {
        let Some(recovery) = self.config.recovery.clone() else {
            return Ok(());
        };
        self.transition(LoopState::Recovering);

        let claim = self
            .consumer
            .store()
            .claim_stale(
                self.consumer.stream(),
                self.consumer.group(),
                self.consumer.name(),
                recovery.min_idle,
                self.claim_cursor,
                recovery.batch_size,
            )
            .await?;
        self.claim_cursor = claim.next_cursor;

        for id in &claim.deleted {
            warn!(
                stream = self.consumer.stream(),
                sequence_id = %id,
                "pending entry no longer exists in the stream"
            );
        }
        if !claim.entries.is_empty() {
            info!(
                stream = self.consumer.stream(),
                consumer = self.consumer.name(),
                count = claim.entries.len(),
                min_idle_ms = recovery.min_idle.as_millis() as u64,
                "reclaimed stale entries"
            );
        }
        self.stats.reclaimed += claim.entries.len() as u64;
        self.dispatch_all(claim.entries, shutdown).await?;
        Ok(())
    }

    /// Dispatch entries in delivery order. Returns `false` if shutdown cut the
    /// batch short.
    async fn dispatch_all(
        &mut self,
        entries: Vec<StreamEntry>,
        shutdown: &CancellationToken,
    ) -> Result<bool, BusError> {
        let total = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            if shutdown.is_cancelled() {
                info!(
                    stream = self.consumer.stream(),
                    consumer = self.consumer.name(),
                    left_pending = total - index,
                    "shutdown requested, leaving rest of batch pending"
                );
                return Ok(false);
            }
            if let Outcome::Abandoned = self.dispatch(entry, shutdown).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn dispatch(
        &mut self,
        entry: StreamEntry,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, BusError> {
        self.transition(LoopState::Dispatching);

        let envelope = match Envelope::decode(&entry.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.malformed += 1;
                error!(
                    stream = self.consumer.stream(),
                    group = self.consumer.group(),
                    sequence_id = %entry.id,
                    error = %e,
                    "failed to decode entry, leaving it pending"
                );
                return Ok(Outcome::Done);
            }
        };

        let dedupe = match self.config.delivery {
            DeliveryMode::AtLeastOnce => None,
            DeliveryMode::EffectivelyOnce => self
                .dedupe
                .clone()
                .map(|store| (store, dedupe_key(self.consumer.stream(), &envelope.id))),
        };

        if let Some((store, key)) = &dedupe {
            match store.is_processed(key).await {
                Ok(true) => {
                    self.stats.duplicates += 1;
                    debug!(
                        stream = self.consumer.stream(),
                        sequence_id = %entry.id,
                        envelope_id = %envelope.id,
                        "duplicate envelope, skipping handler"
                    );
                    self.acknowledge(entry.id).await?;
                    return Ok(Outcome::Done);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        stream = self.consumer.stream(),
                        sequence_id = %entry.id,
                        error = %e,
                        "dedupe check failed, leaving entry pending"
                    );
                    return Ok(Outcome::Done);
                }
            }
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = self.handler.handle(&envelope) => Some(result),
        };

        match result {
            None => {
                self.stats.abandoned += 1;
                warn!(
                    stream = self.consumer.stream(),
                    sequence_id = %entry.id,
                    envelope_id = %envelope.id,
                    "shutdown interrupted handler, entry left pending"
                );
                Ok(Outcome::Abandoned)
            }
            Some(Ok(())) => {
                self.stats.handled += 1;
                if let Some((store, key)) = &dedupe {
                    if let Err(e) = store.mark_processed(key, self.config.dedupe_ttl).await {
                        warn!(
                            envelope_id = %envelope.id,
                            error = %e,
                            "failed to record processed envelope"
                        );
                    }
                }
                self.acknowledge(entry.id).await?;
                Ok(Outcome::Done)
            }
            Some(Err(e)) => {
                self.stats.handler_failures += 1;
                warn!(
                    stream = self.consumer.stream(),
                    group = self.consumer.group(),
                    sequence_id = %entry.id,
                    envelope_id = %envelope.id,
                    error = %e,
                    "handler failed, entry left pending for redelivery"
                );
                if self.config.stop_on_error {
                    return Err(BusError::Handler {
                        envelope_id: envelope.id,
                        sequence_id: entry.id.to_string(),
                        source: e,
                    });
                }
                Ok(Outcome::Done)
            }
        }
    }

    async fn acknowledge(&mut self, id: SequenceId) -> Result<(), BusError> {
        if !self.config.acknowledge {
            return Ok(());
        }
        self.transition(LoopState::Acknowledging);
        let removed = self.consumer.acknowledge(id).await?;
        if !removed {
            // Another member reclaimed and finished it first.
            debug!(
                stream = self.consumer.stream(),
                sequence_id = %id,
                "entry was no longer pending"
            );
        }
        self.stats.acknowledged += 1;
        self.transition(LoopState::Dispatching);
        Ok(())
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            trace!(consumer = self.consumer.name(), from = ?self.state, to = ?next, "state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::InMemoryDedupe;
    use crate::envelope::Payload;
    use crate::group::join;
    use crate::memory::InMemoryLogStore;
    use crate::producer::Producer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    const STREAM: &str = "stream-bus:events:outbound";
    const GROUP: &str = "workers";

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Envelope>>,
        fail_first: AtomicUsize,
    }

    impl Recorder {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(times),
            })
        }

        fn calls(&self) -> Vec<Envelope> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(envelope.clone());
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("handler failed");
            }
            Ok(())
        }
    }

    fn payload(n: i64) -> Payload {
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(n));
        payload
    }

    fn quick_config() -> ConsumerConfig {
        ConsumerConfig {
            block_timeout: Duration::from_millis(100),
            recovery: None,
            ..Default::default()
        }
    }

    async fn setup(
        name: &str,
    ) -> (
        Arc<InMemoryLogStore>,
        Producer<InMemoryLogStore>,
        Consumer<InMemoryLogStore>,
    ) {
        let store = Arc::new(InMemoryLogStore::new());
        let producer = Producer::new(store.clone());
        let consumer = join(store.clone(), STREAM, GROUP, name).await.unwrap();
        (store, producer, consumer)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_handled_entry_is_acknowledged() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), quick_config());
        let pass = consumer_loop.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(pass.fetched, 1);
        assert_eq!(pass.handled, 1);
        assert_eq!(pass.acknowledged, 1);
        assert_eq!(recorder.calls()[0].payload, payload(1));
        assert_eq!(consumer_loop.state(), LoopState::Idle);
        assert!(store.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_fetch_dispatches_nothing() {
        let (_store, _producer, consumer) = setup("c1").await;
        let recorder = Arc::new(Recorder::default());
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), quick_config());

        let pass = consumer_loop.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(pass, LoopStats::default());
        assert_eq!(recorder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_leaves_entry_pending() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();

        let mut consumer_loop = ConsumerLoop::new(consumer, Recorder::failing(1), quick_config());
        let pass = consumer_loop.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(pass.handler_failures, 1);
        assert_eq!(pass.acknowledged, 0);
        let pending = store.pending(STREAM, GROUP, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
    }

    #[tokio::test]
    async fn test_malformed_entry_is_skipped_and_left_pending() {
        let (store, producer, consumer) = setup("c1").await;
        let bad = store.append(STREAM, b"not json").await.unwrap();
        producer.send(STREAM, payload(2)).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let config = ConsumerConfig {
            batch_size: 10,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), config);
        let pass = consumer_loop.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(pass.malformed, 1);
        assert_eq!(pass.handled, 1);
        assert_eq!(recorder.call_count(), 1);
        let pending = store.pending(STREAM, GROUP, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, bad);
    }

    #[tokio::test]
    async fn test_entries_dispatched_in_append_order() {
        let (_store, producer, consumer) = setup("c1").await;
        for n in 0..5 {
            producer.send(STREAM, payload(n)).await.unwrap();
        }

        let recorder = Arc::new(Recorder::default());
        let config = ConsumerConfig {
            batch_size: 2,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), config);
        let token = CancellationToken::new();
        for _ in 0..3 {
            consumer_loop.run_once(&token).await.unwrap();
        }

        let order: Vec<i64> = recorder
            .calls()
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_no_ack_leaves_entries_pending() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();

        let config = ConsumerConfig {
            acknowledge: false,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, Arc::new(Recorder::default()), config);
        let pass = consumer_loop.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(pass.handled, 1);
        assert_eq!(pass.acknowledged, 0);
        assert_eq!(store.pending(STREAM, GROUP, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_on_error_returns_handler_error() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();
        let sent = Envelope::decode(&store.entries(STREAM)[0].body).unwrap();

        let config = ConsumerConfig {
            stop_on_error: true,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, Recorder::failing(1), config);
        let err = consumer_loop.run(CancellationToken::new()).await.unwrap_err();

        match err {
            BusError::Handler { envelope_id, .. } => assert_eq!(envelope_id, sent.id),
            other => panic!("expected handler error, got {:?}", other),
        }
        assert_eq!(store.pending(STREAM, GROUP, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_handler_does_not_acknowledge() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();

        let started = Arc::new(Notify::new());
        let signal = started.clone();
        let handler = handler_fn(move |_envelope: Envelope| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                std::future::pending::<()>().await;
                Ok::<(), anyhow::Error>(())
            }
        });

        let mut consumer_loop = ConsumerLoop::new(consumer, handler, quick_config());
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move { consumer_loop.run(shutdown).await });

        started.notified().await;
        token.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.acknowledged, 0);
        assert_eq!(store.pending(STREAM, GROUP, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_rest_of_batch_pending() {
        let (store, producer, consumer) = setup("c1").await;
        for n in 0..3 {
            producer.send(STREAM, payload(n)).await.unwrap();
        }

        let token = CancellationToken::new();
        let trigger = token.clone();
        let handler = handler_fn(move |_envelope: Envelope| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Ok::<(), anyhow::Error>(())
            }
        });

        let config = ConsumerConfig {
            batch_size: 3,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, handler, config);
        let pass = consumer_loop.run_once(&token).await.unwrap();

        assert_eq!(pass.fetched, 3);
        assert_eq!(pass.acknowledged, 1);
        assert_eq!(store.pending(STREAM, GROUP, 10).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_back_off_then_resume() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();
        store.fail_next(StoreError::connection("connection refused"));
        store.fail_next(StoreError::connection("connection refused"));

        let recorder = Arc::new(Recorder::default());
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), quick_config());
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move { consumer_loop.run(shutdown).await });

        let seen = recorder.clone();
        wait_for(move || seen.call_count() == 1).await;
        token.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.store_errors, 2);
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_does_not_strand_rest_of_batch() {
        let (store, producer, consumer) = setup("c1").await;
        for n in 0..3 {
            producer.send(STREAM, payload(n)).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = seen.clone();
        let faults = store.clone();
        let handler = handler_fn(move |envelope: Envelope| {
            let calls = calls.clone();
            let faults = faults.clone();
            async move {
                let mut calls = calls.lock().unwrap();
                if calls.is_empty() {
                    // The acknowledgement right after this call fails.
                    faults.fail_next(StoreError::connection("connection reset"));
                }
                calls.push(envelope.payload["n"].as_i64().unwrap());
                Ok::<(), anyhow::Error>(())
            }
        });

        // No recovery: nothing would reclaim the stranded entries.
        let config = ConsumerConfig {
            batch_size: 3,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, handler, config);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move { consumer_loop.run(shutdown).await });

        let done = seen.clone();
        wait_for(move || done.lock().unwrap().len() == 4).await;
        token.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 1, 2]);
        assert_eq!(stats.store_errors, 1);
        assert_eq!(stats.replayed, 3);
        assert_eq!(stats.acknowledged, 3);
        assert!(store.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_budget_ends_loop() {
        let (store, _producer, consumer) = setup("c1").await;
        store.fail_next(StoreError::connection("connection refused"));
        store.fail_next(StoreError::connection("connection refused"));

        let config = ConsumerConfig {
            retry: RetryPolicy::default().with_max_attempts(1),
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, Arc::new(Recorder::default()), config);
        let err = consumer_loop.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unavailable_stream_ends_loop() {
        let (store, _producer, consumer) = setup("c1").await;
        store.fail_next(StoreError::unavailable(STREAM, "WRONGTYPE"));

        let mut consumer_loop =
            ConsumerLoop::new(consumer, Arc::new(Recorder::default()), quick_config());
        let err = consumer_loop.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Store(StoreError::StreamUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_deleted_stream_group_is_recreated() {
        let (store, producer, consumer) = setup("c1").await;
        store.remove_stream(STREAM);

        let recorder = Arc::new(Recorder::default());
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), quick_config());
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move { consumer_loop.run(shutdown).await });

        let seen = recorder.clone();
        wait_for(move || store.groups(STREAM) == vec![GROUP.to_string()]).await;
        producer.send(STREAM, payload(1)).await.unwrap();
        wait_for(move || seen.call_count() == 1).await;
        token.cancel();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_is_reclaimed_from_crashed_member() {
        let (store, producer, crashed) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();
        assert_eq!(crashed.fetch(1, Duration::ZERO).await.unwrap().len(), 1);

        let survivor = join(store.clone(), STREAM, GROUP, "c2").await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = ConsumerConfig {
            recovery: Some(RecoveryConfig::default()),
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(survivor, recorder.clone(), config);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move { consumer_loop.run(shutdown).await });

        let seen = recorder.clone();
        wait_for(move || seen.call_count() == 1).await;
        token.cancel();
        let stats = task.await.unwrap().unwrap();

        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.acknowledged, 1);
        assert!(store.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_entry_is_redelivered() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();

        let recorder = Recorder::failing(1);
        let config = ConsumerConfig {
            recovery: Some(RecoveryConfig {
                min_idle: Duration::from_secs(1),
                interval: Duration::from_secs(1),
                ..Default::default()
            }),
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), config);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let task = tokio::spawn(async move { consumer_loop.run(shutdown).await });

        let seen = recorder.clone();
        wait_for(move || seen.call_count() == 2).await;
        token.cancel();
        let stats = task.await.unwrap().unwrap();

        let calls = recorder.calls();
        assert_eq!(calls[0].id, calls[1].id);
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.acknowledged, 1);
        assert!(store.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_replayed_after_restart() {
        let (store, producer, first_run) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();
        first_run.fetch(1, Duration::ZERO).await.unwrap();

        let restarted = join(store.clone(), STREAM, GROUP, "c1").await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = ConsumerConfig {
            recovery: Some(RecoveryConfig::default()),
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(restarted, recorder.clone(), config);
        let pass = consumer_loop.recover(&CancellationToken::new()).await.unwrap();

        assert_eq!(pass.replayed, 1);
        assert_eq!(pass.reclaimed, 0);
        assert_eq!(pass.acknowledged, 1);
        assert!(store.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_effectively_once_skips_repeated_envelope() {
        let (store, producer, consumer) = setup("c1").await;
        let envelope = Envelope::new(payload(1));
        producer.send_envelope(STREAM, envelope.clone()).await.unwrap();
        producer.send_envelope(STREAM, envelope).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let config = ConsumerConfig {
            batch_size: 10,
            delivery: DeliveryMode::EffectivelyOnce,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, recorder.clone(), config)
            .with_dedupe(Arc::new(InMemoryDedupe::new()));
        let pass = consumer_loop.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(recorder.call_count(), 1);
        assert_eq!(pass.duplicates, 1);
        assert_eq!(pass.acknowledged, 2);
        assert!(store.pending(STREAM, GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_envelope_is_not_marked_processed() {
        let (store, producer, consumer) = setup("c1").await;
        producer.send(STREAM, payload(1)).await.unwrap();
        let sent = Envelope::decode(&store.entries(STREAM)[0].body).unwrap();

        let dedupe = Arc::new(InMemoryDedupe::new());
        let config = ConsumerConfig {
            delivery: DeliveryMode::EffectivelyOnce,
            ..quick_config()
        };
        let mut consumer_loop =
            ConsumerLoop::new(consumer, Recorder::failing(1), config).with_dedupe(dedupe.clone());
        consumer_loop.run_once(&CancellationToken::new()).await.unwrap();

        assert!(!dedupe
            .is_processed(&dedupe_key(STREAM, &sent.id))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_effectively_once_requires_dedupe_store() {
        let (_store, _producer, consumer) = setup("c1").await;
        let config = ConsumerConfig {
            delivery: DeliveryMode::EffectivelyOnce,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, Arc::new(Recorder::default()), config);
        assert!(matches!(
            consumer_loop.run_once(&CancellationToken::new()).await,
            Err(BusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let (_store, _producer, consumer) = setup("c1").await;
        let config = ConsumerConfig {
            batch_size: 0,
            ..quick_config()
        };
        let mut consumer_loop = ConsumerLoop::new(consumer, Arc::new(Recorder::default()), config);
        assert!(matches!(
            consumer_loop.run(CancellationToken::new()).await,
            Err(BusError::Config(_))
        ));
    }
}
