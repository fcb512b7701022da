//! # Stream Bus
//!
//! At-least-once messaging over an append-only log with competing consumer
//! groups.
//!
//! ## Core Concepts
//!
//! - A **stream** is an ordered, append-only log addressed by name
//!   (`stream-bus:events:outbound`). Every entry gets a [`SequenceId`].
//! - A **producer** wraps a JSON payload in an [`Envelope`] and appends it.
//! - A **consumer group** is a named delivery cursor plus a pending ledger.
//!   Each new entry goes to exactly one member of the group; separate groups
//!   each see every entry.
//! - A **consumer loop** fetches, decodes, dispatches to an
//!   [`EnvelopeHandler`], and acknowledges only after the handler succeeds.
//!
//! ## Architecture
//!
//! ```text
//! Producer.send(payload)
//!     │
//!     ▼ Envelope { id, enqueued_at, payload } ─► encode
//! LogStore.append ──────────────► stream (append-only log)
//!                                     │
//!                 ┌───────────────────┼───────────────────┐
//!                 ▼                   ▼                   ▼
//!           group "workers"     group "workers"     group "audit"
//!           consumer c1         consumer c2         consumer a1
//!                 │
//!                 ▼ read_group
//!           ConsumerLoop ─► decode ─► handler ─► acknowledge
//!                 │
//!                 └─► claim_stale (idle members' pending entries)
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: unacknowledged entries stay pending and are
//!   redelivered after the idle threshold. Handlers must be idempotent.
//! - **Per-stream order**: entries are delivered in append order. With
//!   several members in a group, processing order across members is not
//!   guaranteed.
//! - **Explicit connections**: every producer and consumer takes an
//!   `Arc<impl LogStore>`; there is no global client.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stream_bus::{
//!     handler_fn, join, ConsumerConfig, ConsumerLoop, Envelope, Producer, RedisLogStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(RedisLogStore::connect("redis://localhost:6379").await?);
//! let producer = Producer::new(store.clone());
//! producer.send("stream-bus:events:outbound", payload).await?;
//!
//! let consumer = join(store, "stream-bus:events:outbound", "workers", "worker-1").await?;
//! let handler = handler_fn(|envelope: Envelope| async move {
//!     tracing::info!(id = %envelope.id, "got it");
//!     Ok(())
//! });
//! let shutdown = CancellationToken::new();
//! ConsumerLoop::new(consumer, handler, ConsumerConfig::default())
//!     .run(shutdown)
//!     .await?;
//! ```

// Core modules
mod config;
mod consumer;
mod dedupe;
mod envelope;
mod error;
mod finite;
mod group;
mod producer;
mod retry;
mod store;

// In-memory log store for tests and local runs
pub mod memory;

// Redis Streams adapter
#[cfg(feature = "redis")]
pub mod redis_store;

// Re-export envelope types
pub use envelope::{decode, encode, Envelope, Payload};

// Re-export error types
pub use error::{BusError, CodecError, SendError, StoreError};

// Re-export store contract
pub use store::{
    ClaimBatch, GroupStatus, LogStore, ParseSequenceIdError, PendingEntry, SequenceId,
    StartPosition, StreamEntry,
};

// Re-export producer and group types
pub use group::{join, join_with_retry, Consumer};
pub use producer::Producer;

// Re-export consumer loop types
pub use consumer::{
    handler_fn, ConsumerConfig, ConsumerLoop, EnvelopeHandler, HandlerFn, LoopState, LoopStats,
    RecoveryConfig,
};

// Re-export delivery and retry policy
pub use dedupe::{dedupe_key, DedupeStore, DeliveryMode, InMemoryDedupe};
pub use retry::RetryPolicy;

// Re-export configuration
pub use config::BusConfig;

pub use memory::InMemoryLogStore;

#[cfg(feature = "redis")]
pub use redis_store::RedisLogStore;

// Re-export async_trait for handler implementations
pub use async_trait::async_trait;
