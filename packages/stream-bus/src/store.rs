//! The log store contract.
//!
//! The bus does not implement storage. It talks to an append-only log with
//! consumer groups through [`LogStore`], and works against any implementation
//! that honours the contract below:
//!
//! - [`LogStore::append`] durably appends and returns a monotonically
//!   increasing [`SequenceId`].
//! - [`LogStore::ensure_group`] creates the stream and group when missing and is
//!   a no-op (not an error) when the group exists, even under concurrent callers.
//! - [`LogStore::read_group`] hands out entries no group member has seen yet,
//!   records them in the group's pending ledger under the calling consumer and
//!   blocks for at most `block_timeout`. A timeout is an empty result.
//! - [`LogStore::acknowledge`] removes an id from the pending ledger. Unknown or
//!   already acknowledged ids are a no-op.
//!
//! Crash recovery uses three more primitives over the pending ledger:
//! [`LogStore::read_backlog`], [`LogStore::claim_stale`] and
//! [`LogStore::pending`].
//!
//! Implementations: [`RedisLogStore`](crate::RedisLogStore) (Redis Streams) and
//! [`InMemoryLogStore`](crate::InMemoryLogStore).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::StoreError;

// =============================================================================
// Sequence Ids
// =============================================================================

/// Log-assigned position of an entry, `<millis>-<seq>`.
///
/// Totally ordered within a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId {
    /// Milliseconds part.
    pub millis: u64,
    /// Sequence within the millisecond.
    pub seq: u64,
}

impl SequenceId {
    /// The stream origin, `0-0`. Sorts before every appended entry.
    pub const ZERO: SequenceId = SequenceId { millis: 0, seq: 0 };

    /// Create an id from its two parts.
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Whether this is the stream origin.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// A string that is not a `<millis>-<seq>` id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid sequence id: {0:?}")]
pub struct ParseSequenceIdError(pub String);

impl FromStr for SequenceId {
    type Err = ParseSequenceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseSequenceIdError(s.to_string());
        match s.split_once('-') {
            Some((millis, seq)) => Ok(SequenceId {
                millis: millis.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            None => Ok(SequenceId {
                millis: s.parse().map_err(|_| invalid())?,
                seq: 0,
            }),
        }
    }
}

// =============================================================================
// Contract Types
// =============================================================================

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// From the start of the retained history (`0`).
    Beginning,
    /// Only entries appended after the group is created (`$`).
    Latest,
}

/// Outcome of [`LogStore::ensure_group`]. Both outcomes are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// This call created the group.
    Created,
    /// The group was already there.
    AlreadyExists,
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Log-assigned id.
    pub id: SequenceId,
    /// Encoded envelope bytes, exactly as appended.
    pub body: Vec<u8>,
}

/// Result of one [`LogStore::claim_stale`] scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimBatch {
    /// Entries now owned by the claiming consumer.
    pub entries: Vec<StreamEntry>,
    /// Where the next scan resumes. [`SequenceId::ZERO`] once the whole ledger
    /// has been scanned.
    pub next_cursor: SequenceId,
    /// Pending ids whose entries no longer exist in the stream. The store drops
    /// them from the ledger.
    pub deleted: Vec<SequenceId>,
}

/// One row of a group's pending ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Log-assigned id.
    pub id: SequenceId,
    /// Consumer currently holding the entry.
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    /// How many times the entry has been delivered.
    pub delivery_count: u64,
}

// =============================================================================
// LogStore Trait
// =============================================================================

/// Client-side view of an append-only log with consumer groups.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append `body` to `stream`, creating the stream if needed.
    async fn append(&self, stream: &str, body: &[u8]) -> Result<SequenceId, StoreError>;

    /// Create `group` on `stream` (and the stream itself) unless it exists.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupStatus, StoreError>;

    /// Fetch up to `max_count` never-delivered entries for `consumer`.
    ///
    /// Returned entries are added to the pending ledger under `consumer`.
    /// Waits up to `block_timeout` when nothing is available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Remove `id` from the pending ledger.
    ///
    /// Returns whether the id was pending. Never fails for unknown ids.
    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        id: SequenceId,
    ) -> Result<bool, StoreError>;

    /// Re-read entries already pending for `consumer` with ids after `after`.
    ///
    /// Does not block and does not change ownership.
    async fn read_backlog(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: SequenceId,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Scans the ledger from `cursor`. Claimed entries get a fresh idle timer
    /// and a bumped delivery count.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: SequenceId,
        max_count: usize,
    ) -> Result<ClaimBatch, StoreError>;

    /// List up to `max_count` rows of the pending ledger, lowest id first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        max_count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;
}
