//! Error taxonomy for the stream bus.
//!
//! Errors are split by who can act on them:
//!
//! - [`StoreError`] comes from the log store. `Connection` is transient and the
//!   caller may retry; `StreamUnavailable` is a configuration or permission
//!   problem and retrying will not help.
//! - [`CodecError`] is malformed data. It is scoped to a single entry: the
//!   consumer logs it, leaves the entry pending and moves on.
//! - [`BusError`] is what the producer and the consumer loop return. It wraps
//!   the two above and adds handler and configuration failures.
//! - [`SendError`] is a failed `send`. It carries the envelope that was being
//!   sent so a retry keeps the same `id` and `enqueued_at`.

use thiserror::Error;

use crate::envelope::Envelope;

// =============================================================================
// Store Errors
// =============================================================================

/// Errors reported by a [`LogStore`](crate::LogStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached, or is temporarily not serving
    /// requests while it restarts or fails over.
    ///
    /// Transient. The caller may retry after a backoff.
    #[error("log store connection failed: {message}")]
    Connection {
        /// What went wrong, as reported by the transport.
        message: String,
    },

    /// The store refused the operation for this stream.
    ///
    /// Wrong key type, missing group, missing permissions. Not retryable.
    #[error("stream {stream} unavailable: {reason}")]
    StreamUnavailable {
        /// The stream key the operation targeted.
        stream: String,
        /// Reason reported by the store.
        reason: String,
    },
}

impl StoreError {
    /// Shorthand for a [`StoreError::Connection`].
    pub fn connection(message: impl Into<String>) -> Self {
        StoreError::Connection {
            message: message.into(),
        }
    }

    /// Shorthand for a [`StoreError::StreamUnavailable`].
    pub fn unavailable(stream: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::StreamUnavailable {
            stream: stream.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection { .. })
    }
}

// =============================================================================
// Codec Errors
// =============================================================================

/// Errors from encoding or decoding an [`Envelope`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload holds a value the wire encoding cannot represent.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The bytes are not well-formed JSON.
    #[error("malformed envelope bytes: {0}")]
    Decode(String),

    /// Well-formed JSON that is not an envelope (missing or mistyped field).
    #[error("envelope schema violation: {0}")]
    Schema(String),
}

// =============================================================================
// Bus Errors
// =============================================================================

/// Errors surfaced by the producer, the coordinator and the consumer loop.
#[derive(Debug, Error)]
pub enum BusError {
    /// Log store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Envelope encoding or decoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The handler returned an error. The entry stays pending.
    #[error("handler failed for envelope {envelope_id} ({sequence_id}): {source}")]
    Handler {
        /// Envelope id of the failed delivery.
        envelope_id: String,
        /// Log sequence id of the failed delivery.
        sequence_id: String,
        /// The handler's error.
        #[source]
        source: anyhow::Error,
    },

    /// Invalid configuration. Fatal.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BusError {
    /// Whether the failure is transient (a log store connection problem).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Store(e) if e.is_retryable())
    }
}

// =============================================================================
// Send Error
// =============================================================================

/// A failed [`Producer::send`](crate::Producer::send).
///
/// The producer never retries on its own. The envelope that was being sent is
/// returned intact; pass it to
/// [`Producer::send_envelope`](crate::Producer::send_envelope) to retry with the
/// same idempotency key.
#[derive(Debug, Error)]
#[error("failed to send envelope {} to {stream}: {source}", .envelope.id)]
pub struct SendError {
    /// Stream key the envelope was sent to.
    pub stream: String,
    /// The envelope, unchanged.
    pub envelope: Envelope,
    /// Why the send failed.
    #[source]
    pub source: BusError,
}

impl SendError {
    /// Whether re-sending the same envelope may succeed.
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }

    /// Take back the envelope for a retry.
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}
