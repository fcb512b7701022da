//! Producer: wraps payloads in envelopes and appends them to a stream.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::envelope::{Envelope, Payload};
use crate::error::{BusError, SendError};
use crate::store::{LogStore, SequenceId};

/// Appends envelopes to streams through a shared [`LogStore`] handle.
///
/// The producer does not retry. A failed send returns the envelope inside the
/// [`SendError`] so the caller can decide whether and when to re-send it with
/// [`Producer::send_envelope`].
pub struct Producer<S: LogStore> {
    store: Arc<S>,
}

impl<S: LogStore> Clone for Producer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LogStore> Producer<S> {
    /// Create a producer on top of a store connection.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Wrap `payload` in a fresh envelope and append it to `stream`.
    pub async fn send(&self, stream: &str, payload: Payload) -> Result<SequenceId, SendError> {
        self.send_envelope(stream, Envelope::new(payload)).await
    }

    /// Append an existing envelope, unchanged, to `stream`.
    ///
    /// Use this to retry a failed [`send`](Self::send) with the same id.
    pub async fn send_envelope(
        &self,
        stream: &str,
        envelope: Envelope,
    ) -> Result<SequenceId, SendError> {
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => return Err(fail(stream, envelope, e.into())),
        };

        match self.store.append(stream, &body).await {
            Ok(sequence_id) => {
                debug!(
                    stream,
                    envelope_id = %envelope.id,
                    sequence_id = %sequence_id,
                    "envelope appended"
                );
                Ok(sequence_id)
            }
            Err(e) => {
                warn!(
                    stream,
                    envelope_id = %envelope.id,
                    retryable = e.is_retryable(),
                    error = %e,
                    "failed to append envelope"
                );
                Err(fail(stream, envelope, e.into()))
            }
        }
    }
}

fn fail(stream: &str, envelope: Envelope, source: BusError) -> SendError {
    SendError {
        stream: stream.to_string(),
        envelope,
        source,
    }
}
