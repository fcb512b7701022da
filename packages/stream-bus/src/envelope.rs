//! The envelope: the unit of work moved through the bus.
//!
//! On the wire an envelope is a JSON object:
//!
//! ```text
//! {"id":"0190c5a4-...","enqueued_at":1718000000,"payload":{"type":"image.process","id":123}}
//! ```
//!
//! `id` is assigned by the producer and is the idempotency key handlers should
//! deduplicate on. It is unrelated to the sequence id the log store assigns on
//! append.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CodecError;
use crate::finite;

/// Open, string-keyed payload map. Opaque to the bus.
pub type Payload = serde_json::Map<String, Value>;

/// A message on the bus.
///
/// Never mutated after creation. Retrying a failed send must reuse the same
/// envelope so `id` stays stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Producer-assigned, time-ordered unique id.
    pub id: String,
    /// Creation time in epoch seconds. Older producers call this field `ts`.
    #[serde(alias = "ts")]
    pub enqueued_at: i64,
    /// Application data.
    #[serde(default)]
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload in a fresh envelope stamped with a new id and the current time.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            enqueued_at: Utc::now().timestamp(),
            payload,
        }
    }

    /// Build an envelope from any serializable value that serializes to a map.
    ///
    /// Fails with [`CodecError::Encode`] for NaN or infinite numbers, which
    /// JSON cannot carry.
    pub fn from_serializable<T: Serialize + ?Sized>(payload: &T) -> Result<Self, CodecError> {
        match finite::to_value(payload).map_err(|e| CodecError::Encode(e.to_string()))? {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(CodecError::Encode(format!(
                "payload must serialize to a map, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}

/// Serialize an envelope to JSON bytes.
///
/// Output is deterministic: fields are written in declaration order and
/// payload keys are sorted.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse JSON bytes into an envelope.
///
/// Unknown top-level fields are ignored. Unknown payload keys are kept.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

    let Value::Object(fields) = &mut value else {
        return Err(CodecError::Schema(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    };

    if !fields.contains_key("id") {
        return Err(CodecError::Schema("missing field `id`".into()));
    }
    if fields.contains_key("enqueued_at") {
        // `ts` is only a fallback for older producers.
        fields.remove("ts");
    } else if !fields.contains_key("ts") {
        return Err(CodecError::Schema("missing field `enqueued_at`".into()));
    }

    serde_json::from_value(value).map_err(|e| CodecError::Schema(e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
