//! Event, delivery and dead-letter data models

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque event as handed over by a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Origin of the event (e.g., "orders.service")
    pub source: String,

    /// Event type descriptor (e.g., "OrderPlaced")
    #[serde(rename = "detail-type", alias = "detail_type")]
    pub detail_type: String,

    /// Raw payload, never inspected by the dispatcher itself
    #[serde(with = "payload_base64")]
    pub payload: Bytes,
}

impl Event {
    /// Create a new event
    pub fn new(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
            payload: payload.into(),
        }
    }

    /// Create an event whose payload is the JSON encoding of `detail`
    pub fn json(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        detail: &serde_json::Value,
    ) -> Self {
        Self::new(source, detail_type, Bytes::from(detail.to_string()))
    }
}

/// An event after the dispatcher has taken ownership of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedEvent {
    /// Dispatch sequence number, assigned by the dispatcher
    pub sequence: u64,

    /// When the dispatcher accepted the event
    pub received_at: DateTime<Utc>,

    /// The immutable event
    pub event: Event,
}

/// Why a single handler attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Business failure returned by the handler; retry-eligible
    #[error("transient handler failure: {0}")]
    Transient(String),

    /// The payload could not be understood; still retried like a transient failure
    #[error("payload failure: {0}")]
    Payload(String),

    /// The attempt did not finish within the hard timeout
    #[error("attempt timed out after {}", format_timeout(.0))]
    Timeout(#[serde(with = "humantime_serde")] Duration),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl FailureReason {
    /// Create a transient failure
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a payload failure
    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    /// Short classification used as a log field and metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Payload(_) => "payload",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panicked",
        }
    }
}

fn format_timeout(timeout: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*timeout)
}

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The handler returned successfully
    Success,
    /// The handler failed
    Failure(FailureReason),
}

/// One delivery attempt of one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Sequence number of the event
    pub sequence: u64,

    /// Attempt index (0-based)
    pub attempt: u32,

    /// What happened
    pub outcome: AttemptOutcome,

    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of dispatching an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The handler succeeded on one of the attempts
    Delivered {
        /// Sequence number of the event
        sequence: u64,
        /// Number of attempts made, including the successful one
        attempts: u32,
    },

    /// Every attempt failed and the event now lives in the dead-letter store
    DeadLettered {
        /// Sequence number of the event
        sequence: u64,
        /// Number of attempts made
        attempts: u32,
        /// Identifier of the dead-letter record
        record_id: Uuid,
    },

    /// Dispatch was cancelled between attempts; the event is handed back
    Cancelled {
        /// Sequence number of the event
        sequence: u64,
        /// Number of attempts completed before cancellation
        attempts: u32,
        /// The undelivered event
        event: Box<DispatchedEvent>,
    },
}

impl DeliveryOutcome {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. }
            | Self::DeadLettered { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Whether the event was delivered
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Whether the event ended up in the dead-letter store
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, Self::DeadLettered { .. })
    }
}

/// An event that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Unique identifier
    pub id: Uuid,

    /// The undelivered event
    pub event: DispatchedEvent,

    /// Failure reason of the final attempt
    pub reason: FailureReason,

    /// Total attempts made (always max_retries + 1)
    pub attempts: u32,

    /// When the record was written to the store
    pub enqueued_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Create a record for an exhausted event
    pub fn new(event: DispatchedEvent, reason: FailureReason, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            reason,
            attempts,
            enqueued_at: Utc::now(),
        }
    }

    /// Whether the record is older than the retention horizon at `now`
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match chrono::Duration::from_std(retention) {
            Ok(retention) => self.enqueued_at + retention <= now,
            Err(_) => false,
        }
    }
}

/// Base64 encoding for payload bytes in JSON
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
