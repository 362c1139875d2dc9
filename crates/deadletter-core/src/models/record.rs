//! Structured execution records emitted by handler invocations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::{AttemptOutcome, DeliveryAttempt, DispatchedEvent};

/// Level used for successful attempts
pub const LEVEL_INFO: &str = "info";

/// Level used for failed attempts
pub const LEVEL_ERROR: &str = "error";

/// A structured record of one handler execution
///
/// Records are read-only once emitted; the `level` is kept verbatim so that
/// downstream matching can decide how to normalize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Severity level as written by the emitter ("info", "error", "ERROR", ...)
    pub level: String,

    /// Component that produced the record
    pub component: String,

    /// Human-readable message
    #[serde(rename = "msg", alias = "message")]
    pub message: String,

    /// Free-form structured fields
    #[serde(default, flatten)]
    pub fields: Map<String, Value>,

    /// When the record was emitted
    #[serde(rename = "ts", alias = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a new record with no fields
    pub fn new(
        level: impl Into<String>,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level: level.into(),
            component: component.into(),
            message: message.into(),
            fields: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a structured field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build the record describing a delivery attempt
    pub fn for_attempt(
        component: &str,
        event: &DispatchedEvent,
        attempt: &DeliveryAttempt,
    ) -> Self {
        let (level, message) = match &attempt.outcome {
            AttemptOutcome::Success => (LEVEL_INFO, "message processed"),
            AttemptOutcome::Failure(_) => (LEVEL_ERROR, "failed to process message"),
        };

        let mut record = Self::new(level, component, message)
            .with_field("source", event.event.source.clone())
            .with_field("type", event.event.detail_type.clone())
            .with_field("sequence", event.sequence)
            .with_field("attempt", attempt.attempt)
            .at(attempt.timestamp);

        if let AttemptOutcome::Failure(reason) = &attempt.outcome {
            record = record
                .with_field("reason", reason.to_string())
                .with_field("reason_kind", reason.kind());
        }

        record
    }

    /// Get a field by name
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
