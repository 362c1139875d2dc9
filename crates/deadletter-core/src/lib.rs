//! # deadletter
//!
//! Failure isolation and escalation for asynchronous event handlers.
//!
//! Events are delivered to a handler with a bounded retry budget. Events that keep
//! failing are parked in a durable dead-letter store instead of being lost. Every
//! attempt is reported as a structured record; metrics extracted from those records
//! drive alarm rules, and alarms are fanned out to subscribers.
//!
//! ## Architecture
//!
//! - **Dispatcher**: retries, per-attempt timeouts, dead-lettering on exhaustion
//! - **Dead-letter store**: memory, NDJSON file or PostgreSQL
//! - **Collector**: execution records to metric samples
//! - **Alerting**: windowed rule evaluation and notification fan-out
//!
//! ## Quick Start
//!
//! ```bash
//! # Dispatch events read from stdin
//! deadletter serve < events.ndjson
//!
//! # Inspect the dead-letter store
//! deadletter dlq depth
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]

pub mod alerting;
pub mod collector;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertEvaluator, NotificationFanout, Subscriber};
    pub use crate::collector::{MetricExtractor, MetricStore, Pipeline, RecordSink};
    pub use crate::config::Config;
    pub use crate::dispatcher::{Dispatcher, Handler};
    pub use crate::dlq::DeadLetterStore;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
