//! Data models for deadletter

mod alert;
mod event;
mod metrics;
mod record;

pub use alert::*;
pub use event::*;
pub use metrics::*;
pub use record::*;
