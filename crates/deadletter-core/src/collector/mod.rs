//! Collector module - execution records in, metric samples out
//!
//! The dispatcher reports every attempt as an [`ExecutionRecord`]. The pipeline
//! runs each record through the configured [`MetricExtractor`]s and appends the
//! resulting samples to the [`MetricStore`] that the alert evaluator reads.

mod extractor;
mod pipeline;
mod store;

pub use extractor::{normalize_level, MetricExtractor, RecordMatcher};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStats};
pub use store::MetricStore;

use parking_lot::Mutex;

use crate::error::Result;
use crate::models::ExecutionRecord;

/// Receiver of execution records
#[async_trait::async_trait]
pub trait RecordSink: Send + Sync {
    /// Accept a single record
    async fn emit(&self, record: ExecutionRecord) -> Result<()>;
}

/// Sink that keeps every record in memory
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryRecordSink {
    /// Snapshot of all records received so far
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait::async_trait]
impl RecordSink for MemoryRecordSink {
    async fn emit(&self, record: ExecutionRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
