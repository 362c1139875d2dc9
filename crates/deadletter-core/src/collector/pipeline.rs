//! Processing pipeline for execution records
//!
//! The pipeline receives records from the dispatcher, runs them through every
//! extractor and appends the resulting samples to the shared metric store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MetricsConfig;
use crate::error::{Error, Result};
use crate::models::ExecutionRecord;

use super::{MetricExtractor, MetricStore, RecordSink};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records buffered before `submit` applies backpressure
    pub buffer_size: usize,
    /// How long samples are kept in the store
    pub retention: Duration,
    /// How often expired samples are pruned
    pub prune_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            retention: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl From<&MetricsConfig> for PipelineConfig {
    fn from(config: &MetricsConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            retention: config.retention,
            ..Self::default()
        }
    }
}

/// Processing pipeline for execution records
pub struct Pipeline {
    config: PipelineConfig,
    record_tx: mpsc::Sender<ExecutionRecord>,
    record_rx: Arc<Mutex<Option<mpsc::Receiver<ExecutionRecord>>>>,
    extractors: Vec<MetricExtractor>,
    store: Arc<MetricStore>,
    processed: AtomicU64,
    extracted: AtomicU64,
}

impl Pipeline {
    /// Create a new pipeline writing into `store`
    pub fn new(
        config: PipelineConfig,
        extractors: Vec<MetricExtractor>,
        store: Arc<MetricStore>,
    ) -> Self {
        let (record_tx, record_rx) = mpsc::channel(config.buffer_size.max(1));

        Self {
            config,
            record_tx,
            record_rx: Arc::new(Mutex::new(Some(record_rx))),
            extractors,
            store,
            processed: AtomicU64::new(0),
            extracted: AtomicU64::new(0),
        }
    }

    /// Pipeline with the `errorsLogged`, `invocations` and `failedInvocations` extractors
    pub fn from_config(config: &MetricsConfig, store: Arc<MetricStore>) -> Self {
        let extractors = vec![
            MetricExtractor::errors(&config.namespace, &config.error_marker),
            MetricExtractor::invocations(&config.namespace),
            MetricExtractor::failed_invocations(&config.namespace, &config.error_marker),
        ];
        Self::new(PipelineConfig::from(config), extractors, store)
    }

    /// Metric store fed by this pipeline
    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// Submit a record for processing
    pub async fn submit(&self, record: ExecutionRecord) -> Result<()> {
        self.record_tx
            .send(record)
            .await
            .map_err(|e| Error::internal(format!("record channel closed: {e}")))
    }

    /// Run every extractor over one record and store the samples
    ///
    /// Returns the number of samples appended.
    pub fn process(&self, record: &ExecutionRecord) -> usize {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let mut appended = 0;
        for extractor in &self.extractors {
            let Some(sample) = extractor.extract(record) else {
                continue;
            };

            if !sample.is_well_formed() {
                warn!(metric = %sample.key, value = sample.value, "Dropping malformed sample");
                continue;
            }

            metrics::counter!("deadletter_metric_samples_total", "metric" => extractor.metric().to_string())
                .increment(1);
            self.store.append(sample);
            appended += 1;
        }

        self.extracted.fetch_add(appended as u64, Ordering::Relaxed);
        appended
    }

    /// Start the pipeline processing loop
    ///
    /// Runs until `cancel` fires, then processes whatever is still buffered.
    pub async fn start(&self, cancel: CancellationToken) {
        let mut record_rx = {
            let mut guard = self.record_rx.lock();
            match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("Pipeline already started");
                    return;
                }
            }
        };

        info!(
            buffer_size = self.config.buffer_size,
            extractors = self.extractors.len(),
            "Pipeline started"
        );

        let mut prune_interval = interval(self.config.prune_interval);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let mut drained = 0;
                    while let Ok(record) = record_rx.try_recv() {
                        self.process(&record);
                        drained += 1;
                    }
                    info!(drained, "Pipeline stopped");
                    break;
                }

                Some(record) = record_rx.recv() => {
                    log_record(&record);
                    self.process(&record);
                }

                _ = prune_interval.tick() => {
                    self.prune();
                }
            }
        }
    }

    fn prune(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.config.retention) else {
            return;
        };
        let removed = self.store.prune(Utc::now() - retention);
        if removed > 0 {
            debug!(removed, "Pruned expired samples");
        }
    }

    /// Get pipeline statistics
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue_capacity: self.record_tx.capacity(),
            queue_max_capacity: self.config.buffer_size.max(1),
            records_processed: self.processed.load(Ordering::Relaxed),
            samples_extracted: self.extracted.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl RecordSink for Pipeline {
    async fn emit(&self, record: ExecutionRecord) -> Result<()> {
        self.submit(record).await
    }
}

/// Mirror a record into the process log
fn log_record(record: &ExecutionRecord) {
    let fields = serde_json::Value::Object(record.fields.clone());
    if record.level.eq_ignore_ascii_case(crate::models::LEVEL_ERROR) {
        error!(component = %record.component, fields = %fields, "{}", record.message);
    } else {
        debug!(component = %record.component, fields = %fields, "{}", record.message);
    }
}

/// Pipeline statistics
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Current queue capacity (available slots)
    pub queue_capacity: usize,
    /// Maximum queue capacity
    pub queue_max_capacity: usize,
    /// Records run through the extractors
    pub records_processed: u64,
    /// Samples appended to the store
    pub samples_extracted: u64,
}
