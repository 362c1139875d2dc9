//! Dead-letter storage
//!
//! Events that exhausted their retry budget are kept here until an operator drains
//! them. Backends: process memory, an NDJSON file, or a PostgreSQL table.

mod file;
mod memory;
mod postgres;

pub use file::FileDeadLetterStore;
pub use memory::MemoryDeadLetterStore;
pub use postgres::PostgresDeadLetterStore;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::collector::MetricStore;
use crate::config::{Config, DeadLetterBackend};
use crate::db::PostgresPool;
use crate::error::Result;
use crate::models::{DeadLetterRecord, MetricKey, MetricSample, DEAD_LETTER_DEPTH};

/// Durable holding area for exhausted events
///
/// Writers may enqueue concurrently. `drain` removes and returns records in
/// enqueue order; a record is never visible to two drains.
#[async_trait::async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist a record; an error means the record was not stored
    async fn enqueue(&self, record: DeadLetterRecord) -> Result<()>;

    /// Number of records not yet drained
    async fn depth(&self) -> Result<u64>;

    /// Remove and return up to `limit` of the oldest records
    async fn drain(&self, limit: usize) -> Result<Vec<DeadLetterRecord>>;

    /// Remove records that are past the retention horizon at `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Check the backend is reachable
    async fn health_check(&self) -> Result<()> {
        self.depth().await.map(|_| ())
    }
}

/// Open the store selected by the configuration
pub async fn open(config: &Config) -> Result<Arc<dyn DeadLetterStore>> {
    let retention = config.dead_letter.retention;

    let store: Arc<dyn DeadLetterStore> = match config.dead_letter.backend {
        DeadLetterBackend::Memory => Arc::new(MemoryDeadLetterStore::new(retention)),
        DeadLetterBackend::File => {
            let store = FileDeadLetterStore::open(config.dead_letter.resolved_path(), retention).await?;
            info!(path = %store.path().display(), "Using dead-letter file");
            Arc::new(store)
        }
        DeadLetterBackend::Postgres => {
            let pool = PostgresPool::new(&config.database).await?;
            pool.health_check().await?;
            pool.migrate().await?;
            Arc::new(PostgresDeadLetterStore::new(&pool, retention))
        }
    };

    store.health_check().await?;
    info!(backend = ?config.dead_letter.backend, "Dead-letter store opened");
    Ok(store)
}

/// Periodically removes records past the retention horizon
pub struct RetentionSweeper {
    store: Arc<dyn DeadLetterStore>,
    interval: Duration,
}

impl RetentionSweeper {
    /// Create a new sweeper
    pub fn new(store: Arc<dyn DeadLetterStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run one sweep
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.purge_expired(now).await?;
        if removed > 0 {
            info!(removed, "Removed expired dead-letter records");
        }
        Ok(removed)
    }

    /// Sweep on every tick until cancelled
    pub async fn start(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}

/// Samples the store depth into the metric store so it can be alarmed on
pub struct DepthSampler {
    store: Arc<dyn DeadLetterStore>,
    metrics: Arc<MetricStore>,
    key: MetricKey,
    interval: Duration,
}

impl DepthSampler {
    /// Create a sampler writing `ApproximateNumberOfMessagesVisible` for `queue`
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        metrics: Arc<MetricStore>,
        namespace: &str,
        queue: &str,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            key: MetricKey::new(namespace, DEAD_LETTER_DEPTH, queue),
            interval,
        }
    }

    /// Take one sample
    pub async fn sample(&self, now: DateTime<Utc>) -> Result<u64> {
        let depth = self.store.depth().await?;
        self.metrics
            .append(MetricSample::new(self.key.clone(), depth as f64, now));
        metrics::gauge!("deadletter_queue_depth").set(depth as f64);
        debug!(depth, "Sampled dead-letter depth");
        Ok(depth)
    }

    /// Sample on every tick until cancelled
    pub async fn start(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sample(Utc::now()).await {
                        error!(error = %e, "Failed to sample dead-letter depth");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DispatchedEvent, Event, FailureReason, MetricSelector};

    fn record() -> DeadLetterRecord {
        DeadLetterRecord::new(
            DispatchedEvent {
                sequence: 1,
                received_at: Utc::now(),
                event: Event::new("s", "t", "{}"),
            },
            FailureReason::transient("boom"),
            3,
        )
    }

    #[tokio::test]
    async fn test_depth_sampler_writes_series() {
        let store: Arc<dyn DeadLetterStore> = Arc::new(MemoryDeadLetterStore::default());
        let metrics = Arc::new(MetricStore::default());
        let sampler = DepthSampler::new(
            store.clone(),
            metrics.clone(),
            "ns",
            "dlq",
            Duration::from_secs(60),
        );

        store.enqueue(record()).await.unwrap();
        store.enqueue(record()).await.unwrap();
        let now = Utc::now();
        assert_eq!(sampler.sample(now).await.unwrap(), 2);

        let values = metrics.values(
            &MetricSelector::new("ns", DEAD_LETTER_DEPTH).for_component("dlq"),
            now - chrono::Duration::seconds(1),
            now + chrono::Duration::seconds(1),
        );
        assert_eq!(values, vec![2.0]);
    }

    #[tokio::test]
    async fn test_open_checks_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.dead_letter.backend = DeadLetterBackend::File;
        config.dead_letter.path = Some(dir.path().join("dlq.ndjson"));

        let store = open(&config).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), 0);
        // The health check creates the file up front.
        assert!(dir.path().join("dlq.ndjson").exists());

        config.dead_letter.path = Some(dir.path().to_path_buf());
        let err = open(&config).await.err().unwrap();
        assert!(matches!(err, crate::error::Error::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_sweeper_purges_old_records() {
        let store = Arc::new(MemoryDeadLetterStore::new(Duration::from_secs(3600)));
        let mut old = record();
        old.enqueued_at = Utc::now() - chrono::Duration::hours(2);
        store.enqueue(old).await.unwrap();
        store.enqueue(record()).await.unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), Duration::from_secs(60));
        assert_eq!(sweeper.sweep(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.depth().await.unwrap(), 1);
    }
}
