//! In-process dead-letter store

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::models::DeadLetterRecord;

use super::DeadLetterStore;

/// Dead-letter store kept in memory; lost on restart
pub struct MemoryDeadLetterStore {
    records: Mutex<VecDeque<DeadLetterRecord>>,
    retention: Duration,
}

impl MemoryDeadLetterStore {
    /// Create an empty store
    pub fn new(retention: Duration) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            retention,
        }
    }
}

impl Default for MemoryDeadLetterStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(14 * 24 * 60 * 60))
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn enqueue(&self, record: DeadLetterRecord) -> Result<()> {
        self.records.lock().push_back(record);
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self.records.lock().len() as u64)
    }

    async fn drain(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut records = self.records.lock();
        let take = limit.min(records.len());
        Ok(records.drain(..take).collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| !r.is_expired(now, self.retention));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DispatchedEvent, Event, FailureReason};
    use std::sync::Arc;

    fn record(sequence: u64) -> DeadLetterRecord {
        DeadLetterRecord::new(
            DispatchedEvent {
                sequence,
                received_at: Utc::now(),
                event: Event::new("s", "t", "{}"),
            },
            FailureReason::transient("boom"),
            3,
        )
    }

    #[tokio::test]
    async fn test_drain_respects_limit_and_order() {
        let store = MemoryDeadLetterStore::default();
        for seq in 1..=5 {
            store.enqueue(record(seq)).await.unwrap();
        }

        let first = store.drain(2).await.unwrap();
        assert_eq!(first.iter().map(|r| r.event.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.depth().await.unwrap(), 3);

        let rest = store.drain(100).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(store.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_drains_never_share_records() {
        let store = Arc::new(MemoryDeadLetterStore::default());
        for seq in 0..100 {
            store.enqueue(record(seq)).await.unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.drain(30).await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.await.unwrap().into_iter().map(|r| r.event.sequence));
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 100);
    }
}
