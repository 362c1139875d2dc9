//! PostgreSQL dead-letter store

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::PostgresPool;
use crate::error::{Error, Result};
use crate::models::{DeadLetterRecord, DispatchedEvent, Event, FailureReason};

use super::DeadLetterStore;

/// Dead-letter store backed by the `dead_letters` table
///
/// `depth` reads committed rows only, so it can lag concurrent enqueues by the
/// duration of their transactions.
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
    retention: Duration,
}

impl PostgresDeadLetterStore {
    /// Create a new store on an existing pool
    pub fn new(pool: &PostgresPool, retention: Duration) -> Self {
        Self {
            pool: pool.pool().clone(),
            retention,
        }
    }
}

#[async_trait::async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn enqueue(&self, record: DeadLetterRecord) -> Result<()> {
        let sequence = i64::try_from(record.event.sequence)
            .map_err(|_| Error::validation("sequence number out of range"))?;
        let attempts = i32::try_from(record.attempts)
            .map_err(|_| Error::validation("attempt count out of range"))?;
        let reason = serde_json::to_value(&record.reason)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, sequence, source, detail_type, payload, received_at,
                reason, attempts, enqueued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(sequence)
        .bind(&record.event.event.source)
        .bind(&record.event.event.detail_type)
        .bind(record.event.event.payload.as_ref())
        .bind(record.event.received_at)
        .bind(&reason)
        .bind(attempts)
        .bind(record.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(e.to_string()))?;

        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn drain(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            DELETE FROM dead_letters
            WHERE id IN (
                SELECT id FROM dead_letters
                ORDER BY enqueued_at, sequence
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(e.to_string()))?;

        let mut records = rows
            .into_iter()
            .map(DeadLetterRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| {
            (a.enqueued_at, a.event.sequence).cmp(&(b.enqueued_at, b.event.sequence))
        });

        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::config(e.to_string()))?;

        let result = sqlx::query("DELETE FROM dead_letters WHERE enqueued_at <= $1")
            .bind(now - retention)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    sequence: i64,
    source: String,
    detail_type: String,
    payload: Vec<u8>,
    received_at: DateTime<Utc>,
    reason: serde_json::Value,
    attempts: i32,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = Error;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let reason: FailureReason = serde_json::from_value(row.reason)?;

        Ok(DeadLetterRecord {
            id: row.id,
            event: DispatchedEvent {
                sequence: u64::try_from(row.sequence).unwrap_or_default(),
                received_at: row.received_at,
                event: Event {
                    source: row.source,
                    detail_type: row.detail_type,
                    payload: Bytes::from(row.payload),
                },
            },
            reason,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            enqueued_at: row.enqueued_at,
        })
    }
}
