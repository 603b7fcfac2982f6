//! # Idempotency Manager
//!
//! Durable deduplication plus the traceability audit trail. The dedup check
//! is a single atomic insert committed immediately and independently of any
//! later business processing: redelivered messages are detected by the
//! unique constraint, and only the very first sighting of a message id ever
//! reports "new".
//!
//! Traceability rows double as the saga coordinator's event-arrival signal:
//! a WAIT_EVENT step is satisfied by a row matching its correlation id and
//! expected event type with status `processed`.

use crate::messaging::{MessagingError, MessagingResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Final disposition recorded for a consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processed,
    Duplicate,
    Dlq,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processed => write!(f, "processed"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Dlq => write!(f, "dlq"),
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "duplicate" => Ok(Self::Duplicate),
            "dlq" => Ok(Self::Dlq),
            _ => Err(format!("Invalid processing status: {s}")),
        }
    }
}

/// Audit row upserted for every consumed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceabilityRecord {
    pub message_id: Uuid,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub consumer_group: String,
    pub status: ProcessingStatus,
    pub saga_correlation_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Durable store backing dedup keys and traceability rows.
///
/// `try_insert_key` must be atomic under concurrent callers: for any key, at
/// most one caller ever observes an insert.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert the dedup key; `true` means first sighting, `false` means the
    /// key already existed.
    async fn try_insert_key(&self, message_id: Uuid) -> MessagingResult<bool>;

    /// Upsert the traceability row for a message.
    async fn record_traceability(&self, record: &TraceabilityRecord) -> MessagingResult<()>;

    /// Look up a processed event row for a saga correlation id.
    async fn find_processed_event(
        &self,
        saga_correlation_id: Uuid,
        event_type: &str,
    ) -> MessagingResult<Option<TraceabilityRecord>>;

    /// Idempotency keys with no traceability row: messages marked "seen"
    /// whose outcome was never recorded (crash window). Operator tooling
    /// feeds alerts and manual replay from this.
    async fn find_unreconciled(&self, limit: i64) -> MessagingResult<Vec<Uuid>>;
}

/// Dedup and traceability operations over an [`IdempotencyStore`].
#[derive(Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    /// Durable duplicate check, committed before any business processing.
    ///
    /// The first call for a message id returns `false`; every later call
    /// (redelivery, concurrent delivery) returns `true`.
    pub async fn is_duplicate(&self, message_id: Uuid) -> MessagingResult<bool> {
        let inserted = self.store.try_insert_key(message_id).await?;
        if !inserted {
            debug!(message_id = %message_id, "Duplicate message detected");
        }
        Ok(!inserted)
    }

    /// Upsert the audit row for a message's outcome.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_traceability(
        &self,
        message_id: Uuid,
        topic: &str,
        partition: i32,
        offset: i64,
        consumer_group: &str,
        status: ProcessingStatus,
        saga_correlation_id: Option<Uuid>,
        event_type: Option<&str>,
    ) -> MessagingResult<()> {
        let record = TraceabilityRecord {
            message_id,
            topic: topic.to_string(),
            partition,
            offset,
            consumer_group: consumer_group.to_string(),
            status,
            saga_correlation_id,
            event_type: event_type.map(str::to_string),
            processed_at: Utc::now(),
        };
        self.store.record_traceability(&record).await
    }

    /// Event-arrival lookup used by saga WAIT_EVENT steps.
    pub async fn find_processed_event(
        &self,
        saga_correlation_id: Uuid,
        event_type: &str,
    ) -> MessagingResult<Option<TraceabilityRecord>> {
        self.store
            .find_processed_event(saga_correlation_id, event_type)
            .await
    }

    /// Reconciliation query: seen-but-unrecorded message ids.
    pub async fn find_unreconciled(&self, limit: i64) -> MessagingResult<Vec<Uuid>> {
        self.store.find_unreconciled(limit).await
    }
}

/// PostgreSQL-backed [`IdempotencyStore`].
///
/// Schema:
/// ```sql
/// CREATE TABLE idempotency_keys (
///   key UUID PRIMARY KEY,
///   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// CREATE TABLE message_traceability (
///   message_id UUID PRIMARY KEY,
///   topic VARCHAR NOT NULL,
///   "partition" INTEGER NOT NULL,
///   "offset" BIGINT NOT NULL,
///   consumer_group VARCHAR NOT NULL,
///   status VARCHAR NOT NULL,
///   saga_correlation_id UUID,
///   event_type VARCHAR,
///   processed_at TIMESTAMPTZ NOT NULL
/// );
/// ```
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TraceabilityRow {
    message_id: Uuid,
    topic: String,
    partition: i32,
    offset: i64,
    consumer_group: String,
    status: String,
    saga_correlation_id: Option<Uuid>,
    event_type: Option<String>,
    processed_at: DateTime<Utc>,
}

impl TraceabilityRow {
    fn into_record(self) -> MessagingResult<TraceabilityRecord> {
        let status = self
            .status
            .parse::<ProcessingStatus>()
            .map_err(MessagingError::internal)?;
        Ok(TraceabilityRecord {
            message_id: self.message_id,
            topic: self.topic,
            partition: self.partition,
            offset: self.offset,
            consumer_group: self.consumer_group,
            status,
            saga_correlation_id: self.saga_correlation_id,
            event_type: self.event_type,
            processed_at: self.processed_at,
        })
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_insert_key(&self, message_id: Uuid) -> MessagingResult<bool> {
        // Single statement, autocommitted: the dedup marker is durable the
        // moment this returns, independent of any later processing.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, created_at)
            VALUES ($1, NOW())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_traceability(&self, record: &TraceabilityRecord) -> MessagingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO message_traceability
                (message_id, topic, "partition", "offset", consumer_group,
                 status, saga_correlation_id, event_type, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (message_id) DO UPDATE SET
                topic = EXCLUDED.topic,
                "partition" = EXCLUDED."partition",
                "offset" = EXCLUDED."offset",
                consumer_group = EXCLUDED.consumer_group,
                status = EXCLUDED.status,
                saga_correlation_id = EXCLUDED.saga_correlation_id,
                event_type = EXCLUDED.event_type,
                processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(record.message_id)
        .bind(&record.topic)
        .bind(record.partition)
        .bind(record.offset)
        .bind(&record.consumer_group)
        .bind(record.status.to_string())
        .bind(record.saga_correlation_id)
        .bind(&record.event_type)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_processed_event(
        &self,
        saga_correlation_id: Uuid,
        event_type: &str,
    ) -> MessagingResult<Option<TraceabilityRecord>> {
        let row = sqlx::query_as::<_, TraceabilityRow>(
            r#"
            SELECT message_id, topic, "partition", "offset", consumer_group,
                   status, saga_correlation_id, event_type, processed_at
            FROM message_traceability
            WHERE saga_correlation_id = $1
              AND event_type = $2
              AND status = 'processed'
            ORDER BY processed_at
            LIMIT 1
            "#,
        )
        .bind(saga_correlation_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TraceabilityRow::into_record).transpose()
    }

    async fn find_unreconciled(&self, limit: i64) -> MessagingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT k.key
            FROM idempotency_keys k
            LEFT JOIN message_traceability t ON t.message_id = k.key
            WHERE t.message_id IS NULL
            ORDER BY k.created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdempotencyStore;

    fn manager() -> (IdempotencyManager, Arc<InMemoryIdempotencyStore>) {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        (IdempotencyManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_first_sighting_then_duplicate() {
        let (manager, _) = manager();
        let message_id = Uuid::new_v4();

        assert!(!manager.is_duplicate(message_id).await.unwrap());
        assert!(manager.is_duplicate(message_id).await.unwrap());
        assert!(manager.is_duplicate(message_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_callers_admit_exactly_one() {
        let (manager, _) = manager();
        let message_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.is_duplicate(message_id).await.unwrap()
            }));
        }

        let outcomes = futures::future::join_all(handles).await;
        let first_sightings = outcomes
            .into_iter()
            .filter(|outcome| !outcome.as_ref().unwrap())
            .count();
        assert_eq!(first_sightings, 1);
    }

    #[tokio::test]
    async fn test_traceability_upsert_and_event_lookup() {
        let (manager, _) = manager();
        let message_id = Uuid::new_v4();
        let correlation = Uuid::new_v4();

        manager
            .record_traceability(
                message_id,
                "events",
                0,
                17,
                "group-a",
                ProcessingStatus::Processed,
                Some(correlation),
                Some("campaign.approved"),
            )
            .await
            .unwrap();

        let found = manager
            .find_processed_event(correlation, "campaign.approved")
            .await
            .unwrap()
            .expect("event row should be found");
        assert_eq!(found.message_id, message_id);
        assert_eq!(found.offset, 17);

        // Wrong event type or non-processed status must not match
        assert!(manager
            .find_processed_event(correlation, "campaign.rejected")
            .await
            .unwrap()
            .is_none());

        manager
            .record_traceability(
                message_id,
                "events",
                0,
                17,
                "group-a",
                ProcessingStatus::Dlq,
                Some(correlation),
                Some("campaign.approved"),
            )
            .await
            .unwrap();
        assert!(manager
            .find_processed_event(correlation, "campaign.approved")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unreconciled_keys_surface() {
        let (manager, _) = manager();
        let recorded = Uuid::new_v4();
        let orphaned = Uuid::new_v4();

        assert!(!manager.is_duplicate(recorded).await.unwrap());
        assert!(!manager.is_duplicate(orphaned).await.unwrap());
        manager
            .record_traceability(
                recorded,
                "commands",
                0,
                1,
                "group-a",
                ProcessingStatus::Processed,
                None,
                None,
            )
            .await
            .unwrap();

        let unreconciled = manager.find_unreconciled(10).await.unwrap();
        assert_eq!(unreconciled, vec![orphaned]);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ProcessingStatus::Processed,
            ProcessingStatus::Duplicate,
            ProcessingStatus::Dlq,
        ] {
            assert_eq!(status.to_string().parse::<ProcessingStatus>(), Ok(status));
        }
        assert!("bogus".parse::<ProcessingStatus>().is_err());
    }
}
