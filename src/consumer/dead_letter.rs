//! # Dead Letter Queue
//!
//! Durable sink for unprocessable messages: poison pills that never reach a
//! handler, and messages that exhausted their retry budget. Every record
//! keeps the original delivery coordinates and payload so tooling can
//! inspect and replay. A DLQ write failure propagates as a fatal condition;
//! swallowing it would silently void the at-least-once guarantee.

use crate::config::TopicConfig;
use crate::messaging::{MessageEnvelope, MessagingError, MessagingResult, Producer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// One dead-lettered message, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub consumer_group: String,
    pub exception_class: String,
    pub exception_message: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Durable store for dead letter records.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(&self, record: &DeadLetterRecord) -> MessagingResult<()>;
}

/// Dead letter sink combining the durable store with an optional republish
/// to the dead-letter topic for tooling and replay.
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    producer: Option<Arc<Producer>>,
    topics: TopicConfig,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn DeadLetterStore>, topics: TopicConfig) -> Self {
        Self {
            store,
            producer: None,
            topics,
        }
    }

    /// Also republish an enriched envelope on the dead-letter topic.
    pub fn with_republish(mut self, producer: Arc<Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Persist a dead letter record; optionally republish it.
    ///
    /// The durable insert is the guarantee; republish is best-effort. An
    /// insert failure is returned to the caller as
    /// [`MessagingError::DeadLetterWrite`] and must abort the message's
    /// commit path.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_partition: i32,
        original_offset: i64,
        consumer_group: &str,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
        exception_class: &str,
        exception_message: &str,
    ) -> MessagingResult<()> {
        let record = DeadLetterRecord {
            original_topic: original_topic.to_string(),
            original_partition,
            original_offset,
            consumer_group: consumer_group.to_string(),
            exception_class: exception_class.to_string(),
            exception_message: exception_message.to_string(),
            payload: payload.clone(),
            headers,
            created_at: Utc::now(),
        };

        self.store.insert(&record).await.map_err(|e| {
            error!(
                topic = %original_topic,
                offset = original_offset,
                error = %e,
                "Dead letter write failed; at-least-once guarantee at risk"
            );
            MessagingError::dead_letter_write(
                original_topic,
                original_partition,
                original_offset,
                e.to_string(),
            )
        })?;

        warn!(
            topic = %original_topic,
            partition = original_partition,
            offset = original_offset,
            exception_class = %exception_class,
            "Message dead lettered"
        );

        if let Some(producer) = &self.producer {
            let tenant_id = record
                .headers
                .get(crate::messaging::headers::TENANT_ID)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let envelope = MessageEnvelope::new("dead_letter.recorded", tenant_id, payload)
                .with_metadata_entry(
                    "original_topic",
                    serde_json::Value::String(original_topic.to_string()),
                )
                .with_metadata_entry("original_offset", serde_json::json!(original_offset))
                .with_metadata_entry(
                    "exception_class",
                    serde_json::Value::String(exception_class.to_string()),
                );
            // Best effort: the durable record above already holds the message.
            if let Err(e) = producer.produce(&self.topics.dead_letter, &envelope).await {
                warn!(error = %e, "Dead letter republish failed");
            }
        }

        Ok(())
    }
}

/// PostgreSQL-backed [`DeadLetterStore`].
///
/// Schema:
/// ```sql
/// CREATE TABLE dead_letters (
///   id BIGSERIAL PRIMARY KEY,
///   original_topic VARCHAR NOT NULL,
///   original_partition INTEGER NOT NULL,
///   original_offset BIGINT NOT NULL,
///   consumer_group VARCHAR NOT NULL,
///   exception_class VARCHAR NOT NULL,
///   exception_message TEXT NOT NULL,
///   payload JSONB NOT NULL,
///   headers JSONB NOT NULL,
///   created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recent dead letters for operator inspection.
    pub async fn recent(&self, limit: i64) -> MessagingResult<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT original_topic, original_partition, original_offset,
                   consumer_group, exception_class, exception_message,
                   payload, headers, created_at
            FROM dead_letters
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterRow::into_record).collect()
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    original_topic: String,
    original_partition: i32,
    original_offset: i64,
    consumer_group: String,
    exception_class: String,
    exception_message: String,
    payload: serde_json::Value,
    headers: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl DeadLetterRow {
    fn into_record(self) -> MessagingResult<DeadLetterRecord> {
        let headers: HashMap<String, String> = serde_json::from_value(self.headers)?;
        Ok(DeadLetterRecord {
            original_topic: self.original_topic,
            original_partition: self.original_partition,
            original_offset: self.original_offset,
            consumer_group: self.consumer_group,
            exception_class: self.exception_class,
            exception_message: self.exception_message,
            payload: self.payload,
            headers,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert(&self, record: &DeadLetterRecord) -> MessagingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (original_topic, original_partition, original_offset,
                 consumer_group, exception_class, exception_message,
                 payload, headers, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.original_topic)
        .bind(record.original_partition)
        .bind(record.original_offset)
        .bind(&record.consumer_group)
        .bind(&record.exception_class)
        .bind(&record.exception_message)
        .bind(&record.payload)
        .bind(serde_json::to_value(&record.headers)?)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDeadLetterStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_to_dlq_persists_record() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let dlq = DeadLetterQueue::new(store.clone(), TopicConfig::default());

        dlq.send_to_dlq(
            "commands",
            0,
            99,
            "group-a",
            json!({"broken": true}),
            HashMap::new(),
            "RetryableHandlerError",
            "downstream unavailable",
        )
        .await
        .unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_topic, "commands");
        assert_eq!(records[0].original_offset, 99);
        assert_eq!(records[0].exception_class, "RetryableHandlerError");
    }

    #[tokio::test]
    async fn test_store_failure_propagates_as_dead_letter_write() {
        struct BrokenStore;

        #[async_trait]
        impl DeadLetterStore for BrokenStore {
            async fn insert(&self, _record: &DeadLetterRecord) -> MessagingResult<()> {
                Err(MessagingError::internal("disk full"))
            }
        }

        let dlq = DeadLetterQueue::new(Arc::new(BrokenStore), TopicConfig::default());
        let result = dlq
            .send_to_dlq(
                "commands",
                0,
                1,
                "group-a",
                json!({}),
                HashMap::new(),
                "FatalHandlerError",
                "bad input",
            )
            .await;

        assert!(matches!(
            result,
            Err(MessagingError::DeadLetterWrite { offset: 1, .. })
        ));
    }
}
