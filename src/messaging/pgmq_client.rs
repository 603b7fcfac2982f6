//! # PostgreSQL Message Queue Transport (pgmq-rs)
//!
//! Broker seam for the messaging core. The [`QueueClient`] trait is the
//! object-safe surface the producer and consumer speak; [`PgmqQueueClient`]
//! implements it over the pgmq-rs crate.
//!
//! Transport mapping: a topic is a pgmq queue; each queue is one totally
//! ordered stream, so deliveries report partition 0 and the pgmq `msg_id` as
//! the offset. Committing an offset deletes the message; an uncommitted
//! message reappears after its visibility timeout expires, which is what
//! makes delivery at-least-once.

use crate::messaging::errors::{MessagingError, MessagingResult};
use async_trait::async_trait;
use pgmq::PGMQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One message handed to a consumer, with its delivery coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Logical topic the message was read from
    pub topic: String,
    /// Partition within the topic (always 0 on the pgmq transport)
    pub partition: i32,
    /// Position within the partition; commits are addressed by this
    pub offset: i64,
    /// How many times this message has been delivered (1 = first delivery)
    pub delivery_count: i32,
    /// Raw message value (JSON-encoded envelope)
    pub value: serde_json::Value,
}

/// Object-safe broker client.
///
/// Implementations must preserve per-partition-key ordering and must not
/// drop an uncommitted message: a message read but never committed has to be
/// redelivered eventually.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Create the topic if it does not exist.
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()>;

    /// Publish one message value, routed by `partition_key`. Returns the
    /// assigned offset.
    async fn send(
        &self,
        topic: &str,
        partition_key: &[u8],
        value: &serde_json::Value,
    ) -> MessagingResult<i64>;

    /// Read up to `max_messages` messages, invisible to other readers for
    /// `visibility_timeout_seconds`.
    async fn read(
        &self,
        topic: &str,
        visibility_timeout_seconds: i32,
        max_messages: i32,
    ) -> MessagingResult<Vec<Delivery>>;

    /// Commit (permanently remove) a delivered message.
    async fn commit(&self, topic: &str, offset: i64) -> MessagingResult<()>;
}

/// pgmq-rs backed [`QueueClient`].
#[derive(Debug, Clone)]
pub struct PgmqQueueClient {
    pgmq: PGMQueue,
}

impl PgmqQueueClient {
    /// Connect using a database URL.
    pub async fn new(database_url: &str) -> MessagingResult<Self> {
        info!("Connecting to pgmq broker");
        let pgmq = PGMQueue::new(database_url.to_string())
            .await
            .map_err(|e| MessagingError::queue_operation("*", "connect", e.to_string()))?;
        info!("Connected to pgmq broker");
        Ok(Self { pgmq })
    }

    /// Reuse an existing connection pool.
    pub async fn new_with_pool(pool: sqlx::PgPool) -> Self {
        debug!("Creating pgmq client with shared connection pool");
        let pgmq = PGMQueue::new_with_pool(pool).await;
        Self { pgmq }
    }

    /// Underlying connection pool, for the durable stores that share it.
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pgmq.connection
    }
}

#[async_trait]
impl QueueClient for PgmqQueueClient {
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        self.pgmq
            .create(topic)
            .await
            .map_err(|e| MessagingError::queue_operation(topic, "create", e.to_string()))?;
        debug!(topic = %topic, "Topic ensured");
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        _partition_key: &[u8],
        value: &serde_json::Value,
    ) -> MessagingResult<i64> {
        // One queue = one partition, so the key needs no routing here; it is
        // still part of the trait contract for partitioned transports.
        let offset = self
            .pgmq
            .send(topic, value)
            .await
            .map_err(|e| MessagingError::queue_operation(topic, "send", e.to_string()))?;
        debug!(topic = %topic, offset = offset, "Message published");
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        visibility_timeout_seconds: i32,
        max_messages: i32,
    ) -> MessagingResult<Vec<Delivery>> {
        let messages = self
            .pgmq
            .read_batch::<serde_json::Value>(topic, Some(visibility_timeout_seconds), max_messages)
            .await
            .map_err(|e| MessagingError::queue_operation(topic, "read", e.to_string()))?
            .unwrap_or_default();

        Ok(messages
            .into_iter()
            .map(|m| Delivery {
                topic: topic.to_string(),
                partition: 0,
                offset: m.msg_id,
                delivery_count: m.read_ct,
                value: m.message,
            })
            .collect())
    }

    async fn commit(&self, topic: &str, offset: i64) -> MessagingResult<()> {
        self.pgmq
            .delete(topic, offset)
            .await
            .map_err(|e| MessagingError::queue_operation(topic, "commit", e.to_string()))?;
        debug!(topic = %topic, offset = offset, "Offset committed");
        Ok(())
    }
}
