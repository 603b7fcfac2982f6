//! # Message Producer
//!
//! Publishes envelopes with durability guarantees. `produce` performs the
//! rate-limit admission check, then enqueues onto a bounded in-process send
//! queue and returns; a background send task performs the broker publish and
//! records the delivery outcome asynchronously. `true` therefore means
//! "accepted into the send queue", not "delivered".
//!
//! Expected rejections (tenant over rate limit, send queue full) return
//! `Ok(false)` without contacting the broker; only unexpected faults raise.

use crate::config::{ProducerConfig, TopicConfig};
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::pgmq_client::QueueClient;
use crate::metrics::ProducerMetrics;
use crate::resilience::RateLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Upper bound applied by [`Producer::close`] while draining the send queue.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

struct SendRequest {
    topic: String,
    partition_key: Vec<u8>,
    value: serde_json::Value,
    message_id: uuid::Uuid,
}

/// Asynchronous producer over a [`QueueClient`].
pub struct Producer {
    topics: TopicConfig,
    limiter: Option<RateLimiter>,
    tx: mpsc::Sender<SendRequest>,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    metrics: Arc<ProducerMetrics>,
    queue: Arc<dyn QueueClient>,
}

impl Producer {
    /// Create a producer and spawn its background send task.
    pub fn new(
        queue: Arc<dyn QueueClient>,
        topics: TopicConfig,
        config: &ProducerConfig,
        limiter: Option<RateLimiter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<SendRequest>(config.send_queue_size);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let metrics = Arc::new(ProducerMetrics::default());

        tokio::spawn(Self::send_loop(
            queue.clone(),
            rx,
            in_flight.clone(),
            drained.clone(),
            metrics.clone(),
        ));

        Self {
            topics,
            limiter,
            tx,
            in_flight,
            drained,
            metrics,
            queue,
        }
    }

    /// Background task draining the send queue. The delivery outcome of each
    /// message is recorded here, asynchronously to the `produce` call that
    /// enqueued it.
    async fn send_loop(
        queue: Arc<dyn QueueClient>,
        mut rx: mpsc::Receiver<SendRequest>,
        in_flight: Arc<AtomicUsize>,
        drained: Arc<Notify>,
        metrics: Arc<ProducerMetrics>,
    ) {
        while let Some(request) = rx.recv().await {
            match queue
                .send(&request.topic, &request.partition_key, &request.value)
                .await
            {
                Ok(offset) => {
                    metrics.record_delivered();
                    debug!(
                        topic = %request.topic,
                        message_id = %request.message_id,
                        offset = offset,
                        "Message delivered"
                    );
                }
                Err(err) => {
                    metrics.record_delivery_failed();
                    error!(
                        topic = %request.topic,
                        message_id = %request.message_id,
                        error = %err,
                        "Message delivery failed"
                    );
                }
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
            drained.notify_waiters();
        }
    }

    /// Ensure all configured topics exist on the broker.
    pub async fn ensure_topics(&self) -> MessagingResult<()> {
        for topic in [
            &self.topics.commands,
            &self.topics.events,
            &self.topics.audit,
            &self.topics.dead_letter,
        ] {
            self.queue.ensure_topic(topic).await?;
        }
        Ok(())
    }

    /// Publish an envelope to `topic`, keyed by its tenant id.
    ///
    /// Returns `Ok(false)` when the tenant is over its rate limit or the send
    /// queue is full; no message reaches the broker in either case and the
    /// caller must not assume delivery.
    pub async fn produce(&self, topic: &str, envelope: &MessageEnvelope) -> MessagingResult<bool> {
        if let Some(limiter) = &self.limiter {
            if !limiter.check_admission(&envelope.tenant_id).await {
                self.metrics.record_rate_limited();
                return Ok(false);
            }
        }

        let value = envelope.to_json()?;
        debug!(
            topic = %topic,
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id,
            tenant_id = %envelope.tenant_id,
            causation_id = ?envelope.causation_id,
            "Enqueueing message for publish"
        );

        let request = SendRequest {
            topic: topic.to_string(),
            partition_key: envelope.partition_key().to_vec(),
            value,
            message_id: envelope.message_id,
        };

        // Count before try_send so a racing flush never observes a dip to 0
        // while the request is in the channel.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(request) {
            Ok(()) => {
                self.metrics.record_enqueued();
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.metrics.record_queue_full();
                warn!(topic = %topic, "Producer send queue full, message rejected");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(MessagingError::internal("Producer send task has stopped"))
            }
        }
    }

    /// Publish an imperative command to the commands topic.
    pub async fn produce_command(&self, envelope: &MessageEnvelope) -> MessagingResult<bool> {
        let topic = self.topics.commands.clone();
        self.produce(&topic, envelope).await
    }

    /// Publish a fact event to the events topic.
    pub async fn produce_event(&self, envelope: &MessageEnvelope) -> MessagingResult<bool> {
        let topic = self.topics.events.clone();
        self.produce(&topic, envelope).await
    }

    /// Publish a compliance-trail event to the audit topic.
    pub async fn produce_audit_event(&self, envelope: &MessageEnvelope) -> MessagingResult<bool> {
        let topic = self.topics.audit.clone();
        self.produce(&topic, envelope).await
    }

    /// Block until the send queue drains or `timeout` elapses.
    ///
    /// Returns the number of messages still pending (0 on a full drain).
    pub async fn flush(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return 0;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.in_flight.load(Ordering::Acquire);
            }
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return 0;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.in_flight.load(Ordering::Acquire);
            }
        }
    }

    /// Flush with a fixed upper bound, logging any undelivered remainder.
    pub async fn close(&self) {
        let remaining = self.flush(CLOSE_FLUSH_TIMEOUT).await;
        if remaining > 0 {
            warn!(
                pending = remaining,
                "Producer closed with undelivered messages in the send queue"
            );
        }
    }

    /// Metrics handle for this producer.
    pub fn metrics(&self) -> &ProducerMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueueClient;
    use crate::resilience::{InMemoryRateLimitStore, RateLimitConfig};
    use serde_json::json;

    fn test_topics() -> TopicConfig {
        TopicConfig::default()
    }

    fn test_producer(limiter: Option<RateLimiter>) -> (Producer, Arc<InMemoryQueueClient>) {
        let queue = Arc::new(InMemoryQueueClient::new());
        let producer = Producer::new(
            queue.clone(),
            test_topics(),
            &ProducerConfig::default(),
            limiter,
        );
        (producer, queue)
    }

    #[tokio::test]
    async fn test_produce_routes_to_configured_topics() {
        let (producer, queue) = test_producer(None);
        let envelope = MessageEnvelope::new("campaign.generate", "tenant-1", json!({}));

        assert!(producer.produce_command(&envelope).await.unwrap());
        assert!(producer.produce_event(&envelope).await.unwrap());
        assert!(producer.produce_audit_event(&envelope).await.unwrap());
        assert_eq!(producer.flush(Duration::from_secs(1)).await, 0);

        assert_eq!(queue.len(&test_topics().commands), 1);
        assert_eq!(queue.len(&test_topics().events), 1);
        assert_eq!(queue.len(&test_topics().audit), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_produce_skips_broker() {
        let limiter = RateLimiter::new(
            Arc::new(InMemoryRateLimitStore::new()),
            RateLimitConfig {
                enabled: true,
                rate_per_second: 1.0,
                burst: 1.0,
            },
        );
        let (producer, queue) = test_producer(Some(limiter));
        let envelope = MessageEnvelope::new("campaign.generate", "tenant-1", json!({}));

        let first = producer.produce_command(&envelope).await.unwrap();
        let second = producer.produce_command(&envelope).await.unwrap();
        assert!(first);
        assert!(!second);

        assert_eq!(producer.flush(Duration::from_secs(1)).await, 0);
        assert_eq!(queue.len(&test_topics().commands), 1);
        assert_eq!(producer.metrics().snapshot().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_flush_reports_zero_when_drained() {
        let (producer, _queue) = test_producer(None);
        for _ in 0..20 {
            let envelope = MessageEnvelope::new("asset.render", "tenant-2", json!({}));
            assert!(producer.produce_event(&envelope).await.unwrap());
        }
        assert_eq!(producer.flush(Duration::from_secs(2)).await, 0);
        assert_eq!(producer.metrics().snapshot().delivered, 20);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_recorded_not_raised() {
        let queue = Arc::new(InMemoryQueueClient::new());
        queue.fail_next_sends(1);
        let producer = Producer::new(
            queue.clone(),
            test_topics(),
            &ProducerConfig::default(),
            None,
        );
        let envelope = MessageEnvelope::new("asset.render", "tenant-3", json!({}));

        // Accepted into the send queue even though delivery will fail.
        assert!(producer.produce_event(&envelope).await.unwrap());
        assert_eq!(producer.flush(Duration::from_secs(1)).await, 0);
        assert_eq!(producer.metrics().snapshot().delivery_failed, 1);
    }
}
