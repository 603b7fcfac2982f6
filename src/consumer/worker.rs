//! # Consumer Poll Loop
//!
//! One synchronous poll loop per consumer instance; messages are processed
//! sequentially, so retry sleeps bound the loop's worst-case latency to the
//! sum of the backoff schedule. Horizontal scaling comes from more consumer
//! instances, not intra-loop concurrency.
//!
//! Per-message flow: deserialize (failure = poison pill, straight to DLQ) ->
//! durable dedup check in its own commit -> handler through the circuit
//! breaker with fixed backoff -> DLQ on exhaustion -> traceability record ->
//! offset commit. The offset is committed only after the outcome is durably
//! recorded, so a crash anywhere before redelivers the message and the dedup
//! check makes the redelivery a no-op.

use crate::config::ConsumerConfig;
use crate::consumer::dead_letter::DeadLetterQueue;
use crate::consumer::handler::{HandlerError, MessageHandler};
use crate::consumer::idempotency::{IdempotencyManager, ProcessingStatus};
use crate::messaging::{derived_message_id, Delivery, MessageEnvelope, MessagingResult, QueueClient};
use crate::metrics::{ConsumeOutcome, ConsumerMetrics};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const POISON_PILL_EXCEPTION: &str = "PayloadDeserializationError";
const CIRCUIT_OPEN_EXCEPTION: &str = "CircuitBreakerOpen";

/// Polling consumer for one topic.
pub struct Consumer {
    queue: Arc<dyn QueueClient>,
    topic: String,
    config: ConsumerConfig,
    idempotency: IdempotencyManager,
    dlq: Arc<DeadLetterQueue>,
    breaker: CircuitBreaker,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<ConsumerMetrics>,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        topic: impl Into<String>,
        config: ConsumerConfig,
        idempotency: IdempotencyManager,
        dlq: Arc<DeadLetterQueue>,
        breaker_config: CircuitBreakerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let topic = topic.into();
        let breaker = CircuitBreaker::new(format!("handler:{topic}"), breaker_config);
        Self {
            queue,
            topic,
            config,
            idempotency,
            dlq,
            breaker,
            handler,
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    /// Metrics handle for this consumer.
    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    /// Circuit breaker guarding the handler.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Poll-process loop. Runs until `shutdown` flips to `true`.
    ///
    /// The only error that ends the loop is a failed dead-letter write;
    /// everything else is logged, metered, and resolved into a
    /// commit/no-commit decision for the message at hand.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MessagingResult<()> {
        info!(
            topic = %self.topic,
            group = %self.config.group_id,
            "Consumer loop started"
        );

        loop {
            if *shutdown.borrow() {
                info!(topic = %self.topic, "Consumer loop stopping");
                return Ok(());
            }

            let batch = tokio::select! {
                result = self.queue.read(
                    &self.topic,
                    self.config.visibility_timeout_seconds,
                    self.config.batch_size,
                ) => result,
                _ = shutdown.changed() => continue,
            };

            let deliveries = match batch {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!(topic = %self.topic, error = %err, "Poll failed");
                    self.idle(&mut shutdown).await;
                    continue;
                }
            };

            if deliveries.is_empty() {
                self.idle(&mut shutdown).await;
                continue;
            }

            for delivery in deliveries {
                // Sequential by design: one in-flight message per instance.
                self.process_delivery(delivery).await?;
            }
        }
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Process one delivery end to end.
    ///
    /// Returns an error only when a dead-letter write fails; any other
    /// failure leaves the offset uncommitted so the message is redelivered.
    pub async fn process_delivery(&self, delivery: Delivery) -> MessagingResult<()> {
        let started = Instant::now();

        // 1. Deserialize. A payload that cannot be parsed is a poison pill:
        //    dead letter it and commit, the handler is never invoked.
        let envelope = match self.parse_envelope(&delivery) {
            Ok(envelope) => envelope,
            Err(parse_err) => {
                return self.handle_poison_pill(&delivery, &parse_err).await;
            }
        };

        // 2-3. Durable dedup check in its own committed transaction.
        let message_id = envelope.message_id;
        let duplicate = match self.idempotency.is_duplicate(message_id).await {
            Ok(duplicate) => duplicate,
            Err(err) => {
                // Store unavailable: leave uncommitted, redeliver later.
                error!(message_id = %message_id, error = %err, "Dedup check failed");
                self.metrics.record_outcome(ConsumeOutcome::Error);
                return Ok(());
            }
        };

        if duplicate {
            self.record_and_commit(&delivery, &envelope, ProcessingStatus::Duplicate)
                .await;
            self.metrics.record_outcome(ConsumeOutcome::Duplicate);
            self.metrics.record_processing_time(started.elapsed());
            return Ok(());
        }

        // 4. Handler through the circuit breaker with fixed backoff.
        match self.attempt_with_retries(&envelope).await {
            Ok(()) => {
                // 6-7. Durable outcome first, then the offset commit.
                self.record_and_commit(&delivery, &envelope, ProcessingStatus::Processed)
                    .await;
                self.metrics.record_outcome(ConsumeOutcome::Success);
            }
            Err(final_error) => {
                // 5. Retry budget exhausted (or fatal): dead letter.
                let (exception_class, exception_message) = classify(&final_error);
                self.dlq
                    .send_to_dlq(
                        &delivery.topic,
                        delivery.partition,
                        delivery.offset,
                        &self.config.group_id,
                        delivery.value.clone(),
                        envelope.wire_headers(),
                        exception_class,
                        &exception_message,
                    )
                    .await?;
                self.metrics.record_dead_letter(exception_class);
                self.record_and_commit(&delivery, &envelope, ProcessingStatus::Dlq)
                    .await;
                self.metrics.record_outcome(ConsumeOutcome::Dlq);
            }
        }

        self.metrics.record_processing_time(started.elapsed());
        Ok(())
    }

    /// Parse the wire value into an envelope, deriving a deterministic
    /// message id from the delivery coordinates when the value carries none.
    fn parse_envelope(&self, delivery: &Delivery) -> Result<MessageEnvelope, serde_json::Error> {
        let mut value = delivery.value.clone();
        if let Some(object) = value.as_object_mut() {
            if !object.contains_key("message_id") {
                let derived =
                    derived_message_id(&delivery.topic, delivery.partition, delivery.offset);
                warn!(
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    derived_message_id = %derived,
                    "Message without id; derived from delivery coordinates"
                );
                object.insert("message_id".to_string(), json!(derived));
            }
            if !object.contains_key("correlation_id") {
                object.insert("correlation_id".to_string(), json!(Uuid::new_v4()));
            }
        }
        MessageEnvelope::from_json(value)
    }

    async fn handle_poison_pill(
        &self,
        delivery: &Delivery,
        parse_err: &serde_json::Error,
    ) -> MessagingResult<()> {
        warn!(
            topic = %delivery.topic,
            offset = delivery.offset,
            error = %parse_err,
            "Poison pill: payload cannot be deserialized"
        );

        self.dlq
            .send_to_dlq(
                &delivery.topic,
                delivery.partition,
                delivery.offset,
                &self.config.group_id,
                delivery.value.clone(),
                std::collections::HashMap::new(),
                POISON_PILL_EXCEPTION,
                &parse_err.to_string(),
            )
            .await?;
        self.metrics.record_dead_letter(POISON_PILL_EXCEPTION);
        self.metrics.record_outcome(ConsumeOutcome::PoisonPill);

        // Poison pills are never retried: commit so the message is gone.
        if let Err(err) = self.queue.commit(&delivery.topic, delivery.offset).await {
            error!(topic = %delivery.topic, offset = delivery.offset, error = %err,
                "Offset commit failed after dead lettering poison pill");
        }
        Ok(())
    }

    /// Invoke the handler up to `max_retries` times with the fixed backoff
    /// schedule. Circuit-open rejections consume an attempt like any other
    /// retryable failure; a fatal handler error stops retrying immediately.
    async fn attempt_with_retries(&self, envelope: &MessageEnvelope) -> Result<(), AttemptFailure> {
        let intervals = self.config.retry_intervals();
        let max_retries = self.config.max_retries;
        let mut last_failure = AttemptFailure::Retryable("no attempt made".to_string());

        for attempt in 1..=max_retries {
            match self.breaker.call(|| self.handler.handle(envelope)).await {
                Ok(()) => {
                    debug!(
                        message_id = %envelope.message_id,
                        attempt = attempt,
                        "Handler succeeded"
                    );
                    return Ok(());
                }
                Err(CircuitBreakerError::CircuitOpen { component }) => {
                    warn!(
                        message_id = %envelope.message_id,
                        attempt = attempt,
                        component = %component,
                        "Attempt rejected: circuit open"
                    );
                    last_failure = AttemptFailure::CircuitOpen(component);
                }
                Err(CircuitBreakerError::OperationFailed(HandlerError::Fatal(message))) => {
                    warn!(
                        message_id = %envelope.message_id,
                        attempt = attempt,
                        error = %message,
                        "Fatal handler error; skipping remaining retries"
                    );
                    return Err(AttemptFailure::Fatal(message));
                }
                Err(CircuitBreakerError::OperationFailed(HandlerError::Retryable(message))) => {
                    warn!(
                        message_id = %envelope.message_id,
                        attempt = attempt,
                        error = %message,
                        "Retryable handler error"
                    );
                    last_failure = AttemptFailure::Retryable(message);
                }
            }

            if attempt < max_retries {
                // Fixed schedule; the final interval repeats if the budget
                // is longer than the schedule.
                let index = (attempt as usize - 1).min(intervals.len() - 1);
                tokio::time::sleep(intervals[index]).await;
            }
        }

        Err(last_failure)
    }

    /// Record the durable outcome, then commit the offset. Both failures are
    /// logged and leave the message for redelivery; the dedup check resolves
    /// the redelivered copy.
    async fn record_and_commit(
        &self,
        delivery: &Delivery,
        envelope: &MessageEnvelope,
        status: ProcessingStatus,
    ) {
        let traceability = self
            .idempotency
            .record_traceability(
                envelope.message_id,
                &delivery.topic,
                delivery.partition,
                delivery.offset,
                &self.config.group_id,
                status,
                Some(envelope.correlation_id),
                Some(&envelope.message_type),
            )
            .await;

        if let Err(err) = traceability {
            error!(
                message_id = %envelope.message_id,
                error = %err,
                "Traceability write failed; leaving offset uncommitted"
            );
            return;
        }

        if let Err(err) = self.queue.commit(&delivery.topic, delivery.offset).await {
            error!(
                message_id = %envelope.message_id,
                offset = delivery.offset,
                error = %err,
                "Offset commit failed; message will be redelivered"
            );
        }
    }
}

/// Terminal failure of the retry loop.
#[derive(Debug)]
enum AttemptFailure {
    Retryable(String),
    Fatal(String),
    CircuitOpen(String),
}

fn classify(failure: &AttemptFailure) -> (&'static str, String) {
    match failure {
        AttemptFailure::Retryable(message) => ("RetryableHandlerError", message.clone()),
        AttemptFailure::Fatal(message) => ("FatalHandlerError", message.clone()),
        AttemptFailure::CircuitOpen(component) => (
            CIRCUIT_OPEN_EXCEPTION,
            format!("circuit open for {component}"),
        ),
    }
}
