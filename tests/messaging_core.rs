//! End-to-end behavior of the messaging core over the in-memory backends:
//! produce -> consume -> deduplicate -> dead-letter, and a saga driven by a
//! real consumer feeding events back to the coordinator.

use async_trait::async_trait;
use courier_core::config::{ConsumerConfig, ProducerConfig, SagaConfig, TopicConfig};
use courier_core::consumer::{
    Consumer, DeadLetterQueue, HandlerError, IdempotencyManager, MessageHandler,
};
use courier_core::memory::{
    InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryQueueClient, InMemorySagaStore,
};
use courier_core::messaging::{MessageEnvelope, Producer, QueueClient};
use courier_core::resilience::CircuitBreakerConfig;
use courier_core::saga::{SagaCoordinator, SagaState, SagaStep};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct RecordingHandler {
    invocations: AtomicU32,
    fail_first: AtomicU32,
}

impl RecordingHandler {
    fn new(failures: u32) -> Self {
        Self {
            invocations: AtomicU32::new(0),
            fail_first: AtomicU32::new(failures),
        }
    }

    fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(HandlerError::retryable("transient downstream failure"))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    queue: Arc<InMemoryQueueClient>,
    producer: Arc<Producer>,
    idempotency: IdempotencyManager,
    dlq_store: Arc<InMemoryDeadLetterStore>,
    topics: TopicConfig,
}

fn harness() -> Harness {
    let topics = TopicConfig::default();
    let queue = Arc::new(InMemoryQueueClient::new());
    let producer = Arc::new(Producer::new(
        queue.clone(),
        topics.clone(),
        &ProducerConfig::default(),
        None,
    ));
    let idempotency = IdempotencyManager::new(Arc::new(InMemoryIdempotencyStore::new()));
    let dlq_store = Arc::new(InMemoryDeadLetterStore::new());
    Harness {
        queue,
        producer,
        idempotency,
        dlq_store,
        topics,
    }
}

fn consumer_for(harness: &Harness, topic: &str, handler: Arc<dyn MessageHandler>) -> Consumer {
    let config = ConsumerConfig {
        poll_interval_ms: 10,
        retry_intervals_ms: vec![10, 20, 50],
        ..ConsumerConfig::default()
    };
    Consumer::new(
        harness.queue.clone(),
        topic,
        config,
        harness.idempotency.clone(),
        Arc::new(DeadLetterQueue::new(
            harness.dlq_store.clone(),
            harness.topics.clone(),
        )),
        CircuitBreakerConfig::default(),
        handler,
    )
}

#[tokio::test]
async fn produced_messages_are_consumed_exactly_once_effectively() {
    let h = harness();
    let handler = Arc::new(RecordingHandler::new(0));
    let consumer = Arc::new(consumer_for(&h, "commands", handler.clone()));

    let envelope = MessageEnvelope::new("campaign.generate", "tenant-1", json!({"id": 7}));
    assert!(h.producer.produce_command(&envelope).await.unwrap());
    // The same envelope published twice: second consumption must deduplicate.
    assert!(h.producer.produce_command(&envelope).await.unwrap());
    assert_eq!(h.producer.flush(Duration::from_secs(1)).await, 0);

    let (shutdown, rx) = watch::channel(false);
    let run = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(rx).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(handler.invocations(), 1);
    let snapshot = consumer.metrics().snapshot();
    assert_eq!(snapshot.success, 1);
    assert_eq!(snapshot.duplicate, 1);
    assert!(h.queue.is_empty("commands"));
    assert!(h.dlq_store.records().is_empty());
}

#[tokio::test]
async fn transient_failures_recover_within_retry_budget() {
    let h = harness();
    let handler = Arc::new(RecordingHandler::new(2));
    let consumer = consumer_for(&h, "commands", handler.clone());

    let envelope = MessageEnvelope::new("asset.render", "tenant-2", json!({}));
    assert!(h.producer.produce_command(&envelope).await.unwrap());
    assert_eq!(h.producer.flush(Duration::from_secs(1)).await, 0);

    let delivery = h.queue.read("commands", 60, 1).await.unwrap().remove(0);
    consumer.process_delivery(delivery).await.unwrap();

    assert_eq!(handler.invocations(), 3);
    assert_eq!(consumer.metrics().snapshot().success, 1);
    assert!(h.dlq_store.records().is_empty());
}

#[tokio::test]
async fn exhausted_message_lands_in_dlq_with_coordinates() {
    let h = harness();
    let handler = Arc::new(RecordingHandler::new(u32::MAX));
    let consumer = consumer_for(&h, "commands", handler.clone());

    let envelope = MessageEnvelope::new("asset.render", "tenant-2", json!({}));
    assert!(h.producer.produce_command(&envelope).await.unwrap());
    assert_eq!(h.producer.flush(Duration::from_secs(1)).await, 0);

    let delivery = h.queue.read("commands", 60, 1).await.unwrap().remove(0);
    let offset = delivery.offset;
    consumer.process_delivery(delivery).await.unwrap();

    let records = h.dlq_store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_topic, "commands");
    assert_eq!(records[0].original_offset, offset);
    // The offset is committed; the poison message never comes back.
    assert!(h.queue.is_empty("commands"));
}

/// A saga whose WAIT_EVENT step is satisfied by an event flowing through a
/// real consumer on the events topic.
#[tokio::test]
async fn saga_completes_through_the_event_pipeline() {
    let h = harness();
    let saga_store = Arc::new(InMemorySagaStore::new());
    let coordinator = Arc::new(SagaCoordinator::new(
        saga_store.clone(),
        h.producer.clone(),
        h.idempotency.clone(),
        SagaConfig {
            poll_interval_ms: 10,
            default_step_timeout_seconds: 2,
        },
        h.topics.clone(),
    ));

    struct CoordinatorHandler(Arc<SagaCoordinator>);

    #[async_trait]
    impl MessageHandler for CoordinatorHandler {
        async fn handle(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
            self.0
                .handle_event(envelope)
                .await
                .map_err(|e| HandlerError::retryable(e.to_string()))
        }
    }

    let events_consumer = Arc::new(consumer_for(
        &h,
        "events",
        Arc::new(CoordinatorHandler(coordinator.clone())),
    ));
    let (shutdown, rx) = watch::channel(false);
    let consumer_task = {
        let events_consumer = events_consumer.clone();
        tokio::spawn(async move { events_consumer.run(rx).await })
    };

    let saga = coordinator
        .create_saga(
            "campaign_rollout",
            "tenant-1",
            vec![
                SagaStep::command("generate", "studio", "campaign.generate", json!({"id": 9}))
                    .with_compensation("campaign.discard"),
                SagaStep::wait_event("generated", "studio", "campaign.generated").with_timeout(2),
            ],
            HashMap::new(),
        )
        .await
        .unwrap();

    let execution = {
        let coordinator = coordinator.clone();
        let saga_id = saga.saga_id;
        tokio::spawn(async move { coordinator.execute_saga(saga_id).await })
    };

    // The downstream service reacts to the command with an event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let event = MessageEnvelope::new("campaign.generated", "tenant-1", json!({"ok": true}))
        .with_correlation_id(saga.correlation_id);
    assert!(h.producer.produce_event(&event).await.unwrap());
    assert_eq!(h.producer.flush(Duration::from_secs(1)).await, 0);

    let state = execution.await.unwrap().unwrap();
    assert_eq!(state, SagaState::Completed);
    assert_eq!(
        saga_store.state_history(saga.saga_id).last(),
        Some(&SagaState::Completed)
    );

    shutdown.send(true).unwrap();
    consumer_task.await.unwrap().unwrap();
    assert!(h.dlq_store.records().is_empty());
}
