//! # In-Memory Backends
//!
//! Deterministic implementations of every store and client seam, for tests
//! and broker-less local development. Semantics mirror the PostgreSQL
//! implementations: atomic first-sighting inserts, upsertable traceability,
//! visibility-timeout redelivery on the queue.

use crate::consumer::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::consumer::idempotency::{IdempotencyStore, TraceabilityRecord};
use crate::messaging::{Delivery, MessagingError, MessagingResult, QueueClient};
use crate::saga::definition::SagaDefinition;
use crate::saga::states::SagaState;
use crate::saga::store::SagaStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Instant;
use uuid::Uuid;

struct StoredMessage {
    offset: i64,
    read_ct: i32,
    invisible_until: Option<Instant>,
    value: serde_json::Value,
}

/// In-memory [`QueueClient`] with visibility-timeout redelivery.
///
/// A read message stays in the queue but is invisible until its timeout
/// expires; committing removes it. `len` counts every uncommitted message,
/// visible or not.
pub struct InMemoryQueueClient {
    queues: Mutex<HashMap<String, Vec<StoredMessage>>>,
    next_offset: AtomicI64,
    injected_send_failures: AtomicUsize,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_offset: AtomicI64::new(0),
            injected_send_failures: AtomicUsize::new(0),
        }
    }

    /// Uncommitted messages on `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.queues
            .lock()
            .get(topic)
            .map(Vec::len)
            .unwrap_or_default()
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Make the next `count` sends fail, for delivery-error tests.
    pub fn fail_next_sends(&self, count: usize) {
        self.injected_send_failures.store(count, Ordering::SeqCst);
    }
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        self.queues.lock().entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        _partition_key: &[u8],
        value: &serde_json::Value,
    ) -> MessagingResult<i64> {
        let inject = self
            .injected_send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(MessagingError::queue_operation(
                topic,
                "send",
                "injected failure",
            ));
        }

        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst) + 1;
        self.queues
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(StoredMessage {
                offset,
                read_ct: 0,
                invisible_until: None,
                value: value.clone(),
            });
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        visibility_timeout_seconds: i32,
        max_messages: i32,
    ) -> MessagingResult<Vec<Delivery>> {
        let now = Instant::now();
        let visibility = std::time::Duration::from_secs(visibility_timeout_seconds.max(0) as u64);
        let mut queues = self.queues.lock();
        let Some(messages) = queues.get_mut(topic) else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        for message in messages.iter_mut() {
            if deliveries.len() >= max_messages as usize {
                break;
            }
            if message.invisible_until.is_some_and(|until| until > now) {
                continue;
            }
            message.read_ct += 1;
            message.invisible_until = Some(now + visibility);
            deliveries.push(Delivery {
                topic: topic.to_string(),
                partition: 0,
                offset: message.offset,
                delivery_count: message.read_ct,
                value: message.value.clone(),
            });
        }
        Ok(deliveries)
    }

    async fn commit(&self, topic: &str, offset: i64) -> MessagingResult<()> {
        if let Some(messages) = self.queues.lock().get_mut(topic) {
            messages.retain(|message| message.offset != offset);
        }
        Ok(())
    }
}

#[derive(Default)]
struct IdempotencyInner {
    /// Insertion-ordered, mirrors the created_at ordering of the pg store
    keys: Vec<Uuid>,
    traceability: HashMap<Uuid, TraceabilityRecord>,
}

/// In-memory [`IdempotencyStore`].
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    inner: Mutex<IdempotencyInner>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_insert_key(&self, message_id: Uuid) -> MessagingResult<bool> {
        let mut inner = self.inner.lock();
        if inner.keys.contains(&message_id) {
            return Ok(false);
        }
        inner.keys.push(message_id);
        Ok(true)
    }

    async fn record_traceability(&self, record: &TraceabilityRecord) -> MessagingResult<()> {
        self.inner
            .lock()
            .traceability
            .insert(record.message_id, record.clone());
        Ok(())
    }

    async fn find_processed_event(
        &self,
        saga_correlation_id: Uuid,
        event_type: &str,
    ) -> MessagingResult<Option<TraceabilityRecord>> {
        use crate::consumer::idempotency::ProcessingStatus;

        let inner = self.inner.lock();
        Ok(inner
            .traceability
            .values()
            .filter(|record| {
                record.saga_correlation_id == Some(saga_correlation_id)
                    && record.event_type.as_deref() == Some(event_type)
                    && record.status == ProcessingStatus::Processed
            })
            .min_by_key(|record| record.processed_at)
            .cloned())
    }

    async fn find_unreconciled(&self, limit: i64) -> MessagingResult<Vec<Uuid>> {
        let inner = self.inner.lock();
        Ok(inner
            .keys
            .iter()
            .filter(|key| !inner.traceability.contains_key(key))
            .take(limit.max(0) as usize)
            .copied()
            .collect())
    }
}

/// In-memory [`DeadLetterStore`] that keeps every record for assertion.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, record: &DeadLetterRecord) -> MessagingResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
struct SagaInner {
    sagas: HashMap<Uuid, SagaDefinition>,
    /// Ordered state transitions per saga, for behavior assertions
    history: HashMap<Uuid, Vec<SagaState>>,
    insertion_order: Vec<Uuid>,
}

/// In-memory [`SagaStore`] recording every persisted state transition.
#[derive(Default)]
pub struct InMemorySagaStore {
    inner: Mutex<SagaInner>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state this saga was persisted in, in order.
    pub fn state_history(&self, saga_id: Uuid) -> Vec<SagaState> {
        self.inner
            .lock()
            .history
            .get(&saga_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, saga: &SagaDefinition) -> MessagingResult<()> {
        let mut inner = self.inner.lock();
        if inner.sagas.contains_key(&saga.saga_id) {
            return Err(MessagingError::saga(
                saga.saga_id.to_string(),
                "saga already exists",
            ));
        }
        inner.insertion_order.push(saga.saga_id);
        inner
            .history
            .entry(saga.saga_id)
            .or_default()
            .push(saga.state);
        inner.sagas.insert(saga.saga_id, saga.clone());
        Ok(())
    }

    async fn update(&self, saga: &SagaDefinition) -> MessagingResult<()> {
        let mut inner = self.inner.lock();
        if !inner.sagas.contains_key(&saga.saga_id) {
            return Err(MessagingError::saga(
                saga.saga_id.to_string(),
                "saga row missing on update",
            ));
        }
        inner
            .history
            .entry(saga.saga_id)
            .or_default()
            .push(saga.state);
        inner.sagas.insert(saga.saga_id, saga.clone());
        Ok(())
    }

    async fn load(&self, saga_id: Uuid) -> MessagingResult<Option<SagaDefinition>> {
        Ok(self.inner.lock().sagas.get(&saga_id).cloned())
    }

    async fn load_active(&self) -> MessagingResult<Vec<SagaDefinition>> {
        let inner = self.inner.lock();
        Ok(inner
            .insertion_order
            .iter()
            .filter_map(|saga_id| inner.sagas.get(saga_id))
            .filter(|saga| !saga.is_terminal())
            .cloned()
            .collect())
    }
}
