//! PostgreSQL-backed store tests.
//!
//! These exercise the real stores against a live database and skip cleanly
//! when `DATABASE_URL` is not set, so the default `cargo test` run stays
//! self-contained on the in-memory backends.

use chrono::Utc;
use courier_core::consumer::{
    DeadLetterRecord, DeadLetterStore, IdempotencyStore, PgDeadLetterStore, PgIdempotencyStore,
    ProcessingStatus, TraceabilityRecord,
};
use courier_core::resilience::{PgRateLimitStore, RateLimitStore};
use courier_core::saga::{PgSagaStore, SagaDefinition, SagaState, SagaStep, SagaStore};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL store test");
        return None;
    };
    let pool = PgPool::connect(&url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    Some(pool)
}

#[tokio::test]
async fn test_idempotency_key_admits_exactly_one_insert() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgIdempotencyStore::new(pool);

    let message_id = Uuid::new_v4();
    assert!(store.try_insert_key(message_id).await.unwrap());
    assert!(!store.try_insert_key(message_id).await.unwrap());
}

#[tokio::test]
async fn test_traceability_round_trip_and_event_lookup() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgIdempotencyStore::new(pool);

    let message_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4();
    store.try_insert_key(message_id).await.unwrap();
    store
        .record_traceability(&TraceabilityRecord {
            message_id,
            topic: "events".to_string(),
            partition: 0,
            offset: 42,
            consumer_group: "orders".to_string(),
            status: ProcessingStatus::Processed,
            saga_correlation_id: Some(correlation_id),
            event_type: Some("payment.captured".to_string()),
            processed_at: Utc::now(),
        })
        .await
        .unwrap();

    let found = store
        .find_processed_event(correlation_id, "payment.captured")
        .await
        .unwrap()
        .expect("processed event row should be visible");
    assert_eq!(found.message_id, message_id);
    assert_eq!(found.offset, 42);

    assert!(store
        .find_processed_event(correlation_id, "payment.refunded")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unreconciled_keys_include_unrecorded_message() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgIdempotencyStore::new(pool);

    let orphan = Uuid::new_v4();
    store.try_insert_key(orphan).await.unwrap();

    let unreconciled = store.find_unreconciled(10_000).await.unwrap();
    assert!(unreconciled.contains(&orphan));
}

#[tokio::test]
async fn test_dead_letter_insert_and_read_back() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgDeadLetterStore::new(pool);

    let marker = Uuid::new_v4().to_string();
    let mut headers = HashMap::new();
    headers.insert("dlq.original_topic".to_string(), "commands".to_string());
    // The table assigns its own serial id; repeated inserts must all land.
    for offset in [7, 8] {
        store
            .insert(&DeadLetterRecord {
                original_topic: "commands".to_string(),
                original_partition: 0,
                original_offset: offset,
                consumer_group: "billing".to_string(),
                exception_class: "RetryableHandlerError".to_string(),
                exception_message: marker.clone(),
                payload: json!({"order_id": "o-1"}),
                headers: headers.clone(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let recent = store.recent(100).await.unwrap();
    let matching: Vec<_> = recent
        .iter()
        .filter(|r| r.exception_message == marker)
        .collect();
    assert_eq!(matching.len(), 2);
    assert_eq!(matching[0].headers["dlq.original_topic"], "commands");
}

#[tokio::test]
async fn test_saga_store_persists_transitions() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgSagaStore::new(pool);

    let mut saga = SagaDefinition::new(
        "order_fulfillment",
        "tenant-pg",
        vec![SagaStep::command(
            "charge",
            "billing",
            "billing.charge",
            json!({"amount": 100}),
        )],
        HashMap::new(),
    );
    store.insert(&saga).await.unwrap();

    let active = store.load_active().await.unwrap();
    assert!(active.iter().any(|s| s.saga_id == saga.saga_id));

    saga.state = SagaState::Completed;
    saga.current_step_index = 1;
    store.update(&saga).await.unwrap();

    let loaded = store
        .load(saga.saga_id)
        .await
        .unwrap()
        .expect("saga row should load");
    assert_eq!(loaded.state, SagaState::Completed);
    assert_eq!(loaded.current_step_index, 1);

    let active = store.load_active().await.unwrap();
    assert!(!active.iter().any(|s| s.saga_id == saga.saga_id));
}

#[tokio::test]
async fn test_rate_limit_bucket_spends_and_refuses() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRateLimitStore::new(pool);

    let tenant = format!("tenant-{}", Uuid::new_v4());
    assert!(store.try_acquire(&tenant, 0.0, 1.0).await.unwrap());
    assert!(!store.try_acquire(&tenant, 0.0, 1.0).await.unwrap());
}
