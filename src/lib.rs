#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Courier Core
//!
//! Reliable, idempotent asynchronous messaging core for autonomous
//! multi-tenant services, plus a saga coordinator orchestrating multi-step
//! distributed workflows over that substrate.
//!
//! ## Overview
//!
//! The broker is PostgreSQL message queues (pgmq); the durable store
//! (idempotency keys, traceability, dead letters, sagas) lives in the same
//! PostgreSQL instance. Delivery is at-least-once; consumers deduplicate by
//! message id, so the system behaves effectively-once under crashes and
//! redeliveries.
//!
//! ## Module Organization
//!
//! - [`messaging`] - Envelope, producer, broker client, error taxonomy
//! - [`consumer`] - Poll loop, handler seam, idempotency, dead letter queue
//! - [`resilience`] - Circuit breaker and per-tenant rate limiting
//! - [`saga`] - Saga definitions, persistence, and the coordinator
//! - [`config`] - Strongly-typed, validated configuration
//! - [`metrics`] - Counter snapshots for producer and consumer paths
//! - [`memory`] - In-memory backends for tests and local development
//! - [`logging`] - Structured console + JSON file logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier_core::config::CourierConfig;
//! use courier_core::messaging::{MessageEnvelope, PgmqQueueClient, Producer};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> courier_core::Result<()> {
//! let config = CourierConfig::from_env()?;
//! let queue = Arc::new(PgmqQueueClient::new(&config.database_url).await?);
//! let producer = Producer::new(queue, config.topics.clone(), &config.producer, None);
//! producer.ensure_topics().await?;
//!
//! let envelope = MessageEnvelope::new("campaign.generate", "tenant-1", json!({"id": 42}));
//! producer.produce_command(&envelope).await?;
//! producer.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod memory;
pub mod messaging;
pub mod metrics;
pub mod resilience;
pub mod saga;

pub use config::CourierConfig;
pub use error::{CourierError, Result};
pub use messaging::{MessageEnvelope, MessagingError, MessagingResult, Producer};
