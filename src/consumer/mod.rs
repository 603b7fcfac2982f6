//! # Consumer Side
//!
//! Everything between a polled delivery and a committed offset: handler
//! traits, durable idempotency and traceability, the dead letter queue, and
//! the sequential poll-process loop that ties them together.

pub mod dead_letter;
pub mod handler;
pub mod idempotency;
pub mod worker;

pub use dead_letter::{DeadLetterQueue, DeadLetterRecord, DeadLetterStore, PgDeadLetterStore};
pub use handler::{HandlerError, MessageHandler};
pub use idempotency::{
    IdempotencyManager, IdempotencyStore, PgIdempotencyStore, ProcessingStatus, TraceabilityRecord,
};
pub use worker::Consumer;
