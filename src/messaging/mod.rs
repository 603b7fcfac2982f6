//! # Messaging Module
//!
//! The messaging substrate: immutable envelopes, the broker transport seam,
//! and the producer publishing path with per-tenant admission control.

pub mod envelope;
pub mod errors;
pub mod pgmq_client;
pub mod producer;

pub use envelope::{derived_message_id, headers, MessageEnvelope};
pub use errors::{MessagingError, MessagingResult};
pub use pgmq_client::{Delivery, PgmqQueueClient, QueueClient};
pub use producer::Producer;
