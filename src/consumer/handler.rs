//! # Handler Seam
//!
//! The business handler consumed by this core. Handlers classify their own
//! failures: retryable errors re-enter the backoff schedule, fatal errors go
//! straight to the dead letter queue. Poison pills (undeserializable
//! payloads) are detected before the handler and never reach it.

use crate::messaging::MessageEnvelope;
use async_trait::async_trait;
use thiserror::Error;

/// Failure classification returned by a handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure; the dispatcher retries with backoff, then dead
    /// letters.
    #[error("Retryable handler error: {0}")]
    Retryable(String),

    /// Permanent failure; retrying cannot help, dead letter immediately.
    #[error("Fatal handler error: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Exception class name recorded on dead letter rows and metrics.
    pub fn exception_class(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "RetryableHandlerError",
            Self::Fatal(_) => "FatalHandlerError",
        }
    }
}

/// Business message handler supplied by the caller.
///
/// The dispatcher invokes `handle` through the circuit breaker, at most once
/// per attempt. Handlers must be idempotent-friendly: a crash between the
/// handler and the offset commit means one more invocation after redelivery
/// is impossible only because the dedup check runs first.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError>;
}
