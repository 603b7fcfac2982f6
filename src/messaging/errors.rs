//! # Messaging Error Types
//!
//! Structured error taxonomy for the messaging core. Expected rejection modes
//! (rate limiting, full send queue) are *not* errors; they surface as
//! `Ok(false)` from the producer. Errors here are unexpected faults, with one
//! deliberate exception: a failed dead-letter write is fatal because it means
//! the at-least-once guarantee was lost.

use crate::resilience::CircuitBreakerError;
use thiserror::Error;

/// Errors raised across the messaging core.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    #[error("Queue operation failed: {topic}: {operation}: {message}")]
    QueueOperation {
        topic: String,
        operation: String,
        message: String,
    },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Circuit breaker is open for component: {component}")]
    CircuitBreakerOpen { component: String },

    #[error("Dead letter write failed for {topic}[{partition}]@{offset}: {message}")]
    DeadLetterWrite {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    #[error("Saga error: {saga_id}: {message}")]
    Saga { saga_id: String, message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Timeout: operation {operation} exceeded {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn database_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_operation(
        topic: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            topic: topic.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn dead_letter_write(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        message: impl Into<String>,
    ) -> Self {
        Self::DeadLetterWrite {
            topic: topic.into(),
            partition,
            offset,
            message: message.into(),
        }
    }

    pub fn saga(saga_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Saga {
            saga_id: saga_id.into(),
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MessagingError::database_query("query", "No rows found"),
            sqlx::Error::Database(db_err) => {
                MessagingError::database_query("database", db_err.to_string())
            }
            sqlx::Error::Configuration(config_err) => {
                MessagingError::configuration("database", config_err.to_string())
            }
            other => MessagingError::DatabaseConnection {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            MessagingError::MessageDeserialization {
                message: err.to_string(),
            }
        } else {
            MessagingError::MessageSerialization {
                message: err.to_string(),
            }
        }
    }
}

impl From<pgmq::errors::PgmqError> for MessagingError {
    fn from(err: pgmq::errors::PgmqError) -> Self {
        MessagingError::queue_operation("unknown", "pgmq", err.to_string())
    }
}

impl From<CircuitBreakerError<MessagingError>> for MessagingError {
    fn from(err: CircuitBreakerError<MessagingError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => {
                MessagingError::CircuitBreakerOpen { component }
            }
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

/// Result type alias for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MessagingError::queue_operation("commands", "send", "broken pipe");
        let text = format!("{err}");
        assert!(text.contains("commands"));
        assert!(text.contains("send"));
        assert!(text.contains("broken pipe"));
    }

    #[test]
    fn test_dead_letter_write_carries_coordinates() {
        let err = MessagingError::dead_letter_write("events", 0, 991, "insert failed");
        assert!(format!("{err}").contains("events[0]@991"));
    }

    #[test]
    fn test_sqlx_conversion() {
        let err: MessagingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, MessagingError::DatabaseQuery { .. }));
    }

    #[test]
    fn test_serde_conversion_is_deserialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: MessagingError = json_err.into();
        assert!(matches!(err, MessagingError::MessageDeserialization { .. }));
    }
}
