//! # Crate-Level Errors
//!
//! Top-level error type for configuration and bootstrap paths. Subsystems
//! carry their own structured errors ([`crate::messaging::MessagingError`],
//! [`crate::consumer::HandlerError`]); this enum is the umbrella they roll up
//! into at the crate boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] crate::messaging::MessagingError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CourierError>;
