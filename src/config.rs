//! # Configuration
//!
//! Strongly-typed, validated configuration for the messaging core. Every
//! recognized option is an explicit field here; nothing is read from an
//! untyped map at runtime. `from_env` applies environment overrides on top
//! of the defaults, and `validate` rejects configurations that would silently
//! weaken the delivery guarantees (non-durable producer settings, auto
//! commit, an empty retry schedule).

use crate::error::{CourierError, Result};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical topic names for the four message classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Imperative instructions to services
    pub commands: String,
    /// Facts about what happened
    pub events: String,
    /// Compliance trail
    pub audit: String,
    /// Failed and poison messages, for tooling and replay
    pub dead_letter: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            commands: "commands".to_string(),
            events: "events".to_string(),
            audit: "audit".to_string(),
            dead_letter: "dead_letter".to_string(),
        }
    }
}

/// Producer durability and batching settings.
///
/// On the pgmq transport a publish is a transactional insert, so the
/// Kafka-style knobs (`acks`, `enable_idempotence`, `compression`,
/// `batch_size`, `linger_ms`) are validated and recorded but advisory; they
/// exist so a partitioned-broker transport can honor them without a
/// configuration schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Acknowledgement level; only "all" is accepted
    pub acks: String,
    /// Bounded broker-side publish retries
    pub retries: u32,
    /// Idempotent per-partition publishing; must stay enabled
    pub enable_idempotence: bool,
    /// Compression codec name
    pub compression: String,
    /// Batch size in bytes
    pub batch_size: u32,
    /// Batching linger
    pub linger_ms: u64,
    /// Capacity of the in-process send queue
    pub send_queue_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: "all".to_string(),
            retries: 5,
            enable_idempotence: true,
            compression: "zstd".to_string(),
            batch_size: 16_384,
            linger_ms: 5,
            send_queue_size: 1024,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.acks != "all" {
            return Err(CourierError::Configuration(format!(
                "producer.acks must be \"all\" for durable publishing, got \"{}\"",
                self.acks
            )));
        }
        if !self.enable_idempotence {
            return Err(CourierError::Configuration(
                "producer.enable_idempotence must remain enabled".to_string(),
            ));
        }
        if self.send_queue_size == 0 {
            return Err(CourierError::Configuration(
                "producer.send_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Consumer poll-loop and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group identity, recorded on every traceability row
    pub group_id: String,
    /// Where a new group starts reading
    pub auto_offset_reset: String,
    /// Offsets are committed manually after the durable outcome record;
    /// auto commit would break the redeliver-then-deduplicate recovery path
    pub manual_commit: bool,
    /// Messages fetched per poll
    pub batch_size: i32,
    /// How long a polled message stays invisible to other group members
    /// before it is redelivered (the session timeout of this transport)
    pub visibility_timeout_seconds: i32,
    /// Idle delay between empty polls
    pub poll_interval_ms: u64,
    /// Heartbeat interval for liveness reporting
    pub heartbeat_interval_seconds: u64,
    /// Upper bound on one poll-process cycle before the member is considered
    /// stuck
    pub max_poll_interval_seconds: u64,
    /// Total handler attempts per message (first try included)
    pub max_retries: u32,
    /// Fixed backoff schedule between attempts; the last interval repeats
    /// when max_retries exceeds its length
    pub retry_intervals_ms: Vec<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "courier-core".to_string(),
            auto_offset_reset: "earliest".to_string(),
            manual_commit: true,
            batch_size: 10,
            visibility_timeout_seconds: 60,
            poll_interval_ms: 250,
            heartbeat_interval_seconds: 10,
            max_poll_interval_seconds: 300,
            max_retries: 3,
            retry_intervals_ms: vec![1_000, 2_000, 5_000],
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.manual_commit {
            return Err(CourierError::Configuration(
                "consumer.manual_commit must remain enabled; offsets are committed only after \
                 the outcome is durably recorded"
                    .to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(CourierError::Configuration(
                "consumer.max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_intervals_ms.is_empty() {
            return Err(CourierError::Configuration(
                "consumer.retry_intervals_ms must not be empty".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(CourierError::Configuration(
                "consumer.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff schedule as durations.
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

/// Circuit breaker thresholds expressed in configuration units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 30,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_seconds),
            half_open_max_calls: self.half_open_max_calls,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(CourierError::Configuration(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls < self.success_threshold {
            return Err(CourierError::Configuration(
                "circuit_breaker.half_open_max_calls must admit at least success_threshold calls"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Saga coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Interval between event-arrival checks during a WAIT_EVENT step
    pub poll_interval_ms: u64,
    /// Step timeout applied when a step does not carry its own
    pub default_step_timeout_seconds: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            default_step_timeout_seconds: 300,
        }
    }
}

/// Transport-security material for the broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_cert_path: String,
    pub client_cert_path: String,
    pub client_key_path: String,
}

/// Root configuration for the messaging core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Broker and durable-store endpoint (PostgreSQL URL)
    pub database_url: String,
    pub topics: TopicConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limit: RateLimitConfig,
    pub saga: SagaConfig,
    pub tls: Option<TlsConfig>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/courier_development".to_string(),
            topics: TopicConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            rate_limit: RateLimitConfig::default(),
            saga: SagaConfig::default(),
            tls: None,
        }
    }
}

impl CourierConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(group_id) = std::env::var("COURIER_CONSUMER_GROUP") {
            config.consumer.group_id = group_id;
        }
        if let Ok(max_retries) = std::env::var("COURIER_MAX_RETRIES") {
            config.consumer.max_retries = max_retries.parse().map_err(|e| {
                CourierError::Configuration(format!("Invalid COURIER_MAX_RETRIES: {e}"))
            })?;
        }
        if let Ok(rate) = std::env::var("COURIER_RATE_LIMIT_PER_SECOND") {
            config.rate_limit.rate_per_second = rate.parse().map_err(|e| {
                CourierError::Configuration(format!("Invalid COURIER_RATE_LIMIT_PER_SECOND: {e}"))
            })?;
        }
        if let Ok(burst) = std::env::var("COURIER_RATE_LIMIT_BURST") {
            config.rate_limit.burst = burst.parse().map_err(|e| {
                CourierError::Configuration(format!("Invalid COURIER_RATE_LIMIT_BURST: {e}"))
            })?;
        }
        if let Ok(enabled) = std::env::var("COURIER_RATE_LIMIT_ENABLED") {
            config.rate_limit.enabled = enabled.parse().map_err(|e| {
                CourierError::Configuration(format!("Invalid COURIER_RATE_LIMIT_ENABLED: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that weaken the delivery guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(CourierError::Configuration(
                "database_url must not be empty".to_string(),
            ));
        }
        self.producer.validate()?;
        self.consumer.validate()?;
        self.circuit_breaker.validate()?;
        if self.rate_limit.enabled
            && (self.rate_limit.rate_per_second <= 0.0 || self.rate_limit.burst < 1.0)
        {
            return Err(CourierError::Configuration(
                "rate_limit requires a positive rate and a burst of at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CourierConfig::default().validate().is_ok());
    }

    #[test]
    fn test_non_durable_acks_rejected() {
        let mut config = CourierConfig::default();
        config.producer.acks = "1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_commit_rejected() {
        let mut config = CourierConfig::default();
        config.consumer.manual_commit = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_retry_schedule_rejected() {
        let mut config = CourierConfig::default();
        config.consumer.retry_intervals_ms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_half_open_cap_below_success_threshold_rejected() {
        let mut config = CourierConfig::default();
        config.circuit_breaker.half_open_max_calls = 1;
        config.circuit_breaker.success_threshold = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_intervals_conversion() {
        let consumer = ConsumerConfig::default();
        assert_eq!(
            consumer.retry_intervals(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5)
            ]
        );
    }
}
