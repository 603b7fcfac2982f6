//! # Resilience Module
//!
//! Fault isolation and admission control: the circuit breaker guarding
//! downstream handler calls, and the per-tenant token-bucket rate limiter
//! guarding the producer path.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics, CircuitState,
};
pub use rate_limiter::{
    InMemoryRateLimitStore, PgRateLimitStore, RateLimitConfig, RateLimitStore, RateLimiter,
};
