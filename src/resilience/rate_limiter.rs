//! # Per-Tenant Rate Limiter
//!
//! Token-bucket admission control keyed by tenant id. The bucket state lives
//! in a shared store so every producer instance draws from the same budget;
//! the refill-and-decrement must be a single atomic operation under
//! concurrent callers. Store failures fail open: availability is preferred
//! over strict rate enforcement, and every such pass is logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, warn};

/// Rate limit settings applied to every tenant bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch; disabled means every admission check passes
    pub enabled: bool,
    /// Sustained refill rate in tokens per second
    pub rate_per_second: f64,
    /// Bucket capacity (maximum burst)
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_second: 50.0,
            burst: 100.0,
        }
    }
}

/// Shared token-bucket store.
///
/// `try_acquire` refills the bucket by elapsed time x rate (capped at burst)
/// and decrements one token if at least one is available, atomically.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn try_acquire(
        &self,
        tenant_id: &str,
        rate_per_second: f64,
        burst: f64,
    ) -> Result<bool, crate::messaging::MessagingError>;
}

/// Token-bucket admission check over a [`RateLimitStore`].
pub struct RateLimiter {
    store: std::sync::Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: std::sync::Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Check admission for one message from `tenant_id`.
    ///
    /// Returns `false` only on a definitive rejection from the store; any
    /// store error fails open.
    pub async fn check_admission(&self, tenant_id: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self
            .store
            .try_acquire(tenant_id, self.config.rate_per_second, self.config.burst)
            .await
        {
            Ok(admitted) => {
                if !admitted {
                    debug!(tenant_id = %tenant_id, "Rate limit exceeded, message rejected");
                }
                admitted
            }
            Err(err) => {
                warn!(
                    tenant_id = %tenant_id,
                    error = %err,
                    "Rate limit store unavailable, failing open"
                );
                true
            }
        }
    }
}

/// PostgreSQL-backed bucket store.
///
/// The refill and decrement run as one UPSERT so concurrent producers cannot
/// double-spend a token. A fresh bucket starts full and pays for the current
/// request; an existing bucket is refilled from `last_update` before the
/// availability check in the update's WHERE clause.
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn try_acquire(
        &self,
        tenant_id: &str,
        rate_per_second: f64,
        burst: f64,
    ) -> Result<bool, crate::messaging::MessagingError> {
        let row: Option<(f64,)> = sqlx::query_as(
            r#"
            INSERT INTO rate_limit_buckets (tenant_id, tokens, last_update)
            VALUES ($1, $2 - 1.0, NOW())
            ON CONFLICT (tenant_id) DO UPDATE
            SET tokens = LEAST(
                    $2,
                    rate_limit_buckets.tokens
                        + EXTRACT(EPOCH FROM (NOW() - rate_limit_buckets.last_update)) * $3
                ) - 1.0,
                last_update = NOW()
            WHERE LEAST(
                    $2,
                    rate_limit_buckets.tokens
                        + EXTRACT(EPOCH FROM (NOW() - rate_limit_buckets.last_update)) * $3
                ) >= 1.0
            RETURNING tokens
            "#,
        )
        .bind(tenant_id)
        .bind(burst)
        .bind(rate_per_second)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

/// In-process bucket store for tests and single-node deployments.
pub struct InMemoryRateLimitStore {
    buckets: parking_lot::Mutex<std::collections::HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_update: std::time::Instant,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            buckets: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn try_acquire(
        &self,
        tenant_id: &str,
        rate_per_second: f64,
        burst: f64,
    ) -> Result<bool, crate::messaging::MessagingError> {
        let now = std::time::Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(tenant_id.to_string()).or_insert(Bucket {
            tokens: burst,
            last_update: now,
        });

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_second).min(burst);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
