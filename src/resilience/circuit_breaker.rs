//! # Circuit Breaker
//!
//! Stateful guard around one downstream dependency call. Three states:
//! Closed (normal operation), Open (failing fast without invoking the wrapped
//! function), and HalfOpen (a bounded number of probe calls test recovery).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Circuit breaker states representing the current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - calls are allowed through
    Closed = 0,
    /// Failure mode - calls are rejected without executing
    Open = 1,
    /// Testing recovery - a capped number of calls allowed through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            // Unknown values resolve to the safest state
            _ => CircuitState::Open,
        }
    }
}

/// Configuration for one circuit breaker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that trip the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen that close the circuit
    pub success_threshold: u32,
    /// Cooldown before an Open circuit admits a probe call
    pub timeout: Duration,
    /// Maximum calls admitted while HalfOpen
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Errors surfaced by a protected call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open or half-open capacity is exhausted; the wrapped
    /// function was not invoked.
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// The wrapped function ran and failed; the original error is preserved.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Rolling counters for one circuit breaker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    /// Consecutive failures observed while Closed
    pub consecutive_failures: u32,
    /// Calls admitted during the current HalfOpen cycle
    pub half_open_calls: u32,
    /// Consecutive successes during the current HalfOpen cycle
    pub half_open_successes: u32,
}

#[derive(Debug)]
struct OpenInfo {
    opened_at: Option<Instant>,
}

/// Circuit breaker with atomic state and mutex-guarded counters.
///
/// State transitions happen on the call path: an Open circuit whose cooldown
/// elapsed moves to HalfOpen when the next call arrives, not on a timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,
    /// Current circuit state, atomic for lock-free reads
    state: AtomicU8,
    config: CircuitBreakerConfig,
    metrics: Arc<Mutex<CircuitBreakerMetrics>>,
    open_info: Arc<Mutex<OpenInfo>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            timeout_seconds = config.timeout.as_secs(),
            half_open_max_calls = config.half_open_max_calls,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            metrics: Arc::new(Mutex::new(CircuitBreakerMetrics::default())),
            open_info: Arc::new(Mutex::new(OpenInfo { opened_at: None })),
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute exactly one invocation of `operation` under circuit protection.
    ///
    /// On rejection the operation is never invoked. On failure the state is
    /// updated first and the original error is re-raised inside
    /// [`CircuitBreakerError::OperationFailed`].
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit_call().await {
            let mut metrics = self.metrics.lock().await;
            metrics.rejected_count += 1;
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether the current state admits a call, transitioning
    /// Open -> HalfOpen when the cooldown has elapsed.
    async fn admit_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let open_info = self.open_info.lock().await;
                match open_info.opened_at {
                    Some(opened_at) if opened_at.elapsed() >= self.config.timeout => {
                        drop(open_info);
                        self.transition_to_half_open().await;
                        self.claim_half_open_slot().await
                    }
                    Some(_) => false,
                    None => {
                        // Open without a timestamp should not happen; admit
                        // rather than wedge the component shut.
                        warn!(component = %self.name, "Circuit open with no opened_at timestamp");
                        true
                    }
                }
            }
            CircuitState::HalfOpen => self.claim_half_open_slot().await,
        }
    }

    async fn claim_half_open_slot(&self) -> bool {
        let mut metrics = self.metrics.lock().await;
        if metrics.half_open_calls < self.config.half_open_max_calls {
            metrics.half_open_calls += 1;
            true
        } else {
            false
        }
    }

    async fn record_success(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.total_calls += 1;
        metrics.success_count += 1;

        match self.state() {
            CircuitState::Closed => {
                metrics.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                metrics.half_open_successes += 1;
                debug!(
                    component = %self.name,
                    half_open_successes = metrics.half_open_successes,
                    "Probe call succeeded"
                );
                if metrics.half_open_successes >= self.config.success_threshold {
                    drop(metrics);
                    self.transition_to_closed().await;
                }
            }
            CircuitState::Open => {
                warn!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    async fn record_failure(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.total_calls += 1;
        metrics.failure_count += 1;

        match self.state() {
            CircuitState::Closed => {
                metrics.consecutive_failures += 1;
                if metrics.consecutive_failures >= self.config.failure_threshold {
                    drop(metrics);
                    self.transition_to_open().await;
                }
            }
            CircuitState::HalfOpen => {
                // Any failure while probing re-opens immediately
                drop(metrics);
                self.transition_to_open().await;
            }
            CircuitState::Open => {}
        }
    }

    async fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);

        let mut metrics = self.metrics.lock().await;
        metrics.consecutive_failures = 0;
        metrics.half_open_calls = 0;
        metrics.half_open_successes = 0;

        let mut open_info = self.open_info.lock().await;
        open_info.opened_at = None;

        info!(component = %self.name, "Circuit breaker closed (recovered)");
    }

    async fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);

        let mut open_info = self.open_info.lock().await;
        open_info.opened_at = Some(Instant::now());

        let mut metrics = self.metrics.lock().await;
        metrics.half_open_calls = 0;
        metrics.half_open_successes = 0;

        warn!(
            component = %self.name,
            consecutive_failures = metrics.consecutive_failures,
            cooldown_seconds = self.config.timeout.as_secs(),
            "Circuit breaker opened (failing fast)"
        );
    }

    async fn transition_to_half_open(&self) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);

        let mut metrics = self.metrics.lock().await;
        metrics.half_open_calls = 0;
        metrics.half_open_successes = 0;

        info!(
            component = %self.name,
            success_threshold = self.config.success_threshold,
            half_open_max_calls = self.config.half_open_max_calls,
            "Circuit breaker half-open (testing recovery)"
        );
    }

    /// Force the circuit open (emergency stop).
    pub async fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        self.transition_to_open().await;
    }

    /// Force the circuit closed (emergency recovery).
    pub async fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        self.transition_to_closed().await;
    }

    /// Snapshot of the rolling counters.
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        self.metrics.lock().await.clone()
    }

    /// Closed with a low observed failure rate.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != CircuitState::Closed {
            return false;
        }
        let metrics = self.metrics.lock().await;
        if metrics.total_calls < 10 {
            return true;
        }
        (metrics.failure_count as f64 / metrics.total_calls as f64) < 0.1
    }
}
