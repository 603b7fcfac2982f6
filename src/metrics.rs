//! # Messaging Metrics
//!
//! Lock-free counters for producer and consumer paths, snapshotted into
//! serializable structs for health endpoints and operator tooling. Failure
//! surfaces (DLQ writes, delivery errors) are partitioned by cause.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for the producer send path.
#[derive(Debug, Default)]
pub struct ProducerMetrics {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    delivery_failed: AtomicU64,
    rate_limited: AtomicU64,
    queue_full: AtomicU64,
}

impl ProducerMetrics {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failed(&self) {
        self.delivery_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProducerMetricsSnapshot {
        ProducerMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProducerMetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub rate_limited: u64,
    pub queue_full: u64,
}

/// Final disposition of one consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeOutcome {
    Success,
    Duplicate,
    Dlq,
    Error,
    PoisonPill,
}

/// Upper bounds of the processing-latency histogram buckets, in
/// milliseconds. Observations above the last bound land in the overflow
/// bucket.
pub const LATENCY_BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Counters and processing-latency histogram for a consumer loop.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    success: AtomicU64,
    duplicate: AtomicU64,
    dlq: AtomicU64,
    error: AtomicU64,
    poison_pill: AtomicU64,
    processing_nanos: AtomicU64,
    processed_count: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len()],
    latency_overflow: AtomicU64,
    dlq_by_exception: Mutex<HashMap<String, u64>>,
}

impl ConsumerMetrics {
    pub fn record_outcome(&self, outcome: ConsumeOutcome) {
        let counter = match outcome {
            ConsumeOutcome::Success => &self.success,
            ConsumeOutcome::Duplicate => &self.duplicate,
            ConsumeOutcome::Dlq => &self.dlq,
            ConsumeOutcome::Error => &self.error,
            ConsumeOutcome::PoisonPill => &self.poison_pill,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        self.processing_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.processed_count.fetch_add(1, Ordering::Relaxed);

        let elapsed_ms = elapsed.as_millis() as u64;
        match LATENCY_BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| elapsed_ms <= *bound)
        {
            Some(index) => self.latency_buckets[index].fetch_add(1, Ordering::Relaxed),
            None => self.latency_overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_dead_letter(&self, exception_class: &str) {
        let mut by_exception = self.dlq_by_exception.lock();
        *by_exception.entry(exception_class.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        let processed = self.processed_count.load(Ordering::Relaxed);
        let total_nanos = self.processing_nanos.load(Ordering::Relaxed);
        ConsumerMetricsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            dlq: self.dlq.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            poison_pill: self.poison_pill.load(Ordering::Relaxed),
            average_processing: if processed > 0 {
                Duration::from_nanos(total_nanos / processed)
            } else {
                Duration::ZERO
            },
            latency_buckets: LATENCY_BUCKET_BOUNDS_MS
                .iter()
                .zip(self.latency_buckets.iter())
                .map(|(bound, count)| LatencyBucket {
                    le_ms: *bound,
                    count: count.load(Ordering::Relaxed),
                })
                .collect(),
            latency_overflow: self.latency_overflow.load(Ordering::Relaxed),
            dlq_by_exception: self.dlq_by_exception.lock().clone(),
        }
    }
}

/// One histogram bucket: observations at or below `le_ms` milliseconds.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LatencyBucket {
    pub le_ms: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerMetricsSnapshot {
    pub success: u64,
    pub duplicate: u64,
    pub dlq: u64,
    pub error: u64,
    pub poison_pill: u64,
    pub average_processing: Duration,
    pub latency_buckets: Vec<LatencyBucket>,
    pub latency_overflow: u64,
    pub dlq_by_exception: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_counters() {
        let metrics = ProducerMetrics::default();
        metrics.record_enqueued();
        metrics.record_enqueued();
        metrics.record_delivered();
        metrics.record_rate_limited();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.queue_full, 0);
    }

    #[test]
    fn test_consumer_outcome_partitioning() {
        let metrics = ConsumerMetrics::default();
        metrics.record_outcome(ConsumeOutcome::Success);
        metrics.record_outcome(ConsumeOutcome::Duplicate);
        metrics.record_outcome(ConsumeOutcome::Dlq);
        metrics.record_dead_letter("HandlerError");
        metrics.record_dead_letter("HandlerError");
        metrics.record_processing_time(Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.duplicate, 1);
        assert_eq!(snapshot.dlq, 1);
        assert_eq!(snapshot.dlq_by_exception["HandlerError"], 2);
        assert!(snapshot.average_processing >= Duration::from_millis(10));
    }

    #[test]
    fn test_latency_histogram_buckets() {
        let metrics = ConsumerMetrics::default();
        metrics.record_processing_time(Duration::from_millis(3));
        metrics.record_processing_time(Duration::from_millis(5));
        metrics.record_processing_time(Duration::from_millis(40));
        metrics.record_processing_time(Duration::from_secs(30));

        let snapshot = metrics.snapshot();
        let count_for = |le_ms: u64| {
            snapshot
                .latency_buckets
                .iter()
                .find(|bucket| bucket.le_ms == le_ms)
                .map(|bucket| bucket.count)
                .unwrap()
        };
        assert_eq!(count_for(5), 2);
        assert_eq!(count_for(50), 1);
        assert_eq!(count_for(100), 0);
        assert_eq!(snapshot.latency_overflow, 1);
    }
}
