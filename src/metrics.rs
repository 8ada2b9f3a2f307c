use crate::error::ErrorCategory;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Number of recent per-message latencies retained for the rolling average.
pub const LATENCY_WINDOW: usize = 1000;

/// Point-in-time view of the consumer's counters, plus derived rates.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub sent_to_dlq: u64,
    pub offset_commits: u64,
    pub transient_errors: u64,
    pub error_types: HashMap<ErrorCategory, u64>,
    pub uptime_seconds: f64,
    pub avg_latency_ms: f64,
    pub throughput_per_sec: f64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    processed: u64,
    succeeded: u64,
    failed: u64,
    sent_to_dlq: u64,
    offset_commits: u64,
    transient_errors: u64,
    error_types: HashMap<ErrorCategory, u64>,
    latencies_ms: VecDeque<f64>,
}

/// In-memory metrics for one consumer instance.
///
/// Counters live for the lifetime of the process and are never persisted.
/// Mutations are mutex-guarded so the recorder can be shared between the
/// processing loop and health queries.
#[derive(Debug)]
pub struct ConsumerMetrics {
    started_at: Instant,
    inner: Mutex<MetricsInner>,
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a successfully indexed message and its processing latency.
    /// The latency window is bounded; the oldest sample is evicted first.
    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner();
        inner.processed += 1;
        inner.succeeded += 1;
        if inner.latencies_ms.len() == LATENCY_WINDOW {
            inner.latencies_ms.pop_front();
        }
        inner.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Record a terminally failed message in the given category.
    pub fn record_failure(&self, category: ErrorCategory) {
        let mut inner = self.inner();
        inner.processed += 1;
        inner.failed += 1;
        *inner.error_types.entry(category).or_insert(0) += 1;
    }

    /// Record a retryable failure that is not terminal yet. The message is
    /// still in flight, so `processed` is left untouched.
    pub fn record_transient_error(&self, category: ErrorCategory) {
        let mut inner = self.inner();
        inner.transient_errors += 1;
        *inner.error_types.entry(category).or_insert(0) += 1;
    }

    pub fn record_dlq(&self) {
        self.inner().sent_to_dlq += 1;
    }

    pub fn record_commit(&self) {
        self.inner().offset_commits += 1;
    }

    pub fn processed(&self) -> u64 {
        self.inner().processed
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner();
        let uptime_seconds = self.started_at.elapsed().as_secs_f64();

        let avg_latency_ms = if inner.latencies_ms.is_empty() {
            0.0
        } else {
            inner.latencies_ms.iter().sum::<f64>() / inner.latencies_ms.len() as f64
        };

        let throughput_per_sec = if uptime_seconds > 0.0 {
            inner.processed as f64 / uptime_seconds
        } else {
            0.0
        };

        MetricsSnapshot {
            processed: inner.processed,
            succeeded: inner.succeeded,
            failed: inner.failed,
            sent_to_dlq: inner.sent_to_dlq,
            offset_commits: inner.offset_commits,
            transient_errors: inner.transient_errors,
            error_types: inner.error_types.clone(),
            uptime_seconds,
            avg_latency_ms,
            throughput_per_sec,
        }
    }
}
