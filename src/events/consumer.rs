//! Kafka consumer for audit log ingestion.
//!
//! Reads audit change events from the source topic, indexes them with a
//! bounded retry policy, routes terminal failures to the DLQ, and commits
//! offsets in batches so a restart resumes from the last committed position.

use crate::config::{Config, DEFAULT_BATCH_SIZE, DEFAULT_STATS_INTERVAL};
use crate::error::{BrokerError, ErrorCategory};
use crate::events::admin;
use crate::events::dlq::DeadLetterSink;
use crate::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::models::{AuditLogMessage, DlqEnvelope};
use crate::services::AuditLogIndex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Total index write attempts per message, first try included.
const MAX_INDEX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Consumer runtime settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub topic: String,
    /// Kafka consumer group id; the broker tracks committed offsets per
    /// group, so distinct names progress independently.
    pub consumer_name: String,
    pub batch_size: u64,
    pub stats_interval: u64,
    /// First retry backoff; doubles on every subsequent attempt.
    pub retry_base_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "audit_logs".to_string(),
            consumer_name: "audit-log-indexer".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            stats_interval: DEFAULT_STATS_INTERVAL,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            brokers: config.kafka_brokers.clone(),
            topic: config.source_topic.clone(),
            consumer_name: config.consumer_group.clone(),
            batch_size: config.batch_size,
            stats_interval: config.stats_interval,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Broker positions for one consumer instance.
///
/// `current` is the highest offset seen (recorded before parsing, so a crash
/// mid-message still reflects the furthest position), `last_committed` the
/// highest offset durably acknowledged to the broker. Commits are monotonic:
/// `last_committed` never moves backwards and never exceeds `current`.
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    current: Option<i64>,
    partition: Option<i32>,
    last_committed: Option<i64>,
}

impl OffsetTracker {
    pub fn observe(&mut self, partition: i32, offset: i64) {
        self.partition = Some(partition);
        self.current = Some(self.current.map_or(offset, |c| c.max(offset)));
    }

    pub fn current(&self) -> Option<i64> {
        self.current
    }

    pub fn last_committed(&self) -> Option<i64> {
        self.last_committed
    }

    /// Position to commit, or `None` when there is no progress beyond the
    /// last committed offset.
    pub fn pending_commit(&self) -> Option<(i32, i64)> {
        let (partition, current) = match (self.partition, self.current) {
            (Some(partition), Some(current)) => (partition, current),
            _ => return None,
        };
        match self.last_committed {
            Some(committed) if current <= committed => None,
            _ => Some((partition, current)),
        }
    }

    pub fn mark_committed(&mut self, offset: i64) {
        if self.last_committed.map_or(true, |committed| offset > committed) {
            self.last_committed = Some(offset);
        }
    }
}

/// Offset commit seam over the broker handle. `StreamConsumer` is the
/// production implementation; tests substitute a recording fake so the
/// batch-boundary and shutdown commit paths can be exercised without a
/// live broker.
trait OffsetCommitter {
    fn commit_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), rdkafka::error::KafkaError>;
}

impl OffsetCommitter for StreamConsumer {
    fn commit_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), rdkafka::error::KafkaError> {
        let mut tpl = TopicPartitionList::new();
        // Kafka group commits store the next offset to read, hence +1.
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        self.commit(&tpl, mode)
    }
}

/// Read-only view of consumer health, safe to query while the consumer runs.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub is_running: bool,
    pub consumer_name: String,
    pub current_offset: Option<i64>,
    pub last_committed_offset: Option<i64>,
    pub metrics: MetricsSnapshot,
}

/// Audit log stream consumer.
///
/// The index client and the DLQ sink are injected so the processing logic
/// can be exercised against fakes. One instance owns its broker handles and
/// metrics; multiple instances with distinct consumer names are independent
/// subscribers.
pub struct AuditLogConsumer {
    config: ConsumerConfig,
    index: Arc<dyn AuditLogIndex>,
    dlq: Arc<dyn DeadLetterSink>,
    metrics: Arc<ConsumerMetrics>,
    state: Mutex<ConsumerState>,
    offsets: Mutex<OffsetTracker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AuditLogConsumer {
    pub fn new(
        config: ConsumerConfig,
        index: Arc<dyn AuditLogIndex>,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            index,
            dlq,
            metrics: Arc::new(ConsumerMetrics::new()),
            state: Mutex::new(ConsumerState::Stopped),
            offsets: Mutex::new(OffsetTracker::default()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Request a graceful stop. The main loop observes the flag at its next
    /// iteration; an in-flight retry cycle finishes first.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown handle for signal wiring; sending `true` stops the consumer.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn health_status(&self) -> HealthStatus {
        let tracker = self.tracker().clone();
        HealthStatus {
            is_running: self.state() == ConsumerState::Running,
            consumer_name: self.config.consumer_name.clone(),
            current_offset: tracker.current(),
            last_committed_offset: tracker.last_committed(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Run until stopped. Broker connect/subscribe failures are fatal and
    /// propagate; per-message failures never do.
    pub async fn run(&self) -> Result<(), BrokerError> {
        self.set_state(ConsumerState::Starting);

        let consumer = match self.subscribe().await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "Audit log consumer failed to start");
                self.set_state(ConsumerState::Stopped);
                return Err(e);
            }
        };

        self.set_state(ConsumerState::Running);
        self.consume_loop(&consumer).await;
        self.shutdown(&consumer);
        Ok(())
    }

    async fn subscribe(&self) -> Result<StreamConsumer, BrokerError> {
        admin::create_topic_if_not_exists(&self.config.brokers, &self.config.topic).await?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.consumer_name)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create()?;

        consumer.subscribe(&[&self.config.topic])?;

        info!(
            brokers = %self.config.brokers,
            topic = %self.config.topic,
            consumer = %self.config.consumer_name,
            "Audit log consumer subscribed"
        );
        Ok(consumer)
    }

    async fn consume_loop(&self, consumer: &StreamConsumer) {
        use futures::StreamExt;

        let mut shutdown_rx = self.shutdown_rx.clone();
        // A stop requested before the loop starts is already marked as seen
        // by the cloned receiver, so changed() alone would miss it.
        if *shutdown_rx.borrow() {
            info!("Shutdown requested before the stream started");
            return;
        }
        let mut message_stream = consumer.stream();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                }

                message = message_stream.next() => {
                    match message {
                        Some(Ok(msg)) => {
                            let payload = msg.payload().unwrap_or_default();
                            self.handle_payload(msg.partition(), msg.offset(), payload).await;
                            self.checkpoint(consumer);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka consumer error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => {
                            warn!("Message stream ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Process one delivered message to a terminal outcome: indexed, or
    /// routed to the DLQ. Never returns an error; a single bad message must
    /// not stall the stream.
    pub async fn handle_payload(&self, partition: i32, offset: i64, payload: &[u8]) {
        self.tracker().observe(partition, offset);
        let started = Instant::now();

        match serde_json::from_slice::<AuditLogMessage>(payload) {
            Ok(log) => self.index_with_retry(&log, payload, offset, started).await,
            Err(e) => {
                // Malformed payloads will not become well-formed on retry.
                warn!(offset, error = %e, "Failed to parse audit log payload, routing to DLQ");
                self.fail_to_dlq(payload, e.to_string(), ErrorCategory::Serialization, offset)
                    .await;
            }
        }
    }

    async fn index_with_retry(
        &self,
        log: &AuditLogMessage,
        payload: &[u8],
        offset: i64,
        started: Instant,
    ) {
        let mut attempt = 1u32;
        let mut backoff = self.config.retry_base_delay;

        loop {
            match self.index.index_log(log).await {
                Ok(()) => {
                    self.metrics.record_success(started.elapsed());
                    debug!(log_id = %log.log_id, offset, "Indexed audit log");
                    return;
                }
                Err(e) => {
                    let category = ErrorCategory::from_index_error(&e);

                    if !category.is_retryable() {
                        warn!(
                            log_id = %log.log_id,
                            offset,
                            category = %category,
                            error = %e,
                            "Audit log rejected by index, routing to DLQ"
                        );
                        self.fail_to_dlq(payload, e.to_string(), category, offset).await;
                        return;
                    }

                    if attempt >= MAX_INDEX_ATTEMPTS {
                        error!(
                            log_id = %log.log_id,
                            offset,
                            attempts = attempt,
                            category = %category,
                            error = %e,
                            "Index write failed after retries, routing to DLQ"
                        );
                        self.fail_to_dlq(payload, e.to_string(), category, offset).await;
                        return;
                    }

                    self.metrics.record_transient_error(category);
                    warn!(
                        log_id = %log.log_id,
                        offset,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Index write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    async fn fail_to_dlq(
        &self,
        payload: &[u8],
        error: String,
        category: ErrorCategory,
        offset: i64,
    ) {
        self.metrics.record_failure(category);
        self.metrics.record_dlq();
        let envelope = DlqEnvelope::from_failure(
            payload,
            error,
            category,
            offset,
            &self.config.consumer_name,
        );
        self.dlq.send(envelope).await;
    }

    /// Commit and stats boundaries, checked after every terminal outcome.
    fn checkpoint(&self, committer: &dyn OffsetCommitter) {
        let processed = self.metrics.processed();
        if processed == 0 {
            return;
        }
        if self.config.batch_size > 0 && processed % self.config.batch_size == 0 {
            self.commit_progress(committer, CommitMode::Async);
        }
        if self.config.stats_interval > 0 && processed % self.config.stats_interval == 0 {
            self.log_stats();
        }
    }

    fn commit_progress(&self, committer: &dyn OffsetCommitter, mode: CommitMode) {
        let Some((partition, offset)) = self.tracker().pending_commit() else {
            return;
        };

        match committer.commit_offset(&self.config.topic, partition, offset, mode) {
            Ok(()) => {
                self.tracker().mark_committed(offset);
                self.metrics.record_commit();
                debug!(offset, "Committed consumer offset");
            }
            Err(e) => {
                // Safe to continue: a missed commit only means re-processing
                // already-indexed messages after a restart, and index writes
                // are idempotent by log_id.
                warn!(offset, error = %e, "Failed to commit offset, will retry at next boundary");
            }
        }
    }

    fn shutdown(&self, committer: &dyn OffsetCommitter) {
        self.set_state(ConsumerState::Stopping);
        self.commit_progress(committer, CommitMode::Sync);
        self.log_stats();
        self.set_state(ConsumerState::Stopped);
        info!(consumer = %self.config.consumer_name, "Audit log consumer stopped");
    }

    fn log_stats(&self) {
        let stats = self.metrics.snapshot();
        info!(
            consumer = %self.config.consumer_name,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            sent_to_dlq = stats.sent_to_dlq,
            offset_commits = stats.offset_commits,
            avg_latency_ms = stats.avg_latency_ms,
            throughput_per_sec = stats.throughput_per_sec,
            "Consumer metrics"
        );
    }

    fn tracker(&self) -> MutexGuard<'_, OffsetTracker> {
        self.offsets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use crate::services::{LogSearchQuery, LogSearchResults};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum FailureMode {
        Succeed,
        Network,
        Validation,
        Internal,
    }

    struct FakeIndex {
        mode: FailureMode,
        attempts: AtomicU32,
    }

    impl FakeIndex {
        fn new(mode: FailureMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuditLogIndex for FakeIndex {
        async fn index_log(&self, _log: &AuditLogMessage) -> Result<(), IndexError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                FailureMode::Succeed => Ok(()),
                FailureMode::Network => Err(IndexError::Transport(elasticsearch::Error::from(
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                ))),
                FailureMode::Validation => Err(IndexError::Request {
                    status: 400,
                    reason: "mapper_parsing_exception: failed to parse".to_string(),
                }),
                FailureMode::Internal => {
                    Err(IndexError::Internal("status 503: unavailable".to_string()))
                }
            }
        }

        async fn bulk_index_logs(&self, logs: &[AuditLogMessage]) -> Result<usize, IndexError> {
            Ok(logs.len())
        }

        async fn search_logs(
            &self,
            _query: &LogSearchQuery,
        ) -> Result<LogSearchResults, IndexError> {
            Ok(LogSearchResults {
                items: vec![],
                total: 0,
                next_offset: 0,
                has_next: false,
            })
        }

        async fn get_log_by_id(&self, log_id: &str) -> Result<AuditLogMessage, IndexError> {
            Err(IndexError::NotFound(log_id.to_string()))
        }

        async fn ping(&self) -> Result<(), IndexError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDlq {
        sent: Mutex<Vec<DlqEnvelope>>,
    }

    impl RecordingDlq {
        fn envelopes(&self) -> Vec<DlqEnvelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingDlq {
        async fn send(&self, envelope: DlqEnvelope) {
            self.sent.lock().unwrap().push(envelope);
        }
    }

    #[derive(Default)]
    struct FakeCommitter {
        commits: Mutex<Vec<(i32, i64)>>,
        fail: bool,
    }

    impl FakeCommitter {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn commits(&self) -> Vec<(i32, i64)> {
            self.commits.lock().unwrap().clone()
        }
    }

    impl OffsetCommitter for FakeCommitter {
        fn commit_offset(
            &self,
            _topic: &str,
            partition: i32,
            offset: i64,
            _mode: CommitMode,
        ) -> Result<(), rdkafka::error::KafkaError> {
            if self.fail {
                return Err(rdkafka::error::KafkaError::ConsumerCommit(
                    rdkafka::types::RDKafkaErrorCode::OperationTimedOut,
                ));
            }
            self.commits.lock().unwrap().push((partition, offset));
            Ok(())
        }
    }

    fn test_consumer(index: Arc<FakeIndex>, dlq: Arc<RecordingDlq>) -> AuditLogConsumer {
        let config = ConsumerConfig {
            consumer_name: "test-consumer".to_string(),
            retry_base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        AuditLogConsumer::new(config, index, dlq)
    }

    fn payload(log_id: &str) -> Vec<u8> {
        json!({
            "log_id": log_id,
            "timestamp": "2025-10-13T14:30:00Z",
            "action": "CREATE"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_offset_tracker_monotonicity() {
        let mut tracker = OffsetTracker::default();
        assert_eq!(tracker.pending_commit(), None);

        tracker.observe(0, 5);
        assert_eq!(tracker.current(), Some(5));
        assert_eq!(tracker.pending_commit(), Some((0, 5)));

        tracker.mark_committed(5);
        assert_eq!(tracker.last_committed(), Some(5));
        assert_eq!(tracker.pending_commit(), None);

        // Stale marks never move the committed position backwards.
        tracker.mark_committed(3);
        assert_eq!(tracker.last_committed(), Some(5));

        tracker.observe(0, 9);
        assert_eq!(tracker.pending_commit(), Some((0, 9)));
    }

    #[test]
    fn test_final_commit_decision() {
        let mut tracker = OffsetTracker::default();
        tracker.observe(0, 123);
        tracker.mark_committed(100);
        assert_eq!(tracker.pending_commit(), Some((0, 123)));

        tracker.mark_committed(123);
        assert_eq!(tracker.pending_commit(), None);
    }

    #[tokio::test]
    async fn test_commit_issued_at_batch_boundary() {
        let index = FakeIndex::new(FailureMode::Succeed);
        let dlq = Arc::new(RecordingDlq::default());
        let config = ConsumerConfig {
            consumer_name: "test-consumer".to_string(),
            batch_size: 3,
            retry_base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let consumer = AuditLogConsumer::new(config, index, dlq);
        let committer = FakeCommitter::default();

        for offset in 1..=5i64 {
            consumer
                .handle_payload(0, offset, &payload(&format!("log-{offset}")))
                .await;
            consumer.checkpoint(&committer);
        }

        // One commit at the third message, nothing since.
        assert_eq!(committer.commits(), vec![(0, 3)]);

        let health = consumer.health_status();
        assert_eq!(health.current_offset, Some(5));
        assert_eq!(health.last_committed_offset, Some(3));
        assert_eq!(health.metrics.offset_commits, 1);
    }

    #[tokio::test]
    async fn test_shutdown_commits_pending_progress_once() {
        let index = FakeIndex::new(FailureMode::Succeed);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index, dlq);
        let committer = FakeCommitter::default();

        consumer.handle_payload(0, 100, &payload("log-a")).await;
        consumer.commit_progress(&committer, CommitMode::Sync);
        assert_eq!(committer.commits(), vec![(0, 100)]);

        consumer.handle_payload(0, 123, &payload("log-b")).await;
        consumer.shutdown(&committer);

        assert_eq!(committer.commits(), vec![(0, 100), (0, 123)]);
        assert_eq!(consumer.health_status().last_committed_offset, Some(123));

        // Already caught up: stopping again issues no further commit.
        consumer.shutdown(&committer);
        assert_eq!(committer.commits().len(), 2);
        assert_eq!(consumer.health_status().metrics.offset_commits, 2);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_position_uncommitted() {
        let index = FakeIndex::new(FailureMode::Succeed);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index, dlq);

        consumer.handle_payload(0, 7, &payload("log-a")).await;
        consumer.commit_progress(&FakeCommitter::failing(), CommitMode::Async);

        let health = consumer.health_status();
        assert_eq!(health.last_committed_offset, None);
        assert_eq!(health.metrics.offset_commits, 0);

        // The same position is retried at the next boundary.
        let retry = FakeCommitter::default();
        consumer.commit_progress(&retry, CommitMode::Async);
        assert_eq!(retry.commits(), vec![(0, 7)]);
    }

    #[tokio::test]
    async fn test_successful_message_is_indexed_once() {
        let index = FakeIndex::new(FailureMode::Succeed);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index.clone(), dlq.clone());

        consumer.handle_payload(0, 42, &payload("abc-1")).await;

        assert_eq!(index.attempts(), 1);
        assert!(dlq.envelopes().is_empty());

        let health = consumer.health_status();
        assert_eq!(health.current_offset, Some(42));
        assert_eq!(health.last_committed_offset, None);
        assert_eq!(health.metrics.succeeded, 1);
        assert_eq!(health.metrics.processed, 1);
        assert!(!health.is_running);
    }

    #[tokio::test]
    async fn test_network_failure_retries_then_goes_to_dlq() {
        let index = FakeIndex::new(FailureMode::Network);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index.clone(), dlq.clone());

        let started = Instant::now();
        consumer.handle_payload(0, 42, &payload("abc-1")).await;

        assert_eq!(index.attempts(), MAX_INDEX_ATTEMPTS);
        // Two backoff sleeps: 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));

        let envelopes = dlq.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].offset, 42);
        assert_eq!(envelopes[0].error_type, ErrorCategory::Network);
        assert_eq!(envelopes[0].consumer_name, "test-consumer");

        let stats = consumer.health_status().metrics;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sent_to_dlq, 1);
        assert_eq!(stats.transient_errors, 2);
        assert_eq!(stats.error_types.get(&ErrorCategory::Network), Some(&3));
    }

    #[tokio::test]
    async fn test_validation_failure_does_not_retry() {
        let index = FakeIndex::new(FailureMode::Validation);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index.clone(), dlq.clone());

        consumer.handle_payload(0, 7, &payload("abc-1")).await;

        assert_eq!(index.attempts(), 1);
        let envelopes = dlq.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].error_type, ErrorCategory::Validation);
        assert_eq!(consumer.health_status().metrics.transient_errors, 0);
    }

    #[tokio::test]
    async fn test_internal_failure_retries_like_network() {
        let index = FakeIndex::new(FailureMode::Internal);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index.clone(), dlq.clone());

        consumer.handle_payload(0, 8, &payload("abc-1")).await;

        assert_eq!(index.attempts(), MAX_INDEX_ATTEMPTS);
        assert_eq!(dlq.envelopes()[0].error_type, ErrorCategory::Internal);
    }

    #[tokio::test]
    async fn test_malformed_payload_bypasses_index() {
        let index = FakeIndex::new(FailureMode::Succeed);
        let dlq = Arc::new(RecordingDlq::default());
        let consumer = test_consumer(index.clone(), dlq.clone());

        consumer.handle_payload(0, 9, b"{not valid json").await;

        assert_eq!(index.attempts(), 0);
        let envelopes = dlq.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].error_type, ErrorCategory::Serialization);
        assert_eq!(
            envelopes[0].original_message,
            Value::String("{not valid json".to_string())
        );

        // The offset is still recorded even though parsing failed.
        assert_eq!(consumer.health_status().current_offset, Some(9));
    }
}
