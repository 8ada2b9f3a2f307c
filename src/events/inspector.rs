//! DLQ inspection and replay.
//!
//! Operator-facing tooling over the dead-letter topic: peek at entries
//! without consuming them, replay entries into the index after the
//! underlying fault is fixed, and purge the topic outright.

use crate::events::admin;
use crate::models::DlqEnvelope;
use crate::services::AuditLogIndex;
use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on time spent draining the DLQ during a peek.
const PEEK_BUDGET: Duration = Duration::from_secs(5);

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DlqInspector {
    brokers: String,
    dlq_topic: String,
    index: Arc<dyn AuditLogIndex>,
}

impl DlqInspector {
    pub fn new(
        brokers: impl Into<String>,
        dlq_topic: impl Into<String>,
        index: Arc<dyn AuditLogIndex>,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            dlq_topic: dlq_topic.into(),
            index,
        }
    }

    /// Read up to `count` envelopes from the start of the DLQ.
    ///
    /// Uses a throwaway consumer group and never commits, so repeated
    /// inspections always see the same entries. Returns whatever arrived
    /// within the peek budget; fewer than `count` does not mean the topic
    /// holds fewer entries.
    pub async fn list_messages(&self, count: usize) -> Result<Vec<DlqEnvelope>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let consumer = self.peek_consumer()?;
        let deadline = tokio::time::Instant::now() + PEEK_BUDGET;
        let mut envelopes = Vec::with_capacity(count);

        while envelopes.len() < count {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "DLQ read error during inspection");
                    break;
                }
                Ok(Ok(msg)) => {
                    let payload = msg.payload().unwrap_or_default();
                    match serde_json::from_slice::<DlqEnvelope>(payload) {
                        Ok(envelope) => envelopes.push(envelope),
                        Err(e) => {
                            warn!(offset = msg.offset(), error = %e, "Skipping malformed DLQ entry")
                        }
                    }
                }
            }
        }

        info!(count = envelopes.len(), topic = %self.dlq_topic, "Peeked DLQ");
        Ok(envelopes)
    }

    /// Replay one envelope into the index. The DLQ entry itself is retained;
    /// replays stay idempotent because documents are keyed by log id.
    pub async fn reprocess_message(&self, envelope: &DlqEnvelope) -> Result<()> {
        let log = envelope
            .original_log()
            .context("DLQ entry does not contain a replayable audit log")?;

        self.index
            .index_log(&log)
            .await
            .with_context(|| format!("Failed to re-index audit log {}", log.log_id))?;

        info!(log_id = %log.log_id, offset = envelope.offset, "Reprocessed DLQ message");
        Ok(())
    }

    /// Replay up to `count` DLQ entries, returning `(succeeded, failed)`.
    /// Failed replays are logged and skipped so one bad entry cannot block
    /// the rest of the batch.
    pub async fn reprocess_all(&self, count: usize) -> Result<(usize, usize)> {
        let envelopes = self.list_messages(count).await?;
        if envelopes.is_empty() {
            info!("DLQ is empty, nothing to reprocess");
            return Ok((0, 0));
        }
        Ok(self.reprocess_envelopes(&envelopes).await)
    }

    async fn reprocess_envelopes(&self, envelopes: &[DlqEnvelope]) -> (usize, usize) {
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for envelope in envelopes {
            match self.reprocess_message(envelope).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(offset = envelope.offset, error = %e, "Failed to reprocess DLQ message");
                    failed += 1;
                }
            }
        }

        info!(succeeded, failed, "DLQ reprocessing finished");
        (succeeded, failed)
    }

    /// Destroy all DLQ contents by deleting and recreating the topic.
    pub async fn purge_dlq(&self) -> Result<()> {
        admin::recreate_topic(&self.brokers, &self.dlq_topic)
            .await
            .with_context(|| format!("Failed to purge DLQ topic {}", self.dlq_topic))?;
        info!(topic = %self.dlq_topic, "DLQ purged");
        Ok(())
    }

    fn peek_consumer(&self) -> Result<StreamConsumer> {
        // Unique group per peek keeps inspections independent of each other
        // and of the real consumer's committed offsets.
        let group = format!("dlq-inspector-{}", Uuid::new_v4());
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("Failed to create DLQ consumer")?;

        let metadata = consumer
            .fetch_metadata(Some(&self.dlq_topic), METADATA_TIMEOUT)
            .context("Failed to fetch DLQ topic metadata")?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == self.dlq_topic)
            .map(|topic| topic.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();

        let tpl = peek_assignment(&self.dlq_topic, &partitions)?;
        consumer
            .assign(&tpl)
            .context("Failed to assign DLQ partitions")?;

        Ok(consumer)
    }
}

/// Assignment covering every partition of the DLQ topic from the earliest
/// retained offset. Topics this service creates have a single partition,
/// but a pre-existing DLQ may have more; a peek must not silently skip
/// them. An empty partition list (topic not created yet) falls back to
/// partition 0 so the poll loop simply times out empty.
fn peek_assignment(topic: &str, partitions: &[i32]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    if partitions.is_empty() {
        tpl.add_partition_offset(topic, 0, Offset::Beginning)
            .context("Failed to build DLQ assignment")?;
        return Ok(tpl);
    }
    for &partition in partitions {
        tpl.add_partition_offset(topic, partition, Offset::Beginning)
            .context("Failed to build DLQ assignment")?;
    }
    Ok(tpl)
}
