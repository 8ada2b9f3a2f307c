//! Dead-letter publication for terminally failed audit log messages.

use crate::error::BrokerError;
use crate::events::admin;
use crate::models::DlqEnvelope;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for DLQ envelopes.
///
/// Publication is best effort by contract: implementations log failures and
/// swallow them, because a DLQ outage must never stall live ingestion.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, envelope: DlqEnvelope);
}

/// Kafka-backed dead-letter publisher.
///
/// The producer connection and the DLQ topic are created lazily on the
/// first send and reused afterwards, so a consumer that never fails a
/// message never touches the DLQ stream.
pub struct KafkaDeadLetterPublisher {
    brokers: String,
    topic: String,
    producer: OnceCell<FutureProducer>,
}

impl KafkaDeadLetterPublisher {
    pub fn new(brokers: &str, topic: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            producer: OnceCell::new(),
        }
    }

    async fn producer(&self) -> Result<&FutureProducer, BrokerError> {
        self.producer
            .get_or_try_init(|| async {
                admin::create_topic_if_not_exists(&self.brokers, &self.topic).await?;
                let producer: FutureProducer = ClientConfig::new()
                    .set("bootstrap.servers", &self.brokers)
                    .set("message.timeout.ms", "5000")
                    .create()?;
                Ok(producer)
            })
            .await
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterPublisher {
    async fn send(&self, envelope: DlqEnvelope) {
        let producer = match self.producer().await {
            Ok(producer) => producer,
            Err(e) => {
                error!(
                    offset = envelope.offset,
                    error = %e,
                    "Failed to reach DLQ stream; message may be lost"
                );
                return;
            }
        };

        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    offset = envelope.offset,
                    error = %e,
                    "Failed to serialize DLQ envelope; message may be lost"
                );
                return;
            }
        };

        let key = envelope_key(&envelope);
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, dlq_offset)) => {
                warn!(
                    topic = %self.topic,
                    partition,
                    dlq_offset,
                    offset = envelope.offset,
                    error_type = %envelope.error_type,
                    "Routed failed message to DLQ"
                );
            }
            Err((e, _)) => {
                error!(
                    offset = envelope.offset,
                    error = %e,
                    "Failed to publish to DLQ; message may be lost"
                );
            }
        }
    }
}

/// Key DLQ records by the original `log_id` when one is present so replays
/// of the same document land in the same partition; fall back to the source
/// offset for unparseable payloads.
fn envelope_key(envelope: &DlqEnvelope) -> String {
    envelope
        .original_message
        .get("log_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| envelope.offset.to_string())
}
