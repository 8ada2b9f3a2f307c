//! Kafka topic administration helpers.
//!
//! Source and DLQ topics are created on demand with a single partition so
//! broker offsets form one monotonic sequence per topic.

use crate::error::BrokerError;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

fn admin_client(brokers: &str) -> Result<AdminClient<DefaultClientContext>, BrokerError> {
    let client = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .create()?;
    Ok(client)
}

/// Create `topic` if it does not exist yet. Already-existing topics are not
/// an error.
pub async fn create_topic_if_not_exists(brokers: &str, topic: &str) -> Result<(), BrokerError> {
    let admin = admin_client(brokers)?;
    let new_topic = NewTopic::new(topic, 1, TopicReplication::Fixed(1));
    let opts = AdminOptions::new().operation_timeout(Some(OPERATION_TIMEOUT));

    let results = admin.create_topics(&[new_topic], &opts).await?;
    for result in results {
        match result {
            Ok(name) => info!(topic = %name, "Created topic"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %name, "Topic already exists");
            }
            Err((name, code)) => {
                return Err(BrokerError::Admin {
                    topic: name,
                    reason: code.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Delete and recreate `topic`, discarding every message it holds.
pub async fn recreate_topic(brokers: &str, topic: &str) -> Result<(), BrokerError> {
    let admin = admin_client(brokers)?;
    let opts = AdminOptions::new().operation_timeout(Some(OPERATION_TIMEOUT));

    let results = admin.delete_topics(&[topic], &opts).await?;
    for result in results {
        match result {
            Ok(name) => info!(topic = %name, "Deleted topic"),
            Err((name, RDKafkaErrorCode::UnknownTopicOrPartition)) => {
                debug!(topic = %name, "Topic did not exist, nothing to delete");
            }
            Err((name, code)) => {
                return Err(BrokerError::Admin {
                    topic: name,
                    reason: code.to_string(),
                });
            }
        }
    }

    // Topic deletion completes asynchronously on the broker; give it a
    // moment before recreating under the same name.
    tokio::time::sleep(Duration::from_secs(1)).await;

    create_topic_if_not_exists(brokers, topic).await
}
