/// Runtime configuration for the ingestion service.
///
/// Everything is environment-sourced with working local defaults so the
/// binary runs against a `localhost` Kafka/Elasticsearch pair without any
/// setup. CLI flags may override individual fields after loading.
#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_brokers: String,
    pub source_topic: String,
    pub dlq_topic: String,
    pub consumer_group: String,
    pub elasticsearch_url: String,
    pub elasticsearch_username: Option<String>,
    pub elasticsearch_password: Option<String>,
    pub index_prefix: String,
    /// Number of processed messages between offset commits.
    pub batch_size: u64,
    /// Number of processed messages between metrics snapshot logs.
    pub stats_interval: u64,
}

pub const DEFAULT_BATCH_SIZE: u64 = 100;
pub const DEFAULT_STATS_INTERVAL: u64 = 1000;

impl Config {
    pub fn from_env() -> Self {
        let source_topic =
            std::env::var("AUDIT_LOG_TOPIC").unwrap_or_else(|_| "audit_logs".to_string());
        let dlq_topic = std::env::var("AUDIT_LOG_DLQ_TOPIC")
            .unwrap_or_else(|_| default_dlq_topic(&source_topic));

        Self {
            kafka_brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            source_topic,
            dlq_topic,
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "audit-log-indexer".to_string()),
            elasticsearch_url: std::env::var("ELASTICSEARCH_URL")
                .unwrap_or_else(|_| "http://localhost:9200".to_string()),
            elasticsearch_username: std::env::var("ELASTICSEARCH_USERNAME").ok(),
            elasticsearch_password: std::env::var("ELASTICSEARCH_PASSWORD").ok(),
            index_prefix: std::env::var("ELASTICSEARCH_INDEX_PREFIX")
                .unwrap_or_else(|_| "audit-logs".to_string()),
            batch_size: std::env::var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            stats_interval: std::env::var("STATS_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STATS_INTERVAL),
        }
    }
}

fn default_dlq_topic(source_topic: &str) -> String {
    format!("{source_topic}_dlq")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "KAFKA_BROKERS",
            "AUDIT_LOG_TOPIC",
            "AUDIT_LOG_DLQ_TOPIC",
            "CONSUMER_GROUP",
            "ELASTICSEARCH_URL",
            "ELASTICSEARCH_USERNAME",
            "ELASTICSEARCH_PASSWORD",
            "ELASTICSEARCH_INDEX_PREFIX",
            "BATCH_SIZE",
            "STATS_INTERVAL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_dlq_topic_derived_from_source() {
        assert_eq!(default_dlq_topic("audit_logs"), "audit_logs_dlq");
        assert_eq!(default_dlq_topic("events"), "events_dlq");
    }

    #[test]
    #[serial]
    fn test_defaults_without_environment() {
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.kafka_brokers, "localhost:9092");
        assert_eq!(config.source_topic, "audit_logs");
        assert_eq!(config.dlq_topic, "audit_logs_dlq");
        assert_eq!(config.consumer_group, "audit-log-indexer");
        assert_eq!(config.elasticsearch_url, "http://localhost:9200");
        assert!(config.elasticsearch_username.is_none());
        assert_eq!(config.index_prefix, "audit-logs");
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.stats_interval, DEFAULT_STATS_INTERVAL);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        clear_env();
        std::env::set_var("AUDIT_LOG_TOPIC", "changes");
        std::env::set_var("BATCH_SIZE", "25");
        std::env::set_var("STATS_INTERVAL", "not-a-number");

        let config = Config::from_env();
        assert_eq!(config.source_topic, "changes");
        assert_eq!(config.dlq_topic, "changes_dlq");
        assert_eq!(config.batch_size, 25);
        // Unparseable numerics fall back to the default.
        assert_eq!(config.stats_interval, DEFAULT_STATS_INTERVAL);

        clear_env();
    }
}
