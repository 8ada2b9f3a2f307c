//! Audit log ingestion CLI.
//!
//! ```bash
//! # Run the consumer until interrupted
//! audit-ingest consume
//! audit-ingest consume --batch-size 50 --consumer-name audit-replica-2
//!
//! # Dead-letter queue tooling
//! audit-ingest dlq --action list --count 20
//! audit-ingest dlq --action reprocess-all --count 100
//! audit-ingest dlq --action purge --no-input
//! ```
//!
//! Environment variables:
//! - KAFKA_BROKERS: Kafka broker addresses (default: "localhost:9092")
//! - AUDIT_LOG_TOPIC: Topic to consume (default: "audit_logs")
//! - AUDIT_LOG_DLQ_TOPIC: Dead-letter topic (default: "<source>_dlq")
//! - CONSUMER_GROUP: Consumer group id (default: "audit-log-indexer")
//! - ELASTICSEARCH_URL: Index endpoint (default: "http://localhost:9200")
//! - ELASTICSEARCH_USERNAME / ELASTICSEARCH_PASSWORD: Optional basic auth
//! - ELASTICSEARCH_INDEX_PREFIX: Monthly index prefix (default: "audit-logs")
//! - BATCH_SIZE: Messages per offset commit (default: 100)
//! - STATS_INTERVAL: Messages per metrics log line (default: 1000)

use anyhow::Context;
use audit_ingest_service::config::Config;
use audit_ingest_service::events::consumer::{AuditLogConsumer, ConsumerConfig};
use audit_ingest_service::events::dlq::{DeadLetterSink, KafkaDeadLetterPublisher};
use audit_ingest_service::events::inspector::DlqInspector;
use audit_ingest_service::{AuditLogIndex, ElasticsearchAuditIndex};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "audit-ingest")]
#[command(about = "Audit log ingestion: Kafka consumer, Elasticsearch indexing, DLQ tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the audit log consumer until interrupted
    Consume {
        /// Messages per offset commit (overrides BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<u64>,

        /// Consumer group name (overrides CONSUMER_GROUP)
        #[arg(long)]
        consumer_name: Option<String>,
    },

    /// Inspect, replay, or purge the dead-letter queue
    Dlq {
        /// What to do with the DLQ
        #[arg(long, value_enum)]
        action: DlqAction,

        /// How many messages to list or reprocess
        #[arg(long, default_value_t = 10)]
        count: usize,

        /// Skip interactive confirmation prompts
        #[arg(long)]
        no_input: bool,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum DlqAction {
    /// Print DLQ entries without consuming them
    List,
    /// Replay DLQ entries into the index
    ReprocessAll,
    /// Delete and recreate the DLQ topic
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audit_ingest=info".parse().expect("valid directive"))
                .add_directive("audit_ingest_service=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Consume {
            batch_size,
            consumer_name,
        } => run_consumer(config, batch_size, consumer_name).await,
        Commands::Dlq {
            action,
            count,
            no_input,
        } => run_dlq(config, action, count, no_input).await,
    }
}

async fn run_consumer(
    config: Config,
    batch_size: Option<u64>,
    consumer_name: Option<String>,
) -> anyhow::Result<()> {
    let index = build_index(&config)?;
    let dlq: Arc<dyn DeadLetterSink> = Arc::new(KafkaDeadLetterPublisher::new(
        &config.kafka_brokers,
        &config.dlq_topic,
    ));

    let mut consumer_config = ConsumerConfig::from_config(&config);
    if let Some(batch_size) = batch_size {
        consumer_config.batch_size = batch_size;
    }
    if let Some(consumer_name) = consumer_name {
        consumer_config.consumer_name = consumer_name;
    }

    info!(
        brokers = %consumer_config.brokers,
        topic = %consumer_config.topic,
        consumer = %consumer_config.consumer_name,
        batch_size = consumer_config.batch_size,
        "Starting audit log consumer"
    );

    let consumer = AuditLogConsumer::new(consumer_config, index, dlq);

    let shutdown = consumer.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown.send(true);
    });

    consumer.run().await.context("Audit log consumer failed")?;
    Ok(())
}

async fn run_dlq(
    config: Config,
    action: DlqAction,
    count: usize,
    no_input: bool,
) -> anyhow::Result<()> {
    let index = build_index(&config)?;
    let inspector = DlqInspector::new(&config.kafka_brokers, &config.dlq_topic, index.clone());

    match action {
        DlqAction::List => {
            let envelopes = inspector.list_messages(count).await?;
            if envelopes.is_empty() {
                println!("DLQ {} is empty", config.dlq_topic);
                return Ok(());
            }
            for envelope in &envelopes {
                println!(
                    "offset={} error_type={} failed_at={} consumer={} error={}",
                    envelope.offset,
                    envelope.error_type,
                    envelope.failed_at.to_rfc3339(),
                    envelope.consumer_name,
                    envelope.error
                );
            }
            println!("{} message(s) shown", envelopes.len());
        }

        DlqAction::ReprocessAll => {
            index
                .ping()
                .await
                .context("Elasticsearch is unreachable, aborting reprocess")?;
            let (succeeded, failed) = inspector.reprocess_all(count).await?;
            println!("Reprocessed {succeeded} message(s), {failed} failed");
        }

        DlqAction::Purge => {
            if !no_input && !confirm_purge(&config.dlq_topic)? {
                println!("Aborted");
                return Ok(());
            }
            inspector.purge_dlq().await?;
            println!("DLQ topic {} purged", config.dlq_topic);
        }
    }

    Ok(())
}

fn build_index(config: &Config) -> anyhow::Result<Arc<dyn AuditLogIndex>> {
    let index = ElasticsearchAuditIndex::new(
        &config.elasticsearch_url,
        config.elasticsearch_username.as_deref(),
        config.elasticsearch_password.as_deref(),
        &config.index_prefix,
    )
    .context("Failed to build Elasticsearch client")?;
    Ok(Arc::new(index))
}

fn confirm_purge(topic: &str) -> anyhow::Result<bool> {
    print!("This will permanently delete all messages in {topic}. Continue? [y/N] ");
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
