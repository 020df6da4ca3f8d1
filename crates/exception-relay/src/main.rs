//! Exception relay binary entry point.
//!
//! Usage:
//!   exception-relay [run]                 relay until interrupted
//!   exception-relay bootstrap             create the stream and consumer group
//!   exception-relay trigger <SECURITY_ID> append a notification for a subject key

use clap::{Parser, Subcommand};
use exception_relay::{
    ensure_stream_and_group, RedisStream, RelayConfig, RelayResult, StreamBackend,
};
use std::path::PathBuf;
use tracing::info;

/// Exception relay: publishes pending exception records to Kafka.
#[derive(Parser, Debug)]
#[command(name = "exception-relay")]
#[command(about = "Relays pending exception records to Kafka, triggered by a Redis stream")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Kafka bootstrap servers.
    #[arg(long, env = "KAFKA_BROKERS")]
    kafka_brokers: Option<String>,

    /// SQLite database holding exception records.
    #[arg(long, env = "RELAY_DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Consumer name within the group (defaults to relay-<uuid>).
    #[arg(long, env = "RELAY_CONSUMER_NAME")]
    consumer_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// Append a JSONL copy of every log event to this file.
    #[arg(long, env = "RELAY_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume notifications and relay records (default).
    Run,
    /// Create the stream and consumer group, then exit.
    Bootstrap,
    /// Append a notification for a subject key.
    Trigger {
        /// Subject key written to the notification's subject field.
        security_id: String,
    },
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let args = Args::parse();

    let mut config = RelayConfig::from_env()?;
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(brokers) = args.kafka_brokers {
        config.kafka_brokers = brokers;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(consumer_name) = args.consumer_name {
        config.consumer_name = consumer_name;
    }
    config.log_json |= args.log_json;
    if let Some(log_file) = args.log_file {
        config.log_file = Some(log_file);
    }

    observability::init_with_config(observability::LogConfig {
        service_name: "exception-relay".into(),
        default_level: args.log_level.clone(),
        json: config.log_json,
        log_path: config.log_file.clone(),
    });

    config.validate()?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Bootstrap => {
            let stream = RedisStream::connect(&config).await?;
            let status = ensure_stream_and_group(&stream).await?;
            info!(?status, stream = %config.stream_name, group = %config.group_name, "Bootstrap complete");
            Ok(())
        }
        Command::Trigger { security_id } => {
            let stream = RedisStream::connect(&config).await?;
            let id = stream
                .append(&[(config.subject_field.clone(), security_id.clone())])
                .await?;
            info!(entry_id = %id, security_id = %security_id, stream = %config.stream_name, "Trigger appended");
            Ok(())
        }
    }
}

#[cfg(feature = "kafka")]
async fn run(config: RelayConfig) -> RelayResult<()> {
    use exception_relay::{KafkaBus, Relay};
    use exception_store::ExceptionStore;
    use std::sync::Arc;

    info!(
        redis_url = %config.redis_url,
        stream = %config.stream_name,
        group = %config.group_name,
        consumer = %config.consumer_name,
        kafka_brokers = %config.kafka_brokers,
        topic = %config.topic,
        database = %config.database_path.display(),
        page_size = config.effective_page_size(),
        "Configuration loaded"
    );

    let store = Arc::new(ExceptionStore::open(&config.database_path).await?);
    store.health_check().await?;
    let bus = Arc::new(KafkaBus::new(&config.kafka_brokers, &config.consumer_name)?);
    let stream = Arc::new(RedisStream::connect(&config).await?);
    let grace = config.shutdown_grace;

    let relay = Relay::new(config, stream, store, bus.clone())?;
    relay.bootstrap().await?;
    let handle = relay.start();

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping...");

    handle.shutdown().await;
    bus.flush(grace);
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn run(_config: RelayConfig) -> RelayResult<()> {
    Err(exception_relay::RelayError::Config(
        "built without the `kafka` feature; no message bus available".into(),
    ))
}
