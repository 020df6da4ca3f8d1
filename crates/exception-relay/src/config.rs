//! Configuration for the exception relay.
//!
//! Every setting has a default and can be overridden through the
//! environment; the binary layers CLI flags on top for the common ones.

use crate::error::{RelayError, RelayResult};
use crate::worker_pool::WorkerPoolConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Page size never drops below this, whatever is configured.
pub const MIN_PAGE_SIZE: usize = 100;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Stream carrying notification events
    pub stream_name: String,

    /// Consumer group name
    pub group_name: String,

    /// Consumer name (unique per instance)
    pub consumer_name: String,

    /// Approximate MAXLEN applied by the trigger producer
    pub stream_maxlen: usize,

    /// Field of a stream entry holding the subject key
    pub subject_field: String,

    /// XREADGROUP COUNT
    pub read_count: usize,

    /// XREADGROUP BLOCK timeout
    pub block_timeout: Duration,

    /// Kafka bootstrap servers
    pub kafka_brokers: String,

    /// Destination topic for outbound messages
    pub topic: String,

    /// Worker pool sizing
    pub worker: WorkerPoolConfig,

    /// Pending entries idle at least this long are reclaimed
    pub stale_after: Duration,

    /// Delay between reclaimer runs
    pub reclaim_interval: Duration,

    /// Upper bound on pending entries inspected per reclaimer run
    pub reclaim_batch: usize,

    /// Configured page size (see [`RelayConfig::effective_page_size`])
    pub page_size: usize,

    /// Run another pass when a trigger arrives for a key already in flight
    pub recheck_on_duplicate: bool,

    /// How long shutdown waits for running work
    pub shutdown_grace: Duration,

    /// SQLite database file holding exception records
    pub database_path: PathBuf,

    /// Emit JSON log lines instead of compact text
    pub log_json: bool,

    /// JSONL file receiving a copy of every log event
    pub log_file: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_name: "exceptions:events".to_string(),
            group_name: "exception-relay".to_string(),
            consumer_name: default_consumer_name(),
            stream_maxlen: 1_000_000,
            subject_field: "securityId".to_string(),
            read_count: 16,
            block_timeout: Duration::from_millis(5000),
            kafka_brokers: "127.0.0.1:9092".to_string(),
            topic: "exceptions".to_string(),
            worker: WorkerPoolConfig::default(),
            stale_after: Duration::from_millis(60_000),
            reclaim_interval: Duration::from_millis(30_000),
            reclaim_batch: 64,
            page_size: 1000,
            recheck_on_duplicate: false,
            shutdown_grace: Duration::from_secs(5),
            database_path: PathBuf::from("exceptions.db"),
            log_json: false,
            log_file: None,
        }
    }
}

fn default_consumer_name() -> String {
    format!("relay-{}", uuid::Uuid::new_v4())
}

impl RelayConfig {
    /// Build a configuration from process environment variables.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unparseable numeric values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default)
        };
        let millis = |key: &str, default: Duration| {
            parsed::<u64>(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let secs = |key: &str, default: Duration| {
            parsed::<u64>(&lookup, key)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let worker = WorkerPoolConfig {
            core_size: parsed(&lookup, "RELAY_WORKER_CORE").unwrap_or(defaults.worker.core_size),
            max_size: parsed(&lookup, "RELAY_WORKER_MAX").unwrap_or(defaults.worker.max_size),
            queue_capacity: parsed(&lookup, "RELAY_WORKER_QUEUE")
                .unwrap_or(defaults.worker.queue_capacity),
            keep_alive: secs("RELAY_WORKER_KEEP_ALIVE_SECS", defaults.worker.keep_alive),
        };

        let config = Self {
            redis_url: string("REDIS_URL", defaults.redis_url),
            stream_name: string("RELAY_STREAM_NAME", defaults.stream_name),
            group_name: string("RELAY_GROUP_NAME", defaults.group_name),
            consumer_name: string("RELAY_CONSUMER_NAME", defaults.consumer_name),
            stream_maxlen: parsed(&lookup, "RELAY_STREAM_MAXLEN").unwrap_or(defaults.stream_maxlen),
            subject_field: string("RELAY_SUBJECT_FIELD", defaults.subject_field),
            read_count: parsed(&lookup, "RELAY_READ_COUNT").unwrap_or(defaults.read_count),
            block_timeout: millis("RELAY_BLOCK_MS", defaults.block_timeout),
            kafka_brokers: string("KAFKA_BROKERS", defaults.kafka_brokers),
            topic: string("RELAY_TOPIC", defaults.topic),
            worker,
            stale_after: millis("RELAY_CLAIM_STALE_AFTER_MS", defaults.stale_after),
            reclaim_interval: millis("RELAY_RECLAIM_INTERVAL_MS", defaults.reclaim_interval),
            reclaim_batch: parsed(&lookup, "RELAY_RECLAIM_BATCH").unwrap_or(defaults.reclaim_batch),
            page_size: parsed(&lookup, "RELAY_PAGE_SIZE").unwrap_or(defaults.page_size),
            recheck_on_duplicate: parsed(&lookup, "RELAY_RECHECK_ON_DUPLICATE")
                .unwrap_or(defaults.recheck_on_duplicate),
            shutdown_grace: secs("RELAY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            database_path: lookup("RELAY_DATABASE_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            log_json: parsed(&lookup, "RELAY_LOG_JSON").unwrap_or(defaults.log_json),
            log_file: lookup("RELAY_LOG_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        };

        Ok(config)
    }

    /// Page size actually used by the publisher.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.max(MIN_PAGE_SIZE)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> RelayResult<()> {
        for (name, value) in [
            ("stream name", &self.stream_name),
            ("group name", &self.group_name),
            ("consumer name", &self.consumer_name),
            ("subject field", &self.subject_field),
            ("topic", &self.topic),
        ] {
            if value.trim().is_empty() {
                return Err(RelayError::Config(format!("{} must not be empty", name)));
            }
        }
        if self.read_count == 0 {
            return Err(RelayError::Config("read count must be at least 1".into()));
        }
        if self.block_timeout.is_zero() {
            // BLOCK 0 means "wait forever" to Redis, which would hide shutdown
            return Err(RelayError::Config("block timeout must be positive".into()));
        }
        if self.reclaim_batch == 0 {
            return Err(RelayError::Config("reclaim batch must be at least 1".into()));
        }
        if self.reclaim_interval.is_zero() {
            return Err(RelayError::Config("reclaim interval must be positive".into()));
        }
        self.worker.validate()
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
