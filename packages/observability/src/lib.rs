//! # Observability
//!
//! Logging setup shared by the exception relay binaries.
//!
//! Services call [`init_with_config`] once at startup and then use plain
//! `tracing` macros. Output is compact human-readable text by default, or
//! JSON lines when `json` is set. A log file, when configured, always
//! receives JSON lines.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "exception-relay".into(),
//!     default_level: "debug".into(),
//!     ..Default::default()
//! });
//! tracing::info!("ready");
//! ```

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::LogFileWriter;

use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSON line.
    pub service_name: String,

    /// Default level filter (e.g. "debug", "info"). `RUST_LOG` wins if set.
    pub default_level: String,

    /// Emit JSON lines on stdout instead of compact text.
    pub json: bool,

    /// Optional JSONL file receiving a copy of every event.
    pub log_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            json: false,
            log_path: None,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with custom configuration.
///
/// Only the first call in a process installs a subscriber; later calls are
/// ignored.
pub fn init_with_config(config: LogConfig) {
    let console_json = config
        .json
        .then(|| JsonLayer::new(config.service_name.clone(), std::io::stdout));

    let console_text = (!config.json)
        .then(|| tracing_subscriber::fmt::layer().with_target(true).compact());

    let mut file_error = None;
    let file = match &config.log_path {
        Some(path) => match LogFileWriter::open(path) {
            Ok(writer) => Some(JsonLayer::new(config.service_name.clone(), writer)),
            Err(e) => {
                file_error = Some(format!("{}: {}", path.display(), e));
                None
            }
        },
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter(&config.default_level))
        .with(console_json)
        .with(console_text)
        .with(file)
        .try_init()
        .is_ok();

    if installed {
        if let Some(error) = file_error {
            tracing::warn!(error = %error, "Could not open log file, logging to console only");
        }
        tracing::debug!(service = %config.service_name, "observability initialized");
    }
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};
