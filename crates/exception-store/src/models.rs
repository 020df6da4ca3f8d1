//! Exception record model types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a recorded exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse the stored column value. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// An exception record as persisted in the `exception_record` table.
///
/// `processed_at == None` is the only idempotency marker: the record is
/// pending until the relay stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: i64,
    pub service_name: String,
    pub severity: Severity,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub security_id: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub stacktrace: Option<String>,
    pub correlation_id: Option<String>,
}

impl ExceptionRecord {
    /// Whether the record still awaits relay.
    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}

/// Input for inserting an exception record.
#[derive(Debug, Clone)]
pub struct NewExceptionRecord {
    pub service_name: String,
    pub severity: Severity,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub security_id: String,
    pub stacktrace: Option<String>,
    pub correlation_id: Option<String>,
}

/// Format a timestamp for storage.
///
/// Fixed-width UTC with microseconds, so lexical order in SQLite matches
/// chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
