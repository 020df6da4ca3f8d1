//! Stream backend abstraction.
//!
//! The consumer and reclaimer only see this trait; the Redis adapter lives in
//! [`crate::redis_stream`] and the tests drive an in-memory double.

use crate::error::RelayResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// An entry read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id (e.g. "1700000000000-0")
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Value of `field`, if present and not blank.
    pub fn non_blank(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// One row of the group's pending-entry list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer currently owning the entry
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Outcome of creating the consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

/// Consumer-group operations over a single stream.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Stream key this backend reads and writes.
    fn stream_name(&self) -> &str;

    /// Whether the stream key exists.
    async fn stream_exists(&self) -> RelayResult<bool>;

    /// Create the consumer group at the latest id, creating the stream if
    /// needed. An existing group is not an error.
    async fn ensure_group(&self) -> RelayResult<GroupStatus>;

    /// Append an entry, trimming the stream approximately. Returns its id.
    async fn append(&self, fields: &[(String, String)]) -> RelayResult<String>;

    /// Read up to `count` never-delivered entries for this consumer, waiting
    /// at most `block`. An empty vector means the wait timed out.
    async fn read_group(&self, count: usize, block: Duration) -> RelayResult<Vec<StreamEntry>>;

    /// Acknowledge an entry. Returns `true` if it was pending.
    async fn ack(&self, id: &str) -> RelayResult<bool>;

    /// Total entries pending in the group.
    async fn pending_count(&self) -> RelayResult<u64>;

    /// Up to `count` pending entries, oldest id first.
    async fn pending_entries(&self, count: usize) -> RelayResult<Vec<PendingEntry>>;

    /// Claim `ids` for this consumer if they have been idle at least
    /// `min_idle`. Returns the entries actually claimed.
    async fn claim(&self, min_idle: Duration, ids: &[String]) -> RelayResult<Vec<StreamEntry>>;

    /// Re-establish the underlying connection.
    async fn reconnect(&self) -> RelayResult<()>;
}
