//! Message bus seam and the outbound message projection.

use crate::error::RelayResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exception_store::{ExceptionRecord, Severity};
use serde::{Deserialize, Serialize};

/// Where the bus stored a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Publishes keyed payloads to a topic.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one message. No timeout is applied here; a stalled broker
    /// holds the caller until it answers.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> RelayResult<PublishReceipt>;
}

/// JSON body sent for each exception record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: i64,
    pub service_name: String,
    pub severity: Severity,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub security_id: String,
}

impl OutboundMessage {
    /// Bus key: `serviceName:securityId`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.service_name, self.security_id)
    }

    pub fn to_json(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl From<&ExceptionRecord> for OutboundMessage {
    fn from(record: &ExceptionRecord) -> Self {
        Self {
            id: record.id,
            service_name: record.service_name.clone(),
            severity: record.severity,
            message: record.message.clone(),
            occurred_at: record.occurred_at,
            correlation_id: record.correlation_id.clone(),
            security_id: record.security_id.clone(),
        }
    }
}
