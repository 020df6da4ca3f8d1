//! Kafka message bus.

use crate::bus::{MessageBus, PublishReceipt};
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info, warn};

/// [`MessageBus`] over an rdkafka `FutureProducer`.
pub struct KafkaBus {
    producer: FutureProducer,
}

impl KafkaBus {
    pub fn new(brokers: &str, client_id: &str) -> RelayResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("client.id", client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| RelayError::Bus(format!("failed to create producer: {}", e)))?;

        info!(brokers = %brokers, client_id = %client_id, "Kafka producer created");
        Ok(Self { producer })
    }

    /// Wait up to `timeout` for queued messages to be delivered.
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(Timeout::After(timeout)) {
            warn!(error = %e, "Kafka flush did not complete");
        }
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> RelayResult<PublishReceipt> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::Never).await {
            Ok((partition, offset)) => {
                debug!(topic = %topic, key = %key, partition, offset, "Published to Kafka");
                Ok(PublishReceipt { partition, offset })
            }
            Err((e, _)) => Err(RelayError::Bus(e.to_string())),
        }
    }
}
