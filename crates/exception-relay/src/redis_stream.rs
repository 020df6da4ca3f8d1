//! Redis Streams backend.
//!
//! Handles XREADGROUP, XACK, XPENDING, XCLAIM and XADD against the
//! notification stream. Blocking reads use their own connection so a
//! long XREADGROUP BLOCK never delays acknowledgements on the shared one.

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::stream::{GroupStatus, PendingEntry, StreamBackend, StreamEntry};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, AsyncConnectionConfig, Client, RedisResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Extra time a blocking read may take on the wire beyond its BLOCK timeout.
const READ_RESPONSE_SLACK: Duration = Duration::from_secs(5);

/// Redis Streams consumer-group client for one stream.
pub struct RedisStream {
    client: Client,
    conn: RwLock<MultiplexedConnection>,
    read_conn: RwLock<MultiplexedConnection>,
    read_config: AsyncConnectionConfig,
    stream: String,
    group: String,
    consumer: String,
    maxlen: usize,
}

impl RedisStream {
    /// Connect to Redis using the relay configuration.
    pub async fn connect(config: &RelayConfig) -> RelayResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let read_config = AsyncConnectionConfig::new()
            .set_response_timeout(config.block_timeout + READ_RESPONSE_SLACK);

        let conn = client.get_multiplexed_async_connection().await?;
        let read_conn = client
            .get_multiplexed_async_connection_with_config(&read_config)
            .await?;

        info!(
            stream = %config.stream_name,
            group = %config.group_name,
            consumer = %config.consumer_name,
            "Connected to Redis"
        );

        Ok(Self {
            client,
            conn: RwLock::new(conn),
            read_conn: RwLock::new(read_conn),
            read_config,
            stream: config.stream_name.clone(),
            group: config.group_name.clone(),
            consumer: config.consumer_name.clone(),
            maxlen: config.stream_maxlen,
        })
    }

    async fn conn(&self) -> MultiplexedConnection {
        self.conn.read().await.clone()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

fn to_entry(raw: StreamId) -> StreamEntry {
    let fields: HashMap<String, String> = raw
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|v| (k.clone(), v))
        })
        .collect();
    StreamEntry::new(raw.id, fields)
}

#[async_trait]
impl StreamBackend for RedisStream {
    fn stream_name(&self) -> &str {
        &self.stream
    }

    async fn stream_exists(&self) -> RelayResult<bool> {
        let exists: bool = self.conn().await.exists(&self.stream).await?;
        Ok(exists)
    }

    async fn ensure_group(&self) -> RelayResult<GroupStatus> {
        // XGROUP CREATE key group $ MKSTREAM: start at the latest entry
        let result: RedisResult<()> = self
            .conn()
            .await
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(GroupStatus::Created)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(GroupStatus::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, fields: &[(String, String)]) -> RelayResult<String> {
        let id: String = self
            .conn()
            .await
            .xadd_maxlen(&self.stream, StreamMaxlen::Approx(self.maxlen), "*", fields)
            .await?;
        debug!(stream = %self.stream, entry_id = %id, "Appended stream entry");
        Ok(id)
    }

    async fn read_group(&self, count: usize, block: Duration) -> RelayResult<Vec<StreamEntry>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let mut conn = self.read_conn.read().await.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await?;

        // Nil reply: block timeout expired
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let entries: Vec<StreamEntry> = reply
            .keys
            .into_iter()
            .filter(|key| key.key == self.stream)
            .flat_map(|key| key.ids)
            .map(to_entry)
            .collect();

        if !entries.is_empty() {
            debug!(stream = %self.stream, count = entries.len(), "Read entries from stream");
        }
        Ok(entries)
    }

    async fn ack(&self, id: &str) -> RelayResult<bool> {
        let acked: i64 = self
            .conn()
            .await
            .xack(&self.stream, &self.group, &[id])
            .await?;

        if acked == 1 {
            debug!(entry_id = %id, stream = %self.stream, "Acknowledged entry");
        } else {
            warn!(
                entry_id = %id,
                stream = %self.stream,
                "XACK returned {}, entry may not be pending",
                acked
            );
        }
        Ok(acked == 1)
    }

    async fn pending_count(&self) -> RelayResult<u64> {
        let reply: StreamPendingReply = self
            .conn()
            .await
            .xpending(&self.stream, &self.group)
            .await?;
        Ok(reply.count() as u64)
    }

    async fn pending_entries(&self, count: usize) -> RelayResult<Vec<PendingEntry>> {
        let reply: StreamPendingCountReply = self
            .conn()
            .await
            .xpending_count(&self.stream, &self.group, "-", "+", count)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(&self, min_idle: Duration, ids: &[String]) -> RelayResult<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply: StreamClaimReply = self
            .conn()
            .await
            .xclaim(
                &self.stream,
                &self.group,
                &self.consumer,
                min_idle.as_millis() as u64,
                ids,
            )
            .await?;

        Ok(reply.ids.into_iter().map(to_entry).collect())
    }

    async fn reconnect(&self) -> RelayResult<()> {
        info!("Reconnecting to Redis...");
        let conn = self.client.get_multiplexed_async_connection().await?;
        let read_conn = self
            .client
            .get_multiplexed_async_connection_with_config(&self.read_config)
            .await?;
        *self.conn.write().await = conn;
        *self.read_conn.write().await = read_conn;

        // The stream may have been deleted while we were away.
        self.ensure_group().await?;
        Ok(())
    }
}
