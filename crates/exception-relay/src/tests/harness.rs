//! Test harness for relay tests.
//!
//! Provides:
//! - MockStream: in-memory consumer group with a pending-entry list and a
//!   manually advanced idle clock
//! - MockBus: records publishes; failures and stalls can be injected
//! - MemoryStore: exception records in a Vec, with read counters
//! - Rig: the relay core wired over the three doubles

use crate::bus::{MessageBus, PublishReceipt};
use crate::config::RelayConfig;
use crate::consumer::{EntryHandler, StreamConsumer};
use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, RelayResult};
use crate::in_flight::InFlightKeys;
use crate::publisher::OutboxPublisher;
use crate::reclaimer::StaleReclaimer;
use crate::relay::Relay;
use crate::store::RecordStore;
use crate::stream::{GroupStatus, PendingEntry, StreamBackend, StreamEntry};
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use exception_store::{ExceptionRecord, Severity, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

pub const CONSUMER: &str = "relay-test";
pub const SERVICE: &str = "SVC";

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut`, failing the test if it takes longer than five seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Relay configuration tuned for tests: short blocks, small pool.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        consumer_name: CONSUMER.to_string(),
        block_timeout: Duration::from_millis(50),
        worker: WorkerPoolConfig {
            core_size: 2,
            max_size: 2,
            queue_capacity: 8,
            keep_alive: Duration::from_millis(100),
        },
        stale_after: Duration::from_secs(60),
        reclaim_interval: Duration::from_millis(50),
        page_size: 100,
        shutdown_grace: Duration::from_millis(500),
        ..RelayConfig::default()
    }
}

// =============================================================================
// MockStream
// =============================================================================

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: Duration,
    delivery_count: u64,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    group_exists: bool,
    /// Index of the next entry never delivered to the group
    cursor: usize,
    pending: BTreeMap<u64, PendingState>,
    ack_log: Vec<String>,
    read_errors: VecDeque<RelayError>,
    reconnects: usize,
    reads: usize,
}

/// Simulated Redis stream with one consumer group.
pub struct MockStream {
    name: String,
    consumer: String,
    state: Mutex<StreamState>,
    clock: Mutex<Duration>,
    appended: Notify,
}

fn seq_of(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

impl MockStream {
    pub fn new() -> Self {
        Self {
            name: "exceptions:events".to_string(),
            consumer: CONSUMER.to_string(),
            state: Mutex::new(StreamState::default()),
            clock: Mutex::new(Duration::ZERO),
            appended: Notify::new(),
        }
    }

    /// A stream whose group already exists, as after bootstrap.
    pub fn with_group() -> Self {
        let stream = Self::new();
        stream.state.lock().group_exists = true;
        stream
    }

    fn now(&self) -> Duration {
        *self.clock.lock()
    }

    /// Move the idle clock forward.
    pub fn advance(&self, by: Duration) {
        *self.clock.lock() += by;
    }

    /// XADD with arbitrary fields.
    pub fn xadd(&self, fields: &[(&str, &str)]) -> String {
        let mut state = self.state.lock();
        let id = format!("{}-0", state.entries.len() + 1);
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        state.entries.push(StreamEntry::new(id.clone(), fields));
        drop(state);
        self.appended.notify_waiters();
        id
    }

    /// XADD a notification for a subject key.
    pub fn trigger(&self, security_id: &str) -> String {
        self.xadd(&[("securityId", security_id)])
    }

    /// Deliver up to `count` new entries to another consumer, as if it read
    /// them and then died.
    pub fn deliver_to(&self, consumer: &str, count: usize) -> Vec<String> {
        let now = self.now();
        let mut state = self.state.lock();
        let end = (state.cursor + count).min(state.entries.len());
        let ids: Vec<String> = state.entries[state.cursor..end]
            .iter()
            .map(|e| e.id.clone())
            .collect();
        state.cursor = end;
        for id in &ids {
            state.pending.insert(
                seq_of(id),
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        ids
    }

    /// Make the next read fail with `error`.
    pub fn fail_next_read(&self, error: RelayError) {
        self.state.lock().read_errors.push_back(error);
    }

    pub fn ack_count(&self) -> usize {
        self.state.lock().ack_log.len()
    }

    pub fn acks_for(&self, id: &str) -> usize {
        self.state.lock().ack_log.iter().filter(|a| *a == id).count()
    }

    pub fn was_acked(&self, id: &str) -> bool {
        self.acks_for(id) > 0
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.state.lock().pending.contains_key(&seq_of(id))
    }

    pub fn pending_owner(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .pending
            .get(&seq_of(id))
            .map(|p| p.consumer.clone())
    }

    pub fn delivery_count(&self, id: &str) -> u64 {
        self.state
            .lock()
            .pending
            .get(&seq_of(id))
            .map(|p| p.delivery_count)
            .unwrap_or_default()
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().reconnects
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn group_exists(&self) -> bool {
        self.state.lock().group_exists
    }

    fn take_new(&self, count: usize) -> RelayResult<Vec<StreamEntry>> {
        let now = self.now();
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(error) = state.read_errors.pop_front() {
            return Err(error);
        }
        if !state.group_exists {
            return Err(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "NOGROUP no such consumer group",
            ))
            .into());
        }
        let end = (state.cursor + count).min(state.entries.len());
        let batch: Vec<StreamEntry> = state.entries[state.cursor..end].to_vec();
        state.cursor = end;
        for entry in &batch {
            state.pending.insert(
                seq_of(&entry.id),
                PendingState {
                    consumer: self.consumer.clone(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamBackend for MockStream {
    fn stream_name(&self) -> &str {
        &self.name
    }

    async fn stream_exists(&self) -> RelayResult<bool> {
        let state = self.state.lock();
        Ok(state.group_exists || !state.entries.is_empty())
    }

    async fn ensure_group(&self) -> RelayResult<GroupStatus> {
        let mut state = self.state.lock();
        if state.group_exists {
            return Ok(GroupStatus::AlreadyExists);
        }
        state.group_exists = true;
        // Created at "$": nothing already in the stream is delivered.
        state.cursor = state.entries.len();
        Ok(GroupStatus::Created)
    }

    async fn append(&self, fields: &[(String, String)]) -> RelayResult<String> {
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        Ok(self.xadd(&pairs))
    }

    async fn read_group(&self, count: usize, block: Duration) -> RelayResult<Vec<StreamEntry>> {
        let batch = self.take_new(count)?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(block, self.appended.notified()).await;
        let state = self.state.lock();
        if state.cursor < state.entries.len() {
            drop(state);
            return self.take_new(count);
        }
        Ok(Vec::new())
    }

    async fn ack(&self, id: &str) -> RelayResult<bool> {
        let mut state = self.state.lock();
        state.ack_log.push(id.to_string());
        Ok(state.pending.remove(&seq_of(id)).is_some())
    }

    async fn pending_count(&self) -> RelayResult<u64> {
        Ok(self.state.lock().pending.len() as u64)
    }

    async fn pending_entries(&self, count: usize) -> RelayResult<Vec<PendingEntry>> {
        let now = self.now();
        let state = self.state.lock();
        Ok(state
            .pending
            .iter()
            .take(count)
            .map(|(seq, p)| PendingEntry {
                id: format!("{}-0", seq),
                consumer: p.consumer.clone(),
                idle: now.saturating_sub(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(&self, min_idle: Duration, ids: &[String]) -> RelayResult<Vec<StreamEntry>> {
        let now = self.now();
        let mut state = self.state.lock();
        let mut claimed = Vec::new();
        for id in ids {
            let seq = seq_of(id);
            let Some(p) = state.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_sub(p.delivered_at) < min_idle {
                continue;
            }
            p.consumer = self.consumer.clone();
            p.delivered_at = now;
            p.delivery_count += 1;
            if let Some(entry) = state.entries.iter().find(|e| &e.id == id) {
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn reconnect(&self) -> RelayResult<()> {
        self.state.lock().reconnects += 1;
        Ok(())
    }
}

// =============================================================================
// MockBus
// =============================================================================

/// A message the bus accepted.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub key: String,
    pub record_id: i64,
}

/// Recording message bus with failure and stall injection.
pub struct MockBus {
    published: Mutex<Vec<Published>>,
    calls: AtomicUsize,
    failing_calls: Mutex<HashSet<usize>>,
    failing_records: Mutex<HashSet<i64>>,
    fail_all: AtomicBool,
    gate: watch::Sender<bool>,
    waiting: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockBus {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            published: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failing_calls: Mutex::new(HashSet::new()),
            failing_records: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            gate,
            waiting: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Fail the `n`th publish call (1-based, counted across the bus lifetime).
    pub fn fail_call(&self, n: usize) {
        self.failing_calls.lock().insert(n);
    }

    /// Fail every publish of this record until cleared.
    pub fn fail_record(&self, record_id: i64) {
        self.failing_records.lock().insert(record_id);
    }

    pub fn clear_failures(&self) {
        self.failing_calls.lock().clear();
        self.failing_records.lock().clear();
        self.fail_all.store(false, Ordering::SeqCst);
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Hold every publish until [`MockBus::release`].
    pub fn stall(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Publishes currently held by [`MockBus::stall`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    /// How often a record reached the bus.
    pub fn deliveries_of(&self, record_id: i64) -> usize {
        self.published
            .lock()
            .iter()
            .filter(|p| p.record_id == record_id)
            .count()
    }

    /// Highest number of publishes seen in progress at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> RelayResult<PublishReceipt> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        if !*gate.borrow() {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _ = gate.wait_for(|open| *open).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        // Let sibling publishes of the same page start before this one ends.
        tokio::task::yield_now().await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let body: serde_json::Value = serde_json::from_slice(payload)?;
        let record_id = body["id"].as_i64().unwrap_or_default();

        if self.fail_all.load(Ordering::SeqCst)
            || self.failing_calls.lock().contains(&call)
            || self.failing_records.lock().contains(&record_id)
        {
            return Err(RelayError::Bus(format!("injected failure on call {}", call)));
        }

        let mut published = self.published.lock();
        published.push(Published {
            topic: topic.to_string(),
            key: key.to_string(),
            record_id,
        });
        Ok(PublishReceipt {
            partition: 0,
            offset: published.len() as i64 - 1,
        })
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory record store.
pub struct MemoryStore {
    records: Mutex<Vec<ExceptionRecord>>,
    reads: AtomicUsize,
    mark_calls: AtomicUsize,
    drop_marks: AtomicBool,
    fail_marks: AtomicBool,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            mark_calls: AtomicUsize::new(0),
            drop_marks: AtomicBool::new(false),
            fail_marks: AtomicBool::new(false),
        }
    }

    /// Insert a pending record occurring `minute` minutes after a fixed base.
    pub fn add_at(&self, security_id: &str, minute: i64) -> i64 {
        let mut records = self.records.lock();
        let id = records.len() as i64 + 1;
        records.push(ExceptionRecord {
            id,
            service_name: SERVICE.to_string(),
            severity: Severity::High,
            message: format!("exception {}", id),
            occurred_at: base_time() + ChronoDuration::minutes(minute),
            security_id: security_id.to_string(),
            processed_at: None,
            stacktrace: None,
            correlation_id: Some(format!("corr-{}", id)),
        });
        id
    }

    /// Insert `count` pending records in occurrence order.
    pub fn add_many(&self, security_id: &str, count: usize) -> Vec<i64> {
        (0..count)
            .map(|i| self.add_at(security_id, i as i64))
            .collect()
    }

    /// Accept mark calls but persist nothing.
    pub fn drop_marks(&self) {
        self.drop_marks.store(true, Ordering::SeqCst);
    }

    pub fn fail_marks(&self) {
        self.fail_marks.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    pub fn is_processed(&self, id: i64) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.id == id && r.processed_at.is_some())
    }

    pub fn processed_at(&self, id: i64) -> Option<DateTime<Utc>> {
        self.records
            .lock()
            .iter()
            .find(|r| r.id == id)
            .and_then(|r| r.processed_at)
    }

    pub fn pending_for(&self, security_id: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.security_id == security_id && r.processed_at.is_none())
            .count()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn pending_page(
        &self,
        subject_key: &str,
        limit: usize,
    ) -> RelayResult<Vec<ExceptionRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut page: Vec<ExceptionRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.security_id == subject_key && r.processed_at.is_none())
            .cloned()
            .collect();
        page.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.id.cmp(&b.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn mark_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> RelayResult<usize> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected store failure".into()).into());
        }
        if self.drop_marks.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let ids: HashSet<i64> = ids.iter().copied().collect();
        let mut updated = 0;
        for record in self.records.lock().iter_mut() {
            if ids.contains(&record.id) && record.processed_at.is_none() {
                record.processed_at = Some(processed_at);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

// =============================================================================
// Rig
// =============================================================================

/// The relay core wired over the test doubles.
pub struct Rig {
    pub config: RelayConfig,
    pub stream: Arc<MockStream>,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<MockBus>,
    pub publisher: Arc<OutboxPublisher>,
    pub dispatcher: Arc<Dispatcher>,
    pub handler: Arc<EntryHandler>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Must be called inside a Tokio runtime.
    pub fn with_config(config: RelayConfig) -> Self {
        let stream = Arc::new(MockStream::with_group());
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MockBus::new());

        let publisher = Arc::new(OutboxPublisher::new(
            store.clone(),
            bus.clone(),
            config.topic.clone(),
            config.effective_page_size(),
        ));
        let pool = WorkerPool::new(config.worker.clone()).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            publisher.clone(),
            Arc::new(InFlightKeys::new()),
            pool,
            config.recheck_on_duplicate,
        ));
        let handler = Arc::new(EntryHandler::new(
            stream.clone(),
            dispatcher.clone(),
            config.subject_field.clone(),
        ));

        Self {
            config,
            stream,
            store,
            bus,
            publisher,
            dispatcher,
            handler,
        }
    }

    pub fn consumer(&self) -> StreamConsumer {
        StreamConsumer::new(
            self.stream.clone(),
            self.handler.clone(),
            self.config.read_count,
            self.config.block_timeout,
        )
    }

    pub fn reclaimer(&self) -> StaleReclaimer {
        StaleReclaimer::new(
            self.stream.clone(),
            self.handler.clone(),
            self.config.stale_after,
            self.config.reclaim_interval,
            self.config.reclaim_batch,
        )
    }

    /// A full relay over the same doubles, with its own pool and in-flight set.
    pub fn relay(&self) -> Relay {
        Relay::new(
            self.config.clone(),
            self.stream.clone(),
            self.store.clone(),
            self.bus.clone(),
        )
        .unwrap()
    }

    /// Read one batch and hand every entry to the handler, like one
    /// iteration of the consumer loop.
    pub async fn poll_once(&self) -> Vec<(String, crate::consumer::EntryDisposition)> {
        let entries = self
            .stream
            .read_group(self.config.read_count, self.config.block_timeout)
            .await
            .unwrap();
        let mut handled = Vec::new();
        for entry in &entries {
            handled.push((entry.id.clone(), self.handler.handle(entry).await));
        }
        handled
    }

    /// Wait until no publisher run is in flight.
    pub async fn settle(&self) {
        let in_flight = self.dispatcher.in_flight().clone();
        assert!(
            wait_until(Duration::from_secs(5), || in_flight.is_empty()).await,
            "runs did not finish"
        );
    }
}
