//! Wiring and lifecycle of a relay instance.
//!
//! ```text
//!          +-------------------+      dispatch      +------------+
//! stream ->| StreamConsumer    |------------------->| Dispatcher |--> WorkerPool --> OutboxPublisher
//!          +-------------------+        ^           +------------+        |
//!          | StaleReclaimer    |--------'                                 v
//!          +-------------------+                               store + message bus
//! ```

use crate::bootstrap::ensure_stream_and_group;
use crate::bus::MessageBus;
use crate::config::RelayConfig;
use crate::consumer::{EntryHandler, StreamConsumer};
use crate::dispatcher::Dispatcher;
use crate::error::RelayResult;
use crate::in_flight::InFlightKeys;
use crate::publisher::OutboxPublisher;
use crate::reclaimer::StaleReclaimer;
use crate::store::RecordStore;
use crate::stream::{GroupStatus, StreamBackend};
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Minimum time shutdown gives outstanding acks, even when the grace period
/// was used up by running jobs.
const ACK_DRAIN_FLOOR: Duration = Duration::from_millis(500);

/// Lifecycle of a started relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Running,
    Stopping,
    Stopped,
}

/// A fully wired, not yet started relay.
pub struct Relay {
    stream: Arc<dyn StreamBackend>,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<EntryHandler>,
    consumer: StreamConsumer,
    reclaimer: StaleReclaimer,
    shutdown_grace: Duration,
}

impl Relay {
    /// Build the publisher, dedup gate, worker pool, consumer and reclaimer.
    ///
    /// Must be called from within a Tokio runtime (the pool starts its core
    /// workers here).
    pub fn new(
        config: RelayConfig,
        stream: Arc<dyn StreamBackend>,
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn MessageBus>,
    ) -> RelayResult<Self> {
        config.validate()?;

        let publisher = Arc::new(OutboxPublisher::new(
            store,
            bus,
            config.topic.clone(),
            config.effective_page_size(),
        ));
        let pool = WorkerPool::new(config.worker.clone())?;
        let dispatcher = Arc::new(Dispatcher::new(
            publisher,
            Arc::new(InFlightKeys::new()),
            pool,
            config.recheck_on_duplicate,
        ));
        let handler = Arc::new(EntryHandler::new(
            stream.clone(),
            dispatcher.clone(),
            config.subject_field.clone(),
        ));

        let consumer = StreamConsumer::new(
            stream.clone(),
            handler.clone(),
            config.read_count,
            config.block_timeout,
        );
        let reclaimer = StaleReclaimer::new(
            stream.clone(),
            handler.clone(),
            config.stale_after,
            config.reclaim_interval,
            config.reclaim_batch,
        );

        Ok(Self {
            stream,
            dispatcher,
            handler,
            consumer,
            reclaimer,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Ensure the stream and consumer group exist.
    pub async fn bootstrap(&self) -> RelayResult<GroupStatus> {
        ensure_stream_and_group(self.stream.as_ref()).await
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Spawn the consumer loop and the reclaimer.
    pub fn start(self) -> RelayHandle {
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(RelayState::Running);

        let consumer = self.consumer;
        let token = cancel.clone();
        let consumer_task = tokio::spawn(async move { consumer.run(token).await });

        let reclaimer = self.reclaimer;
        let token = cancel.clone();
        let reclaimer_task = tokio::spawn(async move { reclaimer.run(token).await });

        info!(stream = %self.stream.stream_name(), "Relay started");

        RelayHandle {
            cancel,
            state,
            consumer_task,
            reclaimer_task,
            dispatcher: self.dispatcher,
            handler: self.handler,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Handle to a running relay.
pub struct RelayHandle {
    cancel: CancellationToken,
    state: watch::Sender<RelayState>,
    consumer_task: JoinHandle<()>,
    reclaimer_task: JoinHandle<()>,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<EntryHandler>,
    shutdown_grace: Duration,
}

impl RelayHandle {
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop polling and reclaiming, give running publisher runs the grace
    /// period, then abort whatever is left.
    ///
    /// Acks of runs that finished are awaited before this returns. Aborted
    /// runs keep the pages they already committed; their triggering entries
    /// stay pending for the next instance to reclaim.
    pub async fn shutdown(self) {
        info!(grace_ms = self.shutdown_grace.as_millis() as u64, "Relay shutting down");
        self.state.send_replace(RelayState::Stopping);
        self.cancel.cancel();

        let deadline = Instant::now() + self.shutdown_grace;
        let consumer_abort = self.consumer_task.abort_handle();
        let reclaimer_abort = self.reclaimer_task.abort_handle();
        let loops = async {
            let _ = self.consumer_task.await;
            let _ = self.reclaimer_task.await;
        };
        if tokio::time::timeout_at(deadline, loops).await.is_err() {
            warn!("Consumer loops did not stop within grace period, aborting");
            consumer_abort.abort();
            reclaimer_abort.abort();
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = self.dispatcher.pool().shutdown(remaining).await;

        // Runs that finished still owe their ack; abandoned ones resolve at once.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let acked = self.handler.drain_acks(remaining.max(ACK_DRAIN_FLOOR)).await;

        self.state.send_replace(RelayState::Stopped);
        info!(drained, acked, "Relay stopped");
    }
}
