//! Stream consumer loop and per-entry handling.
//!
//! Acknowledgement rules:
//!
//! | Entry                        | Ack?                          |
//! |------------------------------|-------------------------------|
//! | no subject key (poison)      | immediately                   |
//! | key already in flight        | immediately                   |
//! | run submitted                | when the run succeeds         |
//! | pool rejected the run        | no, the reclaimer retries it  |
//! | run failed or was abandoned  | no, the reclaimer retries it  |

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::stream::{StreamBackend, StreamEntry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What [`EntryHandler::handle`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDisposition {
    /// Missing subject key; acknowledged and dropped
    Dropped,
    /// Key already in flight; acknowledged
    Skipped,
    /// Run submitted; acknowledged once it succeeds
    Submitted,
    /// Pool saturated; left pending
    Rejected,
}

/// Handling shared by fresh and reclaimed entries.
///
/// Submitted runs are awaited by tasks tracked here, so shutdown can let
/// their acks land before the process exits.
pub struct EntryHandler {
    stream: Arc<dyn StreamBackend>,
    dispatcher: Arc<Dispatcher>,
    subject_field: String,
    ack_waiters: Mutex<JoinSet<()>>,
}

impl EntryHandler {
    pub fn new(
        stream: Arc<dyn StreamBackend>,
        dispatcher: Arc<Dispatcher>,
        subject_field: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            dispatcher,
            subject_field: subject_field.into(),
            ack_waiters: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn handle(&self, entry: &StreamEntry) -> EntryDisposition {
        let Some(subject_key) = entry.non_blank(&self.subject_field) else {
            warn!(
                entry_id = %entry.id,
                field = %self.subject_field,
                "Entry missing subject key, dropping"
            );
            ack_entry(self.stream.as_ref(), &entry.id).await;
            return EntryDisposition::Dropped;
        };

        match self.dispatcher.dispatch(subject_key) {
            DispatchOutcome::Skipped => {
                ack_entry(self.stream.as_ref(), &entry.id).await;
                EntryDisposition::Skipped
            }
            DispatchOutcome::Rejected => {
                warn!(
                    entry_id = %entry.id,
                    subject_key = %subject_key,
                    "Worker pool saturated, leaving entry pending"
                );
                EntryDisposition::Rejected
            }
            DispatchOutcome::Submitted(run) => {
                let stream = self.stream.clone();
                let entry_id = entry.id.clone();
                let ack = async move {
                    let subject_key = run.subject_key().to_string();
                    match run.wait().await {
                        Ok(_) => ack_entry(stream.as_ref(), &entry_id).await,
                        Err(e) => error!(
                            entry_id = %entry_id,
                            subject_key = %subject_key,
                            error = %e,
                            "Publisher run failed, leaving entry pending"
                        ),
                    }
                };
                let mut waiters = self.ack_waiters.lock();
                while waiters.try_join_next().is_some() {}
                waiters.spawn(ack);
                drop(waiters);
                EntryDisposition::Submitted
            }
        }
    }

    /// Wait up to `grace` for outstanding runs to resolve and their acks to
    /// land, then abort the remaining waiters. Returns `true` if all resolved.
    pub async fn drain_acks(&self, grace: Duration) -> bool {
        let mut waiters = std::mem::take(&mut *self.ack_waiters.lock());
        let drained = tokio::time::timeout(grace, async {
            while waiters.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(remaining = waiters.len(), "Ack waiters still pending at shutdown");
            waiters.abort_all();
        }
        drained
    }
}

/// Acknowledge, logging instead of propagating failures. An entry whose ack
/// is lost stays pending and is picked up by the reclaimer.
async fn ack_entry(stream: &dyn StreamBackend, entry_id: &str) {
    if let Err(e) = stream.ack(entry_id).await {
        warn!(entry_id = %entry_id, error = %e, "Failed to acknowledge entry");
    }
}

/// Long-running XREADGROUP loop for one consumer identity.
pub struct StreamConsumer {
    stream: Arc<dyn StreamBackend>,
    handler: Arc<EntryHandler>,
    read_count: usize,
    block_timeout: Duration,
}

impl StreamConsumer {
    pub fn new(
        stream: Arc<dyn StreamBackend>,
        handler: Arc<EntryHandler>,
        read_count: usize,
        block_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            handler,
            read_count,
            block_timeout,
        }
    }

    /// Poll until `cancel` fires.
    ///
    /// The read is the loop's only suspension point and is raced against
    /// cancellation, so shutdown is observed within one poll cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            stream = %self.stream.stream_name(),
            read_count = self.read_count,
            block_ms = self.block_timeout.as_millis() as u64,
            "Starting stream consumer loop"
        );

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = self.stream.read_group(self.read_count, self.block_timeout) => read,
            };

            match read {
                Ok(entries) if entries.is_empty() => {
                    debug!("No entries available, polling again");
                }
                Ok(entries) => {
                    for entry in &entries {
                        let disposition = self.handler.handle(entry).await;
                        debug!(entry_id = %entry.id, ?disposition, "Handled entry");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Stream read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.block_timeout) => {}
                    }
                    if e.is_connection_error() {
                        if let Err(e) = self.stream.reconnect().await {
                            error!(error = %e, "Failed to reconnect to stream");
                        }
                    }
                }
            }
        }

        info!("Stream consumer stopped");
    }
}
