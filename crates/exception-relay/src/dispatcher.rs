//! Dedup gate in front of the worker pool.
//!
//! At most one publisher run per subject key is active in this process. A
//! trigger for a key that is already running is skipped; when re-checks are
//! enabled the running job does one more pass before giving the key up, so
//! records written during its tail are not stranded.

use crate::error::{RelayError, RelayResult};
use crate::in_flight::{InFlightGuard, InFlightKeys};
use crate::publisher::{OutboxPublisher, PublishSummary};
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What happened to a dispatch request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A run was queued; its result arrives through the handle.
    Submitted(RunHandle),
    /// A run for the key is already in flight.
    Skipped,
    /// The worker pool refused the run.
    Rejected,
}

/// Completion of a submitted publisher run.
#[derive(Debug)]
pub struct RunHandle {
    subject_key: String,
    result: oneshot::Receiver<RelayResult<PublishSummary>>,
}

impl RunHandle {
    pub fn subject_key(&self) -> &str {
        &self.subject_key
    }

    /// Wait for the run. A run dropped before reporting (pool shutdown, panic)
    /// resolves to [`RelayError::RunAbandoned`].
    pub async fn wait(self) -> RelayResult<PublishSummary> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::RunAbandoned(self.subject_key)),
        }
    }
}

/// Admits publisher runs through the in-flight set onto the worker pool.
pub struct Dispatcher {
    publisher: Arc<OutboxPublisher>,
    in_flight: Arc<InFlightKeys>,
    pool: WorkerPool,
    recheck_on_duplicate: bool,
}

impl Dispatcher {
    pub fn new(
        publisher: Arc<OutboxPublisher>,
        in_flight: Arc<InFlightKeys>,
        pool: WorkerPool,
        recheck_on_duplicate: bool,
    ) -> Self {
        Self {
            publisher,
            in_flight,
            pool,
            recheck_on_duplicate,
        }
    }

    /// Start a publisher run for `subject_key` unless one is in flight.
    ///
    /// Never blocks: a saturated pool yields [`DispatchOutcome::Rejected`] and
    /// the key is released before this returns.
    pub fn dispatch(&self, subject_key: &str) -> DispatchOutcome {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, subject_key) else {
            debug!(subject_key = %subject_key, "Run already in flight, skipping");
            return DispatchOutcome::Skipped;
        };

        let (tx, rx) = oneshot::channel();
        let publisher = self.publisher.clone();
        let recheck = self.recheck_on_duplicate;
        let job = async move {
            let result = run_passes(&publisher, guard, recheck).await;
            let _ = tx.send(result);
        };

        match self.pool.submit(job) {
            Ok(()) => DispatchOutcome::Submitted(RunHandle {
                subject_key: subject_key.to_string(),
                result: rx,
            }),
            Err(e) => {
                warn!(subject_key = %subject_key, error = %e, "Dispatch rejected");
                DispatchOutcome::Rejected
            }
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlightKeys> {
        &self.in_flight
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// Publish until no re-check is pending. The guard releases the key on every
/// exit path, including errors.
async fn run_passes(
    publisher: &OutboxPublisher,
    mut guard: InFlightGuard,
    recheck: bool,
) -> RelayResult<PublishSummary> {
    let subject_key = guard.key().to_string();
    let mut summary = publisher.publish_all(&subject_key).await?;

    while recheck && !guard.finish_pass() {
        debug!(subject_key = %subject_key, "Trigger arrived during run, publishing again");
        summary.absorb(publisher.publish_all(&subject_key).await?);
    }
    Ok(summary)
}
