//! Bounded worker pool for publisher runs.
//!
//! Core workers are started with the pool and pull jobs from a bounded
//! queue. When the queue is full the pool grows with elastic workers up to
//! `max_size`; past that, submission fails immediately instead of waiting.
//! Elastic workers exit after `keep_alive` without work.

use crate::error::{RelayError, RelayResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type Job = BoxFuture<'static, ()>;

/// Sizing for [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Workers started with the pool and kept for its lifetime
    pub core_size: usize,
    /// Upper bound on live workers, core included
    pub max_size: usize,
    /// Jobs that may wait for a worker
    pub queue_capacity: usize,
    /// Idle time after which an elastic worker exits
    pub keep_alive: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 4,
            max_size: 4,
            queue_capacity: 200,
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.core_size == 0 {
            return Err(RelayError::Config("worker core size must be at least 1".into()));
        }
        if self.max_size < self.core_size {
            return Err(RelayError::Config(format!(
                "worker max size ({}) must be >= core size ({})",
                self.max_size, self.core_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("worker queue capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Why a job was not accepted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue full and every worker slot taken
    #[error("task queue full; applying backpressure")]
    Rejected,
    /// The pool no longer accepts work
    #[error("worker pool is shut down")]
    ShutDown,
}

struct PoolInner {
    config: WorkerPoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    live: AtomicUsize,
    active: AtomicUsize,
    tasks: Mutex<JoinSet<()>>,
}

/// Bounded pool of tokio tasks executing boxed jobs.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create the pool and start its core workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> RelayResult<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let pool = Self {
            inner: Arc::new(PoolInner {
                sender: Mutex::new(Some(tx)),
                receiver: Arc::new(tokio::sync::Mutex::new(rx)),
                live: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                tasks: Mutex::new(JoinSet::new()),
                config,
            }),
        };

        for worker in 0..pool.inner.config.core_size {
            pool.inner.live.fetch_add(1, Ordering::SeqCst);
            let inner = pool.inner.clone();
            pool.inner
                .tasks
                .lock()
                .spawn(async move { core_worker(inner, worker).await });
        }

        info!(
            core_size = pool.inner.config.core_size,
            max_size = pool.inner.config.max_size,
            queue_capacity = pool.inner.config.queue_capacity,
            "Worker pool started"
        );

        Ok(pool)
    }

    /// Hand a job to the pool without waiting.
    pub fn submit<F>(&self, job: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.inner.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(SubmitError::ShutDown);
        };

        match sender.try_send(job.boxed()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SubmitError::ShutDown),
            Err(TrySendError::Full(job)) => {
                let max = self.inner.config.max_size;
                let reserved = self
                    .inner
                    .live
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_ok();
                if !reserved {
                    return Err(SubmitError::Rejected);
                }

                let inner = self.inner.clone();
                let mut tasks = self.inner.tasks.lock();
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move { elastic_worker(inner, job).await });
                debug!(live = self.live_workers(), "Spawned elastic worker");
                Ok(())
            }
        }
    }

    /// Workers currently alive, core and elastic.
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the queue.
    pub fn queued_jobs(&self) -> usize {
        match self.inner.sender.lock().as_ref() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Stop accepting work, let queued and running jobs finish for up to
    /// `grace`, then abort whatever is left.
    ///
    /// Returns `true` if everything finished within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        drop(self.inner.sender.lock().take());
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            info!("Worker pool drained");
        } else {
            warn!(
                remaining = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Worker pool grace period expired, aborting remaining jobs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        drained
    }
}

async fn next_job(receiver: &tokio::sync::Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    receiver.lock().await.recv().await
}

async fn run_job(inner: &PoolInner, job: Job) {
    inner.active.fetch_add(1, Ordering::SeqCst);
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("Worker job panicked");
    }
    inner.active.fetch_sub(1, Ordering::SeqCst);
}

async fn core_worker(inner: Arc<PoolInner>, worker: usize) {
    let receiver = inner.receiver.clone();
    while let Some(job) = next_job(&receiver).await {
        run_job(&inner, job).await;
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
    debug!(worker, "Core worker stopped");
}

async fn elastic_worker(inner: Arc<PoolInner>, first: Job) {
    run_job(&inner, first).await;

    let receiver = inner.receiver.clone();
    let keep_alive = inner.config.keep_alive;
    loop {
        match tokio::time::timeout(keep_alive, next_job(&receiver)).await {
            Ok(Some(job)) => run_job(&inner, job).await,
            Ok(None) => break,
            Err(_) => {
                debug!("Elastic worker idle, exiting");
                break;
            }
        }
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
}
