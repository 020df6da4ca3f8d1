//! Process-local set of subject keys with a publisher run in progress.
//!
//! This is a same-instance optimisation, not a distributed lock: two relay
//! instances can still run the same key concurrently, which the outbox's
//! processed marker tolerates.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Concurrent set of in-flight subject keys.
///
/// Each member carries a re-check flag, raised when a trigger for the key
/// arrives while its run is active.
#[derive(Debug, Default)]
pub struct InFlightKeys {
    keys: DashMap<String, AtomicBool>,
}

impl InFlightKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key` if absent. Returns `false` if it was already in flight, in
    /// which case the member's re-check flag is raised.
    pub fn try_acquire(&self, key: &str) -> bool {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().store(true, Ordering::SeqCst);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(AtomicBool::new(false));
                true
            }
        }
    }

    /// Release `key` unless a re-check was requested since the last call.
    ///
    /// Returns `true` if the key was released. When it returns `false` the
    /// flag has been cleared and the caller still owns the key; it must run
    /// another pass and call this again. Check and removal happen under the
    /// shard lock, so a concurrent [`try_acquire`](Self::try_acquire) either
    /// raises the flag before this runs or is admitted after it.
    pub fn release_unless_rechecked(&self, key: &str) -> bool {
        let removed = self
            .keys
            .remove_if(key, |_, recheck| !recheck.swap(false, Ordering::SeqCst))
            .is_some();
        if removed || !self.keys.contains_key(key) {
            return true;
        }
        debug!(subject_key = %key, "Re-check requested while in flight");
        false
    }

    /// Release `key` unconditionally.
    pub fn release(&self, key: &str) {
        self.keys.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Owns one in-flight key and releases it on drop.
///
/// Created before a run is handed to the worker pool and moved into the job,
/// so a rejected, aborted or panicking job still frees its key.
pub struct InFlightGuard {
    keys: Arc<InFlightKeys>,
    key: Option<String>,
}

impl InFlightGuard {
    /// Acquire `key`, or `None` if it is already in flight.
    pub fn acquire(keys: &Arc<InFlightKeys>, key: &str) -> Option<Self> {
        keys.try_acquire(key).then(|| Self {
            keys: keys.clone(),
            key: Some(key.to_string()),
        })
    }

    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    /// Try to release the key at the end of a successful pass; see
    /// [`InFlightKeys::release_unless_rechecked`]. Returns `true` if released.
    pub fn finish_pass(&mut self) -> bool {
        let Some(key) = self.key.as_deref() else {
            return true;
        };
        if self.keys.release_unless_rechecked(key) {
            self.key = None;
            true
        } else {
            false
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.keys.release(&key);
        }
    }
}
