//! Integration tests for the exception relay core.
//!
//! - `harness.rs`      - mock stream, mock bus, in-memory store and a wired rig
//! - `poison.rs`       - entries without a subject key
//! - `publish.rs`      - paging, atomicity and ordering of publisher runs
//! - `dedup.rs`        - one run per subject key, re-check on duplicate triggers
//! - `reclaim.rs`      - stale pending-entry recovery
//! - `backpressure.rs` - saturated worker pool
//! - `scenarios.rs`    - end-to-end flows through the consumer loop
//! - `lifecycle.rs`    - bootstrap, read failures and shutdown

pub(crate) mod harness;

#[allow(unused_imports)]
pub use harness::{MemoryStore, MockBus, MockStream, Rig};
