//! Exception relay: moves pending exception records to a message bus.
//!
//! Upstream services write exception records to the store and append a
//! notification carrying the record's subject key to a Redis stream. The
//! relay reads those notifications through a consumer group, publishes
//! every pending record for the key, and stamps them processed.
//!
//! # Delivery guarantees
//!
//! 1. **At-least-once**: a record is marked processed only after the bus
//!    accepted every record of its page
//! 2. **Ack after success**: a notification is acknowledged only when its run
//!    succeeded, its key was already in flight, or it carried no key
//! 3. **No lost triggers**: entries left pending (rejected, failed, crashed)
//!    are reclaimed once idle and handled again
//! 4. **One run per key per instance**: duplicate triggers are folded into
//!    the run already in flight
//!
//! # Architecture
//!
//! ```text
//! Redis Stream --XREADGROUP--> StreamConsumer --> Dispatcher --> WorkerPool
//!      ^    ^                                                       |
//!      |    '--XCLAIM-- StaleReclaimer                              v
//!      '-------XACK <------------------------------------ OutboxPublisher
//!                                                          |          |
//!                                                     SQLite store  Kafka
//! ```

pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod in_flight;
#[cfg(feature = "kafka")]
pub mod kafka_bus;
pub mod publisher;
pub mod reclaimer;
pub mod redis_stream;
pub mod relay;
pub mod store;
pub mod stream;
pub mod worker_pool;

#[cfg(test)]
mod tests;

pub use bootstrap::ensure_stream_and_group;
pub use bus::{MessageBus, OutboundMessage, PublishReceipt};
pub use config::RelayConfig;
pub use consumer::{EntryDisposition, EntryHandler, StreamConsumer};
pub use dispatcher::{DispatchOutcome, Dispatcher, RunHandle};
pub use error::{RelayError, RelayResult};
pub use in_flight::InFlightKeys;
#[cfg(feature = "kafka")]
pub use kafka_bus::KafkaBus;
pub use publisher::{OutboxPublisher, PublishSummary};
pub use reclaimer::{ReclaimReport, StaleReclaimer};
pub use redis_stream::RedisStream;
pub use relay::{Relay, RelayHandle, RelayState};
pub use store::RecordStore;
pub use stream::{GroupStatus, PendingEntry, StreamBackend, StreamEntry};
pub use worker_pool::{SubmitError, WorkerPool, WorkerPoolConfig};
