//! SQLite persistence for exception records awaiting relay.
//!
//! Records are written by upstream services and stay pending until the relay
//! stamps `processed_at`. This crate owns:
//! - The `exception_record` schema and its migrations
//! - Plain query functions over a `rusqlite::Connection`
//! - [`ExceptionStore`], an async handle running every statement on one thread

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{StoreError, StoreResult};
pub use executor::ExceptionStore;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
