//! SQLite persistence for outgoing events.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Database migrations
//! - The `PendingEventRecord` row model
//! - `PendingEventStore`: the transactional store the send queue writes through
//!
//! # Architecture
//!
//! The `AsyncDatabase` uses a single dedicated thread for all SQLite operations.
//! Queries are sent through a channel and executed in FIFO order. Rooms share
//! one database; their transactions are serialized by that thread.
//!
//! ```ignore
//! let store = PendingEventStore::open(&paths.database_file()).await?;
//! let rows = store.read_txn(|txn| txn.get_room("!room:example.org")).await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside a transaction body.
//! Encryption and network calls must happen outside.

mod error;
mod executor;
mod migrations;
mod models;
mod store;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::PendingEventRecord;
pub use store::{PendingEventStore, PendingEventsTxn};
