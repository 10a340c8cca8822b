//! Durable state of the queue.
//!
//! - [`Snapshot`]: the stack and pool as one JSON file, rewritten every
//!   keeper tick and used for crash recovery
//! - [`JobDb`]: a SQLite job record store with an explicit order index,
//!   independent of the snapshot

pub mod jobdb;
pub mod snapshot;

pub use jobdb::JobDb;
pub use snapshot::Snapshot;
