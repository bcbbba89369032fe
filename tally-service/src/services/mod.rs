//! Services module for tally-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod publisher;
pub mod store;

pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_event, record_publish_attempt,
    record_skipped_fact, record_snapshots_written, record_tally_pass,
};
pub use publisher::{HttpPublisher, LoggingPublisher, SnapshotPublisher, TallySummary};
pub use store::{EventStore, FactSource, HostStore, SnapshotStore, Stores};
