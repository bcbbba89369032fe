//! Host reconciliation: nightly inventory facts and metric events.

pub mod event;
pub mod host;

pub use event::{EventHostBatch, EventOutcome, EventReconciler};
pub use host::{tally_buckets, usage_keys, HostReconcileStats, HostReconciler};
