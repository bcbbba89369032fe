//! Persistence capabilities the tally passes depend on.
//!
//! Postgres implementations live in [`crate::services::database`], in-memory
//! ones in [`crate::services::memory`].

use crate::models::{Event, Granularity, Host, HostFacts, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use service_core::error::AppError;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Upstream inventory facts.
///
/// Both streams are sorted ascending, byte-wise, with nulls last: facts by
/// [`SortKey`](crate::correlator::SortKey), hypervisor ids by value.
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Systems that will be tallied, for the per-org threshold check.
    async fn active_system_count(
        &self,
        org_id: &str,
        culled_offset_days: i64,
    ) -> Result<i64, AppError>;

    fn stream_facts(
        &self,
        org_id: &str,
        culled_offset_days: i64,
    ) -> BoxStream<'_, Result<HostFacts, AppError>>;

    /// Subscription manager ids of active systems.
    fn stream_active_hypervisor_ids(
        &self,
        org_id: &str,
        culled_offset_days: i64,
    ) -> BoxStream<'_, Result<String, AppError>>;

    async fn org_ids_with_facts(&self) -> Result<Vec<String>, AppError>;
}

#[async_trait]
pub trait HostStore: Send + Sync {
    /// Hosts owned by the nightly tally, in correlation order.
    fn stream_hbi_hosts(&self, org_id: &str) -> BoxStream<'_, Result<Host, AppError>>;

    async fn find_by_instance_ids(
        &self,
        org_id: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Host>, AppError>;

    async fn find_by_org(&self, org_id: &str) -> Result<Vec<Host>, AppError>;

    /// Insert or replace by host id.
    async fn save_all(&self, hosts: &[Host]) -> Result<(), AppError>;

    async fn delete_all(&self, host_ids: &[Uuid]) -> Result<(), AppError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Snapshots with `start <= snapshot_date <= end`.
    async fn find_snapshots(
        &self,
        org_id: &str,
        product_ids: &BTreeSet<String>,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, AppError>;

    /// Upsert by natural key, all or nothing.
    async fn save_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), AppError>;

    async fn delete_snapshots_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store events, ignoring ids already present. Returns how many were new.
    async fn save_events(&self, events: &[Event]) -> Result<usize, AppError>;

    /// Events recorded after `after`, ordered by timestamp then record date.
    async fn find_events_recorded_after(
        &self,
        org_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, AppError>;

    async fn org_ids_with_events(&self) -> Result<Vec<String>, AppError>;

    /// Record date of the newest event folded into the org's hourly snapshots.
    async fn last_event_applied(&self, org_id: &str) -> Result<Option<DateTime<Utc>>, AppError>;

    async fn set_last_event_applied(
        &self,
        org_id: &str,
        record_date: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

/// Every store a tally pass needs, bundled for wiring.
#[derive(Clone)]
pub struct Stores {
    pub facts: std::sync::Arc<dyn FactSource>,
    pub hosts: std::sync::Arc<dyn HostStore>,
    pub snapshots: std::sync::Arc<dyn SnapshotStore>,
    pub events: std::sync::Arc<dyn EventStore>,
}
