//! In-memory stores, used when no database is configured and by tests.

use crate::correlator::SortKey;
use crate::models::{Event, Granularity, Host, HostFacts, Snapshot, SnapshotKey, HBI_HOST};
use crate::services::store::{EventStore, FactSource, HostStore, SnapshotStore, Stores};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use service_core::error::AppError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    facts: DashMap<String, Vec<HostFacts>>,
    hosts: DashMap<Uuid, Host>,
    snapshots: DashMap<SnapshotKey, Snapshot>,
    events: DashMap<Uuid, Event>,
    last_event_applied: DashMap<String, DateTime<Utc>>,
    fail_snapshot_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The same store behind every capability.
    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores {
            facts: self.clone(),
            hosts: self.clone(),
            snapshots: self.clone(),
            events: self.clone(),
        }
    }

    /// Replace the org's inventory facts.
    pub fn set_facts(&self, org_id: &str, facts: Vec<HostFacts>) {
        self.facts.insert(org_id.to_string(), facts);
    }

    pub fn all_hosts(&self, org_id: &str) -> Vec<Host> {
        let mut hosts: Vec<Host> = self
            .hosts
            .iter()
            .filter(|entry| entry.org_id == org_id)
            .map(|entry| entry.value().clone())
            .collect();
        hosts.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        hosts
    }

    pub fn snapshot(&self, key: &SnapshotKey) -> Option<Snapshot> {
        self.snapshots.get(key).map(|s| s.value().clone())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Make every subsequent snapshot save fail with a transient error.
    pub fn fail_snapshot_saves(&self, fail: bool) {
        self.fail_snapshot_saves.store(fail, Ordering::SeqCst);
    }

    fn org_facts(&self, org_id: &str) -> Vec<HostFacts> {
        self.facts
            .get(org_id)
            .map(|facts| facts.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FactSource for MemoryStore {
    async fn active_system_count(
        &self,
        org_id: &str,
        _culled_offset_days: i64,
    ) -> Result<i64, AppError> {
        Ok(self.facts.get(org_id).map_or(0, |facts| facts.len() as i64))
    }

    fn stream_facts(
        &self,
        org_id: &str,
        _culled_offset_days: i64,
    ) -> BoxStream<'_, Result<HostFacts, AppError>> {
        let mut facts = self.org_facts(org_id);
        facts.sort_by_key(SortKey::from_facts);
        stream::iter(facts.into_iter().map(Ok)).boxed()
    }

    fn stream_active_hypervisor_ids(
        &self,
        org_id: &str,
        _culled_offset_days: i64,
    ) -> BoxStream<'_, Result<String, AppError>> {
        let ids: BTreeSet<String> = self
            .org_facts(org_id)
            .into_iter()
            .filter_map(|f| f.subscription_manager_id)
            .collect();
        stream::iter(ids.into_iter().map(Ok)).boxed()
    }

    async fn org_ids_with_facts(&self) -> Result<Vec<String>, AppError> {
        let mut orgs: Vec<String> = self.facts.iter().map(|e| e.key().clone()).collect();
        orgs.sort();
        Ok(orgs)
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    fn stream_hbi_hosts(&self, org_id: &str) -> BoxStream<'_, Result<Host, AppError>> {
        let mut hosts: Vec<Host> = self
            .all_hosts(org_id)
            .into_iter()
            .filter(|h| h.instance_type == HBI_HOST)
            .collect();
        hosts.sort_by_key(SortKey::from_host);
        stream::iter(hosts.into_iter().map(Ok)).boxed()
    }

    async fn find_by_instance_ids(
        &self,
        org_id: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Host>, AppError> {
        Ok(self
            .all_hosts(org_id)
            .into_iter()
            .filter(|h| instance_ids.contains(&h.instance_id))
            .collect())
    }

    async fn find_by_org(&self, org_id: &str) -> Result<Vec<Host>, AppError> {
        Ok(self.all_hosts(org_id))
    }

    async fn save_all(&self, hosts: &[Host]) -> Result<(), AppError> {
        for host in hosts {
            self.hosts.insert(host.id, host.clone());
        }
        Ok(())
    }

    async fn delete_all(&self, host_ids: &[Uuid]) -> Result<(), AppError> {
        for id in host_ids {
            self.hosts.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn find_snapshots(
        &self,
        org_id: &str,
        product_ids: &BTreeSet<String>,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, AppError> {
        let mut found: Vec<Snapshot> = self
            .snapshots
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.org_id == org_id
                    && key.granularity == granularity
                    && product_ids.contains(&key.product_id)
                    && key.snapshot_date >= start
                    && key.snapshot_date <= end
            })
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn save_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), AppError> {
        if self.fail_snapshot_saves.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Snapshot store unavailable"
            )));
        }
        for snapshot in snapshots {
            let mut stored = snapshot.clone();
            if let Some(existing) = self.snapshots.get(&snapshot.key) {
                stored.id = existing.id;
            }
            self.snapshots.insert(snapshot.key.clone(), stored);
        }
        Ok(())
    }

    async fn delete_snapshots_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let before = self.snapshots.len();
        self.snapshots
            .retain(|key, _| key.granularity != granularity || key.snapshot_date >= cutoff);
        Ok((before - self.snapshots.len()) as u64)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save_events(&self, events: &[Event]) -> Result<usize, AppError> {
        let mut inserted = 0;
        for event in events {
            if !self.events.contains_key(&event.event_id) {
                self.events.insert(event.event_id, event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn find_events_recorded_after(
        &self,
        org_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>, AppError> {
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|e| e.org_id == org_id && after.is_none_or(|after| e.record_date > after))
            .map(|e| e.value().clone())
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.record_date.cmp(&b.record_date))
        });
        Ok(events)
    }

    async fn org_ids_with_events(&self) -> Result<Vec<String>, AppError> {
        let orgs: BTreeSet<String> = self.events.iter().map(|e| e.org_id.clone()).collect();
        Ok(orgs.into_iter().collect())
    }

    async fn last_event_applied(&self, org_id: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self.last_event_applied.get(org_id).map(|d| *d.value()))
    }

    async fn set_last_event_applied(
        &self,
        org_id: &str,
        record_date: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.last_event_applied
            .entry(org_id.to_string())
            .and_modify(|current| {
                if record_date > *current {
                    *current = record_date;
                }
            })
            .or_insert(record_date);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageKey;
    use chrono::TimeZone;

    fn snapshot(date: DateTime<Utc>) -> Snapshot {
        Snapshot::new(SnapshotKey::for_usage(
            "org1",
            &UsageKey::any("RHEL for x86"),
            Granularity::Hourly,
            date,
        ))
    }

    #[tokio::test]
    async fn snapshot_upsert_keeps_the_first_id() {
        let store = MemoryStore::new();
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = snapshot(date);
        store.save_snapshots(&[first.clone()]).await.unwrap();
        store.save_snapshots(&[snapshot(date)]).await.unwrap();
        assert_eq!(store.snapshot_count(), 1);
        assert_eq!(store.snapshot(&first.key).unwrap().id, first.id);
    }

    #[tokio::test]
    async fn retention_only_touches_one_granularity() {
        let store = MemoryStore::new();
        let old = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let mut daily = snapshot(old);
        daily.key.granularity = Granularity::Daily;
        store.save_snapshots(&[snapshot(old), daily]).await.unwrap();

        let removed = store
            .delete_snapshots_before(Granularity::Hourly, old + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn tally_state_only_moves_forward() {
        let store = MemoryStore::new();
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        store.set_last_event_applied("org1", late).await.unwrap();
        store.set_last_event_applied("org1", early).await.unwrap();
        assert_eq!(store.last_event_applied("org1").await.unwrap(), Some(late));
    }
}
