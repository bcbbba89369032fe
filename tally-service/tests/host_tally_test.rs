//! Nightly host tally against in-memory stores.

mod common;

use async_trait::async_trait;
use chrono::NaiveDate;
use common::*;
use service_core::retry::RetryConfig;
use std::sync::Arc;
use tally_service::clock::ApplicationClock;
use tally_service::config::TallySettings;
use tally_service::controller::HostTallyService;
use tally_service::enrichment::{
    CloudigradeEnricher, ConcurrencyReport, ConcurrencyReportSource, DailyConcurrency, UsageCount,
};
use tally_service::error::TallyError;
use tally_service::models::{Granularity, HardwareMeasurementType, MetricId, SnapshotKey};
use tally_service::services::MemoryStore;

fn daily_cores(store: &MemoryStore, measurement_type: HardwareMeasurementType) -> Option<f64> {
    stored(
        store,
        &rhel_key(),
        Granularity::Daily,
        today(),
        measurement_type,
        &MetricId::cores(),
    )
}

#[tokio::test]
async fn physical_system_lands_in_daily_and_coarser_snapshots() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 4)]);
    let publisher = Arc::new(RecordingPublisher::default());

    let report = host_tally(&store, TallySettings::default(), publisher.clone())
        .tally_org(ORG_ID)
        .await
        .expect("tally failed");

    assert_eq!(report.hosts.created, 1);
    assert_eq!(report.owner_id.as_deref(), Some("owner-1"));
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Physical), Some(4.0));
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Total), Some(4.0));

    let month_start = ApplicationClock::start_of_month(now());
    assert_eq!(
        stored(
            &store,
            &rhel_key(),
            Granularity::Monthly,
            month_start,
            HardwareMeasurementType::Total,
            &MetricId::cores(),
        ),
        Some(4.0)
    );
    assert_eq!(publisher.batches(), 1);
}

#[tokio::test]
async fn guest_of_unknown_hypervisor_counts_as_virtual() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![guest_facts("guest-1", "not-reported", 2)]);

    host_tally(&store, TallySettings::default(), Arc::new(RecordingPublisher::default()))
        .tally_org(ORG_ID)
        .await
        .expect("tally failed");

    assert_eq!(daily_cores(&store, HardwareMeasurementType::Virtual), Some(2.0));
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Physical), None);

    let hosts = store.all_hosts(ORG_ID);
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].is_unmapped_guest);
}

#[tokio::test]
async fn hypervisor_counts_once_for_its_mapped_guests() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(
        ORG_ID,
        vec![
            rhel_facts("hyp", 16),
            guest_facts("guest-1", "sm-hyp", 2),
            guest_facts("guest-2", "sm-hyp", 2),
        ],
    );

    host_tally(&store, TallySettings::default(), Arc::new(RecordingPublisher::default()))
        .tally_org(ORG_ID)
        .await
        .expect("tally failed");

    assert_eq!(daily_cores(&store, HardwareMeasurementType::Hypervisor), Some(16.0));
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Virtual), None);
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Physical), None);
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Total), Some(16.0));

    let hypervisor = store
        .all_hosts(ORG_ID)
        .into_iter()
        .find(|h| h.subscription_manager_id.as_deref() == Some("sm-hyp"))
        .expect("hypervisor host");
    assert!(hypervisor.is_hypervisor);
    assert_eq!(hypervisor.num_of_guests, Some(2));
}

#[tokio::test]
async fn org_over_the_fact_threshold_is_skipped() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 4), rhel_facts("host-2", 4)]);
    let settings = TallySettings {
        max_facts_per_org: 1,
        ..Default::default()
    };

    let result = host_tally(&store, settings, Arc::new(RecordingPublisher::default()))
        .tally_org(ORG_ID)
        .await;

    assert!(matches!(
        result,
        Err(TallyError::ThresholdExceeded { count: 2, max: 1, .. })
    ));
    assert!(store.all_hosts(ORG_ID).is_empty());
    assert_eq!(store.snapshot_count(), 0);
}

#[tokio::test]
async fn systems_gone_from_inventory_are_zeroed() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 4)]);
    let service = host_tally(
        &store,
        TallySettings::default(),
        Arc::new(RecordingPublisher::default()),
    );
    service.tally_org(ORG_ID).await.expect("first tally failed");
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Total), Some(4.0));

    store.set_facts(ORG_ID, vec![]);
    let report = service.tally_org(ORG_ID).await.expect("second tally failed");

    assert_eq!(report.hosts.deleted, 1);
    assert!(store.all_hosts(ORG_ID).is_empty());
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Total), None);
    assert!(store
        .snapshot(&SnapshotKey::for_usage(
            ORG_ID,
            &rhel_key(),
            Granularity::Daily,
            today(),
        ))
        .is_some());
}

#[tokio::test]
async fn failed_snapshot_save_keeps_previous_snapshots() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 4)]);
    let publisher = Arc::new(RecordingPublisher::default());
    let service = host_tally(&store, TallySettings::default(), publisher.clone());
    service.tally_org(ORG_ID).await.expect("first tally failed");

    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 8)]);
    store.fail_snapshot_saves(true);
    let result = service.tally_org(ORG_ID).await;

    assert!(matches!(result, Err(ref e) if e.is_transient()));
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Total), Some(4.0));
    assert_eq!(publisher.batches(), 1);

    store.fail_snapshot_saves(false);
    service.tally_org(ORG_ID).await.expect("recovered tally failed");
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Total), Some(8.0));
}

struct FixedConcurrency(ConcurrencyReport);

#[async_trait]
impl ConcurrencyReportSource for FixedConcurrency {
    async fn daily_concurrency(
        &self,
        _org_id: &str,
        _date: NaiveDate,
    ) -> Result<ConcurrencyReport, TallyError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn cloud_concurrency_is_added_to_the_nightly_tally() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 4)]);
    let report = ConcurrencyReport {
        data: vec![DailyConcurrency {
            date: today().date_naive(),
            maximum_counts: vec![UsageCount {
                role: "_ANY".to_string(),
                arch: "x86_64".to_string(),
                sla: Some("Premium".to_string()),
                usage: Some("Production".to_string()),
                service_type: None,
                instances_count: 3,
            }],
        }],
    };
    let enricher = CloudigradeEnricher::new(Arc::new(FixedConcurrency(report)), registry());
    let service = HostTallyService::new(
        store.stores(),
        registry(),
        Some(Arc::new(enricher)),
        Arc::new(RecordingPublisher::default()),
        clock(),
        TallySettings::default(),
        RetryConfig::quick(),
    );

    let result = service.tally_org(ORG_ID).await.expect("tally failed");
    assert_eq!(result.enriched, 1);

    assert_eq!(
        stored(
            &store,
            &rhel_key(),
            Granularity::Daily,
            today(),
            HardwareMeasurementType::AwsCloudigrade,
            &MetricId::instances(),
        ),
        Some(3.0)
    );
    assert_eq!(daily_cores(&store, HardwareMeasurementType::Physical), Some(4.0));
}
