//! Hourly event tally against in-memory stores.

mod common;

use chrono::{DateTime, Utc};
use common::*;
use std::sync::Arc;
use tally_service::clock::ApplicationClock;
use tally_service::config::TallySettings;
use tally_service::models::{Event, Granularity, HardwareMeasurementType, MetricId, UsageKey};
use tally_service::services::MemoryStore;

async fn ingest(store: &Arc<MemoryStore>, events: &[Event]) -> usize {
    store
        .stores()
        .events
        .save_events(events)
        .await
        .expect("save events")
}

fn rosa_cores(store: &MemoryStore, granularity: Granularity, date: DateTime<Utc>) -> Option<f64> {
    stored(
        store,
        &UsageKey::any(ROSA),
        granularity,
        date,
        HardwareMeasurementType::Total,
        &MetricId::cores(),
    )
}

fn rhel_daily(store: &MemoryStore) -> Option<f64> {
    stored(
        store,
        &rhel_key(),
        Granularity::Daily,
        today(),
        HardwareMeasurementType::Total,
        &MetricId::cores(),
    )
}

#[tokio::test]
async fn hourly_events_roll_up_into_the_day() {
    init_tracing();
    let store = MemoryStore::new();
    let publisher = Arc::new(RecordingPublisher::default());
    ingest(
        &store,
        &[
            rosa_event(at(10, 0), at(10, 5), 4.0),
            rosa_event(at(11, 0), at(11, 5), 3.0),
        ],
    )
    .await;

    let report = event_tally(&store, publisher.clone())
        .tally_hourly(ORG_ID)
        .await
        .expect("hourly tally failed");

    assert_eq!(report.events_applied, 2);
    assert_eq!(report.window, Some((at(10, 0), at(11, 0))));
    assert_eq!(rosa_cores(&store, Granularity::Hourly, at(10, 0)), Some(4.0));
    assert_eq!(rosa_cores(&store, Granularity::Hourly, at(11, 0)), Some(3.0));
    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(7.0));
    assert_eq!(
        stored(
            &store,
            &UsageKey::any(ROSA),
            Granularity::Daily,
            today(),
            HardwareMeasurementType::Physical,
            &MetricId::cores(),
        ),
        Some(7.0)
    );
    assert_eq!(publisher.batches(), 1);

    let hosts = store.all_hosts(ORG_ID);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].instance_type, ROSA_SERVICE_TYPE);
    assert_eq!(hosts[0].measurement(&MetricId::cores()), Some(3.0));
}

#[tokio::test]
async fn rerunning_and_reingesting_changes_nothing() {
    init_tracing();
    let store = MemoryStore::new();
    let events = vec![
        rosa_event(at(10, 0), at(10, 5), 4.0),
        rosa_event(at(11, 0), at(11, 5), 3.0),
    ];
    ingest(&store, &events).await;
    let service = event_tally(&store, Arc::new(RecordingPublisher::default()));
    service.tally_hourly(ORG_ID).await.expect("first pass failed");

    let rerun = service.tally_hourly(ORG_ID).await.expect("second pass failed");
    assert_eq!(rerun.events_applied, 0);
    assert_eq!(rerun.window, None);
    assert_eq!(rerun.snapshots_written, 0);

    assert_eq!(ingest(&store, &events).await, 0);
    let reingested = service.tally_hourly(ORG_ID).await.expect("third pass failed");
    assert_eq!(reingested.events_applied, 0);

    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(7.0));
}

#[tokio::test]
async fn late_event_counts_in_usage_but_not_current_measurements() {
    init_tracing();
    let store = MemoryStore::new();
    ingest(
        &store,
        &[
            rosa_event(at(10, 0), at(10, 5), 4.0),
            rosa_event(at(11, 0), at(11, 5), 3.0),
        ],
    )
    .await;
    let service = event_tally(&store, Arc::new(RecordingPublisher::default()));
    service.tally_hourly(ORG_ID).await.expect("first pass failed");

    ingest(&store, &[rosa_event(at(9, 0), at(11, 30), 5.0)]).await;
    let report = service.tally_hourly(ORG_ID).await.expect("late pass failed");

    assert_eq!(report.events_late, 1);
    assert_eq!(report.window, Some((at(9, 0), at(9, 0))));
    assert_eq!(rosa_cores(&store, Granularity::Hourly, at(9, 0)), Some(5.0));
    assert_eq!(rosa_cores(&store, Granularity::Hourly, at(11, 0)), Some(3.0));
    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(12.0));

    let host = store
        .all_hosts(ORG_ID)
        .into_iter()
        .next()
        .expect("rosa host");
    assert_eq!(host.measurement(&MetricId::cores()), Some(3.0));
    assert_eq!(host.last_seen, Some(at(11, 0)));
    assert_eq!(host.monthly_total("2024-03", &MetricId::cores()), Some(12.0));
}

#[tokio::test]
async fn failed_snapshot_save_leaves_the_events_pending() {
    init_tracing();
    let store = MemoryStore::new();
    ingest(&store, &[rosa_event(at(10, 0), at(10, 5), 4.0)]).await;
    let service = event_tally(&store, Arc::new(RecordingPublisher::default()));

    store.fail_snapshot_saves(true);
    assert!(service.tally_hourly(ORG_ID).await.is_err());
    assert!(store.all_hosts(ORG_ID).is_empty());
    assert_eq!(rosa_cores(&store, Granularity::Hourly, at(10, 0)), None);

    store.fail_snapshot_saves(false);
    let report = service.tally_hourly(ORG_ID).await.expect("retry pass failed");
    assert_eq!(report.events_applied, 1);
    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(4.0));
}

#[tokio::test]
async fn events_recorded_out_of_timestamp_order_are_all_applied() {
    init_tracing();
    let store = MemoryStore::new();
    ingest(
        &store,
        &[
            rosa_event(at(9, 0), at(11, 5), 2.0),
            rosa_event(at(10, 0), at(11, 10), 4.0),
            rosa_event(at(11, 0), at(11, 5), 3.0),
        ],
    )
    .await;
    let service = event_tally(&store, Arc::new(RecordingPublisher::default()));

    let report = service.tally_hourly(ORG_ID).await.expect("hourly tally failed");

    assert_eq!(report.events_applied, 3);
    assert_eq!(report.events_duplicate, 0);
    assert_eq!(rosa_cores(&store, Granularity::Hourly, at(10, 0)), Some(4.0));
    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(9.0));

    let host = store
        .all_hosts(ORG_ID)
        .into_iter()
        .next()
        .expect("rosa host");
    assert_eq!(host.measurement(&MetricId::cores()), Some(3.0));
    assert_eq!(
        host.last_applied_event_record_date(ROSA_SERVICE_TYPE),
        Some(at(11, 10))
    );

    let rerun = service.tally_hourly(ORG_ID).await.expect("second pass failed");
    assert_eq!(rerun.events_applied, 0);
    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(9.0));
}

#[tokio::test]
async fn nightly_and_hourly_passes_keep_their_own_products() {
    init_tracing();
    let store = MemoryStore::new();
    store.set_facts(ORG_ID, vec![rhel_facts("host-1", 4)]);
    let hourly = event_tally(&store, Arc::new(RecordingPublisher::default()));
    let nightly = host_tally(
        &store,
        TallySettings::default(),
        Arc::new(RecordingPublisher::default()),
    );

    ingest(&store, &[rosa_event(at(10, 0), at(10, 5), 4.0)]).await;
    hourly.tally_hourly(ORG_ID).await.expect("hourly tally failed");
    nightly.tally_org(ORG_ID).await.expect("nightly tally failed");

    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(4.0));
    assert_eq!(rhel_daily(&store), Some(4.0));
    assert_eq!(store.all_hosts(ORG_ID).len(), 2);

    ingest(&store, &[rosa_event(at(11, 0), at(11, 5), 3.0)]).await;
    hourly.tally_hourly(ORG_ID).await.expect("second hourly tally failed");

    assert_eq!(rosa_cores(&store, Granularity::Daily, today()), Some(7.0));
    assert_eq!(
        rosa_cores(
            &store,
            Granularity::Monthly,
            ApplicationClock::start_of_month(now())
        ),
        Some(7.0)
    );
    assert_eq!(rhel_daily(&store), Some(4.0));
}
