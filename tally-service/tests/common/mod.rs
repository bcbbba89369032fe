//! Common test utilities for tally-service integration tests.
//!
//! Everything runs against [`MemoryStore`]; no database is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use service_core::retry::RetryConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tally_service::clock::ApplicationClock;
use tally_service::config::{TallyConfig, TallySettings};
use tally_service::controller::{EventTallyService, HostTallyService};
use tally_service::error::TallyError;
use tally_service::models::{
    Dimension, Event, Granularity, HardwareMeasurementType, HostFacts, Measurement, MetricId,
    ServiceLevel, Snapshot, SnapshotKey, Usage, UsageKey,
};
use tally_service::registry::ProductRegistry;
use tally_service::services::{MemoryStore, SnapshotPublisher};
use tally_service::startup::Application;
use uuid::Uuid;

pub const ORG_ID: &str = "org123";
pub const RHEL: &str = "RHEL for x86";
pub const ROSA: &str = "rosa";
pub const ROSA_SERVICE_TYPE: &str = "rosa Instance";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,tally_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Fixed "now" for every test: midday on a Tuesday in March.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap()
}

pub fn clock() -> ApplicationClock {
    ApplicationClock::fixed(now())
}

pub fn today() -> DateTime<Utc> {
    clock().start_of_today()
}

/// Keeps every published batch for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<HashMap<String, Vec<Snapshot>>>>,
}

impl RecordingPublisher {
    pub fn batches(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotPublisher for RecordingPublisher {
    async fn publish(&self, snapshots: &HashMap<String, Vec<Snapshot>>) -> Result<(), TallyError> {
        self.published.lock().unwrap().push(snapshots.clone());
        Ok(())
    }
}

pub fn registry() -> Arc<ProductRegistry> {
    Arc::new(ProductRegistry::builtin().expect("builtin registry"))
}

pub fn host_tally(
    store: &Arc<MemoryStore>,
    settings: TallySettings,
    publisher: Arc<RecordingPublisher>,
) -> HostTallyService {
    HostTallyService::new(
        store.stores(),
        registry(),
        None,
        publisher,
        clock(),
        settings,
        RetryConfig::quick(),
    )
}

pub fn event_tally(store: &Arc<MemoryStore>, publisher: Arc<RecordingPublisher>) -> EventTallyService {
    EventTallyService::new(
        store.stores(),
        registry(),
        publisher,
        clock(),
        &TallySettings::default(),
        RetryConfig::quick(),
    )
}

// ============================================================================
// Fixtures
// ============================================================================

/// A RHEL system with a current RHSM sync.
pub fn rhel_facts(inventory_id: &str, cores: i32) -> HostFacts {
    HostFacts {
        org_id: ORG_ID.to_string(),
        inventory_id: inventory_id.to_string(),
        subscription_manager_id: Some(format!("sm-{}", inventory_id)),
        owner_id: Some("owner-1".to_string()),
        cores: Some(cores),
        sockets: Some(1),
        arch: Some("x86_64".to_string()),
        rhsm_role: Some("Red Hat Enterprise Linux Server".to_string()),
        rhsm_sla: Some("Premium".to_string()),
        rhsm_usage: Some("Production".to_string()),
        sync_timestamp: Some(now()),
        ..Default::default()
    }
}

pub fn guest_facts(inventory_id: &str, hypervisor_uuid: &str, cores: i32) -> HostFacts {
    HostFacts {
        is_virtual: Some(true),
        hypervisor_uuid: Some(hypervisor_uuid.to_string()),
        ..rhel_facts(inventory_id, cores)
    }
}

pub fn rhel_key() -> UsageKey {
    UsageKey::new(
        RHEL,
        Dimension::Specific(ServiceLevel::Premium),
        Dimension::Specific(Usage::Production),
        Dimension::Any,
        Dimension::Any,
    )
}

pub fn rosa_event(timestamp: DateTime<Utc>, record_date: DateTime<Utc>, cores: f64) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        org_id: ORG_ID.to_string(),
        instance_id: "i-rosa-1".to_string(),
        service_type: ROSA_SERVICE_TYPE.to_string(),
        timestamp,
        record_date,
        display_name: None,
        inventory_id: None,
        hypervisor_uuid: None,
        subscription_manager_id: None,
        hardware_type: None,
        cloud_provider: None,
        billing_provider: None,
        billing_account_id: None,
        sla: None,
        usage: None,
        role: Some(ROSA.to_string()),
        product_ids: vec![],
        measurements: vec![Measurement {
            metric_id: MetricId::cores(),
            value: cores,
        }],
    }
}

/// Measurement of the stored snapshot, `None` when the snapshot or the
/// measurement is missing.
pub fn stored(
    store: &MemoryStore,
    key: &UsageKey,
    granularity: Granularity,
    date: DateTime<Utc>,
    measurement_type: HardwareMeasurementType,
    metric_id: &MetricId,
) -> Option<f64> {
    store
        .snapshot(&SnapshotKey::for_usage(ORG_ID, key, granularity, date))
        .and_then(|s| s.measurement(measurement_type, metric_id))
}

// ============================================================================
// HTTP
// ============================================================================

pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let config = TallyConfig::local(0);
        let app = Application::build_with_stores(
            config,
            store.stores(),
            Arc::new(RecordingPublisher::default()),
            clock(),
        )
        .await
        .expect("Failed to build test application");

        let http_port = app.http_port();
        let http_address = format!("http://127.0.0.1:{}", http_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            http_address,
            http_port,
            store,
        }
    }
}
