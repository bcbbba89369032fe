//! Per-org tally passes.
//!
//! [`HostTallyService`] runs the nightly inventory pass, [`EventTallyService`]
//! folds metric events into hourly snapshots and [`RetentionService`] purges
//! expired snapshots. Computation and persistence are retried wholesale on
//! transient store errors; publication happens once afterwards and never
//! re-runs the computation.

use crate::clock::ApplicationClock;
use crate::config::{RetentionConfig, TallySettings};
use crate::correlator::correlate;
use crate::enrichment::CloudigradeEnricher;
use crate::error::TallyError;
use crate::models::{Granularity, HardwareMeasurementType, Snapshot, HBI_HOST};
use crate::normalizer::FactNormalizer;
use crate::reconciler::{
    tally_buckets, EventHostBatch, EventOutcome, EventReconciler, HostReconcileStats,
    HostReconciler,
};
use crate::registry::{CollectorRegistry, ProductRegistry};
use crate::rollup::{self, AffectedRange, SnapshotRollup};
use crate::services::metrics::{record_error, record_snapshots_written, record_tally_pass};
use crate::services::publisher::SnapshotPublisher;
use crate::services::store::Stores;
use crate::usage::{AccountUsageCalculation, AccountUsageCalculationCache};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use service_core::retry::{retry_async, RetryConfig};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Outcome of one nightly pass for one org.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostTallyReport {
    pub org_id: String,
    pub visited: usize,
    pub hosts: HostReconcileStats,
    pub owner_id: Option<String>,
    pub enriched: usize,
    pub snapshots_written: usize,
}

/// Outcome of one hourly pass for one org.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HourlyTallyReport {
    pub org_id: String,
    pub events_applied: usize,
    pub events_late: usize,
    pub events_duplicate: usize,
    pub hosts_saved: usize,
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub snapshots_written: usize,
}

/// Snapshots changed by a pass, keyed by org.
type Produced = HashMap<String, Vec<Snapshot>>;

async fn save_produced(stores: &Stores, produced: &Produced) -> Result<usize, TallyError> {
    let all: Vec<Snapshot> = produced.values().flatten().cloned().collect();
    if all.is_empty() {
        return Ok(0);
    }
    stores.snapshots.save_snapshots(&all).await?;

    let mut per_granularity: BTreeMap<Granularity, usize> = BTreeMap::new();
    for snapshot in &all {
        *per_granularity.entry(snapshot.key.granularity).or_default() += 1;
    }
    for (granularity, count) in per_granularity {
        record_snapshots_written(granularity.as_str(), count);
    }
    Ok(all.len())
}

async fn publish(publisher: &dyn SnapshotPublisher, org_id: &str, produced: &Produced) {
    if produced.is_empty() {
        return;
    }
    if let Err(e) = publisher.publish(produced).await {
        record_error("publish_failed");
        warn!(org_id = %org_id, error = %e, "Tally summary not published");
    }
}

fn finish_pass<T>(kind: &str, org_id: &str, started: Instant, result: &Result<T, TallyError>) {
    let elapsed = started.elapsed().as_secs_f64();
    match result {
        Ok(_) => record_tally_pass(kind, "success", elapsed),
        Err(TallyError::ThresholdExceeded { .. }) => {
            record_tally_pass(kind, "skipped", elapsed);
        }
        Err(e) => {
            record_tally_pass(kind, "failure", elapsed);
            record_error(kind);
            warn!(org_id = %org_id, pass = kind, error = %e, "Tally pass failed");
        }
    }
}

// ============================================================================
// Nightly host tally
// ============================================================================

pub struct HostTallyService {
    stores: Stores,
    registry: Arc<ProductRegistry>,
    normalizer: Arc<FactNormalizer>,
    collectors: Arc<CollectorRegistry>,
    enricher: Option<Arc<CloudigradeEnricher>>,
    publisher: Arc<dyn SnapshotPublisher>,
    rollup: SnapshotRollup,
    clock: ApplicationClock,
    settings: TallySettings,
    retry: RetryConfig,
}

impl HostTallyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        registry: Arc<ProductRegistry>,
        enricher: Option<Arc<CloudigradeEnricher>>,
        publisher: Arc<dyn SnapshotPublisher>,
        clock: ApplicationClock,
        settings: TallySettings,
        retry: RetryConfig,
    ) -> Self {
        let normalizer = Arc::new(FactNormalizer::new(
            registry.clone(),
            clock,
            settings.rhsm_sync_threshold_days,
        ));
        let collectors = Arc::new(CollectorRegistry::from_registry(&registry));
        let rollup = SnapshotRollup::new(stores.snapshots.clone());
        Self {
            stores,
            registry,
            normalizer,
            collectors,
            enricher,
            publisher,
            rollup,
            clock,
            settings,
            retry,
        }
    }

    /// Reconcile the org's hosts with inventory and rewrite today's daily
    /// snapshots and everything rolled up from them.
    #[instrument(skip(self), fields(org_id = %org_id))]
    pub async fn tally_org(&self, org_id: &str) -> Result<HostTallyReport, TallyError> {
        let started = Instant::now();
        let result = retry_async(
            &self.retry,
            "host_tally",
            |e: &TallyError| e.is_transient(),
            || self.compute(org_id),
        )
        .await;
        finish_pass("host", org_id, started, &result);

        let (report, produced) = result?;
        publish(self.publisher.as_ref(), org_id, &produced).await;
        info!(
            org_id = %org_id,
            created = report.hosts.created,
            updated = report.hosts.updated,
            deleted = report.hosts.deleted,
            snapshots = report.snapshots_written,
            "Host tally complete"
        );
        Ok(report)
    }

    async fn compute(&self, org_id: &str) -> Result<(HostTallyReport, Produced), TallyError> {
        let culled = self.settings.culled_offset_days;
        let active = self
            .stores
            .facts
            .active_system_count(org_id, culled)
            .await?;
        if active > self.settings.max_facts_per_org {
            return Err(TallyError::ThresholdExceeded {
                org_id: org_id.to_string(),
                count: active,
                max: self.settings.max_facts_per_org,
            });
        }

        let mut reconciler = HostReconciler::new(
            org_id,
            self.normalizer.clone(),
            self.collectors.clone(),
            self.stores.hosts.clone(),
            self.clock,
            self.settings.host_flush_interval,
        );
        let visited = correlate(
            self.stores.facts.stream_facts(org_id, culled),
            self.stores.hosts.stream_hbi_hosts(org_id),
            self.stores.facts.stream_active_hypervisor_ids(org_id, culled),
            &mut reconciler,
        )
        .await?;
        let (stats, owner_id) = reconciler.finish().await?;

        let hosts: Vec<_> = self
            .stores
            .hosts
            .find_by_org(org_id)
            .await?
            .into_iter()
            .filter(|host| host.instance_type == HBI_HOST)
            .collect();
        let mut account = tally_buckets(org_id, &hosts);
        account.set_owner(owner_id.as_deref())?;

        let today = self.clock.start_of_today();
        let enriched = match &self.enricher {
            Some(enricher) => enricher.enrich(&mut account, today.date_naive()).await,
            None => 0,
        };

        // Payg products belong to the hourly pass; their daily snapshots are
        // rolled up from hourly ones and must not be rewritten here.
        let products: BTreeSet<String> = self
            .registry
            .tags_for_payg(false)
            .into_iter()
            .chain(
                account
                    .products()
                    .iter()
                    .filter(|tag| !self.registry.is_payg(tag))
                    .cloned(),
            )
            .collect();
        let calculations = BTreeMap::from([(today, account)]);
        let range = AffectedRange::new(Granularity::Daily, today, today);
        let produced = self
            .rollup
            .produce_snapshots(org_id, &products, &range, &calculations, rollup::max)
            .await?;
        let snapshots_written = save_produced(&self.stores, &produced).await?;

        let report = HostTallyReport {
            org_id: org_id.to_string(),
            visited,
            hosts: stats,
            owner_id,
            enriched,
            snapshots_written,
        };
        Ok((report, produced))
    }
}

// ============================================================================
// Hourly event tally
// ============================================================================

pub struct EventTallyService {
    stores: Stores,
    registry: Arc<ProductRegistry>,
    reconciler: EventReconciler,
    publisher: Arc<dyn SnapshotPublisher>,
    rollup: SnapshotRollup,
    clock: ApplicationClock,
    lookback: Duration,
    retry: RetryConfig,
}

impl EventTallyService {
    pub fn new(
        stores: Stores,
        registry: Arc<ProductRegistry>,
        publisher: Arc<dyn SnapshotPublisher>,
        clock: ApplicationClock,
        settings: &TallySettings,
        retry: RetryConfig,
    ) -> Self {
        let rollup = SnapshotRollup::new(stores.snapshots.clone());
        Self {
            reconciler: EventReconciler::new(registry.clone()),
            stores,
            registry,
            publisher,
            rollup,
            clock,
            lookback: Duration::hours(settings.hourly_lookback_hours),
            retry,
        }
    }

    /// Fold every event recorded since the org's last pass into hourly
    /// snapshots. The hour window is the span of those events.
    #[instrument(skip(self), fields(org_id = %org_id))]
    pub async fn tally_hourly(&self, org_id: &str) -> Result<HourlyTallyReport, TallyError> {
        let started = Instant::now();
        let result = retry_async(
            &self.retry,
            "hourly_tally",
            |e: &TallyError| e.is_transient(),
            || self.compute(org_id),
        )
        .await;
        finish_pass("hourly", org_id, started, &result);

        let (report, produced) = result?;
        publish(self.publisher.as_ref(), org_id, &produced).await;
        info!(
            org_id = %org_id,
            applied = report.events_applied,
            late = report.events_late,
            duplicates = report.events_duplicate,
            snapshots = report.snapshots_written,
            "Hourly tally complete"
        );
        Ok(report)
    }

    async fn compute(&self, org_id: &str) -> Result<(HourlyTallyReport, Produced), TallyError> {
        let mut report = HourlyTallyReport {
            org_id: org_id.to_string(),
            ..Default::default()
        };

        let last_applied = self.stores.events.last_event_applied(org_id).await?;
        let after = last_applied.or_else(|| Some(self.clock.now() - self.lookback));
        let events = self
            .stores
            .events
            .find_events_recorded_after(org_id, after)
            .await?;
        let (Some(first), Some(last)) = (
            events.iter().map(|e| e.timestamp).min(),
            events.iter().map(|e| e.timestamp).max(),
        ) else {
            return Ok((report, Produced::new()));
        };
        let window = (
            ApplicationClock::start_of_hour(first),
            ApplicationClock::start_of_hour(last),
        );
        report.window = Some(window);

        let products = self.registry.tags_for_payg(true);
        let mut cache = AccountUsageCalculationCache::new(org_id, last_applied);
        self.preload(&mut cache, &products, window).await?;

        let instance_ids: Vec<String> = events
            .iter()
            .map(|e| e.instance_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let existing = self
            .stores
            .hosts
            .find_by_instance_ids(org_id, &instance_ids)
            .await?;
        let mut batch = EventHostBatch::new(existing);
        for event in &events {
            match batch.apply(&self.reconciler, event, &mut cache) {
                EventOutcome::Applied => report.events_applied += 1,
                EventOutcome::Late => report.events_late += 1,
                EventOutcome::AlreadyApplied => report.events_duplicate += 1,
            }
        }
        let hosts = batch.finish();

        let range = AffectedRange::new(Granularity::Hourly, window.0, window.1);
        let produced = self
            .rollup
            .produce_snapshots(org_id, &products, &range, cache.calculations(), rollup::sum)
            .await?;
        // Snapshots go first so a failed save leaves hosts and the mark untouched.
        report.snapshots_written = save_produced(&self.stores, &produced).await?;
        if !hosts.is_empty() {
            self.stores.hosts.save_all(&hosts).await?;
        }
        report.hosts_saved = hosts.len();
        if let Some(mark) = cache.last_event_applied().filter(|m| Some(*m) != last_applied) {
            self.stores
                .events
                .set_last_event_applied(org_id, mark)
                .await?;
        }
        Ok((report, produced))
    }

    /// Seed the cache with what the hourly snapshots in `window` already hold,
    /// so the rewrite of those hours keeps earlier passes' usage.
    async fn preload(
        &self,
        cache: &mut AccountUsageCalculationCache,
        products: &BTreeSet<String>,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<(), TallyError> {
        let existing = self
            .stores
            .snapshots
            .find_snapshots(
                cache.org_id(),
                products,
                Granularity::Hourly,
                window.0,
                window.1,
            )
            .await?;
        for snapshot in existing {
            let account = cache.get_or_create(snapshot.key.snapshot_date);
            add_snapshot(account, &snapshot);
        }
        Ok(())
    }
}

fn add_snapshot(account: &mut AccountUsageCalculation, snapshot: &Snapshot) {
    let key = snapshot.key.usage_key();
    let calculation = account.get_or_create_calculation(&key);
    for (measurement, value) in &snapshot.measurements {
        if measurement.hardware_measurement_type == HardwareMeasurementType::Total {
            continue;
        }
        calculation.add(
            measurement.hardware_measurement_type,
            measurement.metric_id.clone(),
            *value,
        );
    }
}

// ============================================================================
// Retention
// ============================================================================

pub struct RetentionService {
    stores: Stores,
    clock: ApplicationClock,
    config: RetentionConfig,
}

impl RetentionService {
    pub fn new(stores: Stores, clock: ApplicationClock, config: RetentionConfig) -> Self {
        Self {
            stores,
            clock,
            config,
        }
    }

    fn retention_days(&self, granularity: Granularity) -> i64 {
        match granularity {
            Granularity::Hourly => self.config.hourly_days,
            Granularity::Daily => self.config.daily_days,
            Granularity::Weekly => self.config.weekly_days,
            Granularity::Monthly => self.config.monthly_days,
            Granularity::Quarterly => self.config.quarterly_days,
            Granularity::Yearly => self.config.yearly_days,
        }
    }

    /// Delete snapshots of `granularity` dated before `cutoff`.
    #[instrument(skip(self), fields(granularity = %granularity))]
    pub async fn purge_snapshots_before(
        &self,
        granularity: Granularity,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, TallyError> {
        let deleted = self
            .stores
            .snapshots
            .delete_snapshots_before(granularity, cutoff)
            .await?;
        info!(granularity = %granularity, cutoff = %cutoff, deleted, "Purged snapshots");
        Ok(deleted)
    }

    /// Apply the configured retention to every granularity.
    pub async fn purge_expired(&self) -> Result<BTreeMap<Granularity, u64>, TallyError> {
        let started = Instant::now();
        let mut purged = BTreeMap::new();
        let mut result = Ok(());
        for granularity in Granularity::LADDER {
            let cutoff = ApplicationClock::start_of_range(
                granularity,
                self.clock.now() - Duration::days(self.retention_days(granularity)),
            );
            match self.purge_snapshots_before(granularity, cutoff).await {
                Ok(deleted) => {
                    purged.insert(granularity, deleted);
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        finish_pass("retention", "*", started, &result);
        result.map(|_| purged)
    }
}
