//! Materializing usage calculations into snapshots at every granularity.
//!
//! A rollup works on a [`SnapshotCatalog`]: every persisted snapshot the pass
//! can touch, loaded up front. Finest-granularity snapshots in the affected
//! range are cleared, rewritten from the new calculations, and then reduced
//! into each coarser granularity in ladder order. Coarser periods are always
//! rebuilt from all of their contributors, so the catalog is loaded over the
//! full coarser periods the affected range touches rather than the range itself.

use crate::clock::ApplicationClock;
use crate::error::TallyError;
use crate::models::{Granularity, MeasurementKey, Snapshot, SnapshotKey};
use crate::services::store::SnapshotStore;
use crate::usage::AccountUsageCalculation;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Combines two values of the same measurement across contributing snapshots.
pub type Reduction = fn(f64, f64) -> f64;

pub fn sum(a: f64, b: f64) -> f64 {
    a + b
}

/// Used for externally reported concurrency, where contributors are samples of
/// the same population rather than disjoint usage.
pub fn max(a: f64, b: f64) -> f64 {
    a.max(b)
}

// ============================================================================
// Affected range
// ============================================================================

/// Period starts touched by a pass, per granularity, and the windows the
/// catalog has to cover for them.
#[derive(Debug, Clone)]
pub struct AffectedRange {
    finest: Granularity,
    affected: BTreeMap<Granularity, (DateTime<Utc>, DateTime<Utc>)>,
}

impl AffectedRange {
    /// `start..=end` at `finest`, widened to whole periods at every coarser level.
    pub fn new(finest: Granularity, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let mut affected = BTreeMap::new();
        affected.insert(
            finest,
            (
                ApplicationClock::start_of_range(finest, start),
                ApplicationClock::end_of_range(finest, end),
            ),
        );
        for granularity in finest.ladder_from().skip(1) {
            let Some(source) = granularity.rollup_source() else {
                continue;
            };
            let Some(&(source_start, source_end)) = affected.get(&source) else {
                continue;
            };
            affected.insert(
                granularity,
                (
                    ApplicationClock::start_of_range(granularity, source_start),
                    ApplicationClock::end_of_range(granularity, source_end),
                ),
            );
        }
        Self { finest, affected }
    }

    pub fn finest(&self) -> Granularity {
        self.finest
    }

    pub fn granularities(&self) -> impl Iterator<Item = Granularity> + '_ {
        self.affected.keys().copied()
    }

    /// Inclusive bounds of the periods touched at `granularity`.
    pub fn affected(&self, granularity: Granularity) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.affected.get(&granularity).copied()
    }

    pub fn contains(&self, granularity: Granularity, date: DateTime<Utc>) -> bool {
        self.affected(granularity)
            .is_some_and(|(start, end)| start <= date && date <= end)
    }

    /// Window of `granularity` snapshots to load: its own affected periods plus
    /// every contributor of the coarser periods built from it.
    pub fn load_window(&self, granularity: Granularity) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (mut start, mut end) = self.affected(granularity)?;
        for target in granularity.rollup_targets() {
            if let Some((target_start, target_end)) = self.affected(target) {
                start = start.min(target_start);
                end = end.max(target_end);
            }
        }
        Some((start, end))
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Snapshots of one org indexed by natural key, remembering what was persisted.
#[derive(Debug, Default)]
pub struct SnapshotCatalog {
    snapshots: BTreeMap<SnapshotKey, Snapshot>,
    persisted: HashMap<SnapshotKey, BTreeMap<MeasurementKey, f64>>,
}

impl SnapshotCatalog {
    pub fn new(existing: impl IntoIterator<Item = Snapshot>) -> Self {
        let mut catalog = Self::default();
        for snapshot in existing {
            catalog
                .persisted
                .insert(snapshot.key.clone(), snapshot.measurements.clone());
            catalog.snapshots.insert(snapshot.key.clone(), snapshot);
        }
        catalog
    }

    pub fn get(&self, key: &SnapshotKey) -> Option<&Snapshot> {
        self.snapshots.get(key)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn find_or_create(&mut self, key: SnapshotKey) -> &mut Snapshot {
        self.snapshots
            .entry(key.clone())
            .or_insert_with(|| Snapshot::new(key))
    }

    fn keys_matching<'a>(
        &'a self,
        granularity: Granularity,
        products: &'a BTreeSet<String>,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> impl Iterator<Item = &'a SnapshotKey> + 'a {
        self.snapshots.keys().filter(move |key| {
            key.granularity == granularity
                && products.contains(&key.product_id)
                && window.0 <= key.snapshot_date
                && key.snapshot_date <= window.1
        })
    }

    /// Snapshots created or modified since the catalog was loaded.
    ///
    /// New snapshots without measurements are left out: nothing was persisted
    /// for them and there is nothing to report.
    pub fn changed(&self) -> Vec<Snapshot> {
        self.snapshots
            .values()
            .filter(|snapshot| match self.persisted.get(&snapshot.key) {
                Some(persisted) => *persisted != snapshot.measurements,
                None => !snapshot.measurements.is_empty(),
            })
            .cloned()
            .collect()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Rewrite `catalog` from `calculations`, keyed by finest period start.
///
/// `products` should name every product whose snapshots may need zeroing, not
/// only the ones present in `calculations`.
pub fn roll_up(
    catalog: &mut SnapshotCatalog,
    org_id: &str,
    products: &BTreeSet<String>,
    range: &AffectedRange,
    calculations: &BTreeMap<DateTime<Utc>, AccountUsageCalculation>,
    reduction: Reduction,
) {
    let finest = range.finest();
    let mut products = products.clone();
    for account in calculations.values() {
        products.extend(account.products().iter().cloned());
    }

    if let Some(window) = range.affected(finest) {
        let stale: Vec<SnapshotKey> = catalog
            .keys_matching(finest, &products, window)
            .filter(|key| key.org_id == org_id)
            .cloned()
            .collect();
        for key in stale {
            catalog.find_or_create(key).clear_measurements();
        }
    }

    for (timestamp, account) in calculations {
        if !range.contains(finest, *timestamp) {
            debug!(
                org_id = %org_id,
                timestamp = %timestamp,
                "Calculation outside the affected range"
            );
            continue;
        }
        let period = ApplicationClock::start_of_range(finest, *timestamp);
        for calculation in account.calculations() {
            let key = SnapshotKey::for_usage(org_id, calculation.key(), finest, period);
            catalog
                .find_or_create(key)
                .set_measurements_from(calculation);
        }
    }

    for source in range.granularities().collect::<Vec<_>>() {
        for target in source.rollup_targets() {
            roll_up_level(catalog, org_id, &products, range, source, target, reduction);
        }
    }
}

fn roll_up_level(
    catalog: &mut SnapshotCatalog,
    org_id: &str,
    products: &BTreeSet<String>,
    range: &AffectedRange,
    source: Granularity,
    target: Granularity,
    reduction: Reduction,
) {
    let Some(target_window) = range.affected(target) else {
        return;
    };

    let mut groups: BTreeMap<SnapshotKey, BTreeMap<MeasurementKey, f64>> = BTreeMap::new();
    for key in catalog
        .keys_matching(source, products, target_window)
        .filter(|key| key.org_id == org_id)
    {
        let target_key = key.at(
            target,
            ApplicationClock::start_of_range(target, key.snapshot_date),
        );
        let reduced = groups.entry(target_key).or_default();
        if let Some(snapshot) = catalog.get(key) {
            for (measurement, value) in &snapshot.measurements {
                reduced
                    .entry(measurement.clone())
                    .and_modify(|acc| *acc = reduction(*acc, *value))
                    .or_insert(*value);
            }
        }
    }

    let orphaned: Vec<SnapshotKey> = catalog
        .keys_matching(target, products, target_window)
        .filter(|key| key.org_id == org_id && !groups.contains_key(*key))
        .cloned()
        .collect();
    for key in orphaned {
        catalog.find_or_create(key).clear_measurements();
    }

    for (key, measurements) in groups {
        catalog.find_or_create(key).measurements = measurements;
    }
}

/// Loads catalogs from a [`SnapshotStore`] and runs [`roll_up`] against them.
#[derive(Clone)]
pub struct SnapshotRollup {
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotRollup {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, products, range), fields(org_id = %org_id, finest = %range.finest()))]
    pub async fn load_catalog(
        &self,
        org_id: &str,
        products: &BTreeSet<String>,
        range: &AffectedRange,
    ) -> Result<SnapshotCatalog, TallyError> {
        let mut existing = Vec::new();
        for granularity in range.granularities() {
            if let Some((start, end)) = range.load_window(granularity) {
                existing.extend(
                    self.store
                        .find_snapshots(org_id, products, granularity, start, end)
                        .await?,
                );
            }
        }
        Ok(SnapshotCatalog::new(existing))
    }

    /// Changed snapshots for one org, across every granularity from the finest up.
    pub async fn produce_snapshots(
        &self,
        org_id: &str,
        products: &BTreeSet<String>,
        range: &AffectedRange,
        calculations: &BTreeMap<DateTime<Utc>, AccountUsageCalculation>,
        reduction: Reduction,
    ) -> Result<HashMap<String, Vec<Snapshot>>, TallyError> {
        let mut all_products = products.clone();
        for account in calculations.values() {
            all_products.extend(account.products().iter().cloned());
        }
        let mut catalog = self.load_catalog(org_id, &all_products, range).await?;
        roll_up(&mut catalog, org_id, &all_products, range, calculations, reduction);

        let changed = catalog.changed();
        debug!(
            org_id = %org_id,
            loaded = catalog.len(),
            changed = changed.len(),
            "Rollup complete"
        );
        let mut result = HashMap::new();
        if !changed.is_empty() {
            result.insert(org_id.to_string(), changed);
        }
        Ok(result)
    }
}
