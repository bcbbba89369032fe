#![allow(clippy::should_implement_trait)]

use crate::models::dimensions::{BillingProvider, Dimension, ServiceLevel, Usage, UsageKey};
use crate::models::measurement::{HardwareMeasurementType, MeasurementKey, MetricId};
use crate::usage::UsageCalculation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Granularity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Granularity {
    /// Finest to coarsest.
    pub const LADDER: [Granularity; 6] = [
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Quarterly,
        Self::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Quarterly => "QUARTERLY",
            Self::Yearly => "YEARLY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HOURLY" => Some(Self::Hourly),
            "DAILY" => Some(Self::Daily),
            "WEEKLY" => Some(Self::Weekly),
            "MONTHLY" => Some(Self::Monthly),
            "QUARTERLY" => Some(Self::Quarterly),
            "YEARLY" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn next_coarser(&self) -> Option<Granularity> {
        match self {
            Self::Hourly => Some(Self::Daily),
            Self::Daily => Some(Self::Weekly),
            Self::Weekly => Some(Self::Monthly),
            Self::Monthly => Some(Self::Quarterly),
            Self::Quarterly => Some(Self::Yearly),
            Self::Yearly => None,
        }
    }

    /// Granularity whose snapshots are reduced into this one.
    ///
    /// Weeks straddle month boundaries, so months are built from days rather
    /// than from the weekly layer above them on the ladder.
    pub fn rollup_source(&self) -> Option<Granularity> {
        match self {
            Self::Hourly => None,
            Self::Daily => Some(Self::Hourly),
            Self::Weekly => Some(Self::Daily),
            Self::Monthly => Some(Self::Daily),
            Self::Quarterly => Some(Self::Monthly),
            Self::Yearly => Some(Self::Quarterly),
        }
    }

    /// Granularities built directly from this one.
    pub fn rollup_targets(&self) -> Vec<Granularity> {
        Self::LADDER
            .into_iter()
            .filter(|g| g.rollup_source() == Some(*self))
            .collect()
    }

    /// This granularity and every coarser one, finest first.
    pub fn ladder_from(&self) -> impl Iterator<Item = Granularity> {
        let start = *self;
        Self::LADDER.into_iter().filter(move |g| *g >= start)
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Business identity of a snapshot. Never changes once the snapshot exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub org_id: String,
    pub product_id: String,
    pub granularity: Granularity,
    pub sla: Dimension<ServiceLevel>,
    pub usage: Dimension<Usage>,
    pub billing_provider: Dimension<BillingProvider>,
    pub billing_account_id: Dimension<String>,
    pub snapshot_date: DateTime<Utc>,
}

impl SnapshotKey {
    pub fn for_usage(
        org_id: &str,
        key: &UsageKey,
        granularity: Granularity,
        snapshot_date: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id: org_id.to_string(),
            product_id: key.product_id.clone(),
            granularity,
            sla: key.sla.clone(),
            usage: key.usage.clone(),
            billing_provider: key.billing_provider.clone(),
            billing_account_id: key.billing_account_id.clone(),
            snapshot_date,
        }
    }

    pub fn usage_key(&self) -> UsageKey {
        UsageKey::new(
            self.product_id.clone(),
            self.sla.clone(),
            self.usage.clone(),
            self.billing_provider.clone(),
            self.billing_account_id.clone(),
        )
    }

    /// Same dimensions at another granularity and date.
    pub fn at(&self, granularity: Granularity, snapshot_date: DateTime<Utc>) -> Self {
        Self {
            granularity,
            snapshot_date,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: Uuid,
    pub key: SnapshotKey,
    pub measurements: BTreeMap<MeasurementKey, f64>,
}

impl Snapshot {
    pub fn new(key: SnapshotKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            measurements: BTreeMap::new(),
        }
    }

    pub fn clear_measurements(&mut self) {
        self.measurements.clear();
    }

    pub fn set_measurement(
        &mut self,
        hardware_measurement_type: HardwareMeasurementType,
        metric_id: MetricId,
        value: f64,
    ) {
        self.measurements.insert(
            MeasurementKey::new(hardware_measurement_type, metric_id),
            value,
        );
    }

    pub fn measurement(
        &self,
        hardware_measurement_type: HardwareMeasurementType,
        metric_id: &MetricId,
    ) -> Option<f64> {
        self.measurements
            .get(&MeasurementKey::new(
                hardware_measurement_type,
                metric_id.clone(),
            ))
            .copied()
    }

    /// Replace every measurement with the calculation's totals, TOTAL included.
    pub fn set_measurements_from(&mut self, calculation: &UsageCalculation) {
        self.measurements.clear();
        for (measurement_type, totals) in calculation.iter() {
            for (metric_id, value) in totals.iter() {
                self.set_measurement(*measurement_type, metric_id.clone(), *value);
            }
        }
    }
}

/// One entry of a snapshot's measurement map, in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeasurement {
    pub hardware_measurement_type: HardwareMeasurementType,
    pub metric_id: MetricId,
    pub value: f64,
}

/// Flat, serializable form of a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub key: SnapshotKey,
    pub measurements: Vec<SnapshotMeasurement>,
}

impl From<&Snapshot> for SnapshotRecord {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id,
            key: snapshot.key.clone(),
            measurements: snapshot
                .measurements
                .iter()
                .map(|(key, value)| SnapshotMeasurement {
                    hardware_measurement_type: key.hardware_measurement_type,
                    metric_id: key.metric_id.clone(),
                    value: *value,
                })
                .collect(),
        }
    }
}

impl From<SnapshotRecord> for Snapshot {
    fn from(record: SnapshotRecord) -> Self {
        let mut snapshot = Snapshot {
            id: record.id,
            key: record.key,
            measurements: BTreeMap::new(),
        };
        for m in record.measurements {
            snapshot.set_measurement(m.hardware_measurement_type, m.metric_id, m.value);
        }
        snapshot
    }
}
