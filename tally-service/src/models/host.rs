#![allow(clippy::should_implement_trait)]

use crate::models::dimensions::UsageKey;
use crate::models::measurement::{HardwareMeasurementType, MetricId};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Instance type of hosts produced by the nightly inventory tally.
pub const HBI_HOST: &str = "HBI_HOST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostHardwareType {
    Physical,
    Virtualized,
    Cloud,
}

impl HostHardwareType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Physical => "PHYSICAL",
            Self::Virtualized => "VIRTUALIZED",
            Self::Cloud => "CLOUD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PHYSICAL" => Some(Self::Physical),
            "VIRTUALIZED" | "VIRTUAL" => Some(Self::Virtualized),
            "CLOUD" => Some(Self::Cloud),
            _ => None,
        }
    }
}

// ============================================================================
// Buckets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub usage_key: UsageKey,
    pub as_hypervisor: bool,
}

/// Membership of a host in one usage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostBucket {
    pub key: BucketKey,
    pub measurement_type: HardwareMeasurementType,
    pub cores: i32,
    pub sockets: i32,
    #[serde(skip)]
    stale: bool,
}

impl HostBucket {
    pub fn new(
        usage_key: UsageKey,
        as_hypervisor: bool,
        measurement_type: HardwareMeasurementType,
        cores: i32,
        sockets: i32,
    ) -> Self {
        Self {
            key: BucketKey {
                usage_key,
                as_hypervisor,
            },
            measurement_type,
            cores,
            sockets,
            stale: false,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

// ============================================================================
// Monthly totals
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthlyTotalKey {
    /// `YYYY-MM`
    pub month: String,
    pub metric_id: MetricId,
}

impl MonthlyTotalKey {
    pub fn new(timestamp: DateTime<Utc>, metric_id: MetricId) -> Self {
        Self {
            month: month_id(timestamp),
            metric_id,
        }
    }
}

pub fn month_id(timestamp: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", timestamp.year(), timestamp.month())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTotal {
    #[serde(flatten)]
    pub key: MonthlyTotalKey,
    pub value: f64,
}

// ============================================================================
// Host
// ============================================================================

/// Long-lived record of one org-scoped instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub id: Uuid,
    pub org_id: String,
    pub instance_id: String,
    pub instance_type: String,
    pub inventory_id: Option<String>,
    pub insights_id: Option<String>,
    pub subscription_manager_id: Option<String>,
    pub hypervisor_uuid: Option<String>,
    pub display_name: Option<String>,
    pub hardware_type: Option<HostHardwareType>,
    pub cloud_provider: Option<String>,
    pub billing_provider: Option<String>,
    pub billing_account_id: Option<String>,
    pub is_guest: bool,
    pub is_hypervisor: bool,
    pub is_unmapped_guest: bool,
    pub num_of_guests: Option<i32>,
    pub last_seen: Option<DateTime<Utc>>,
    pub measurements: BTreeMap<MetricId, f64>,
    pub monthly_totals: BTreeMap<MonthlyTotalKey, f64>,
    pub buckets: BTreeMap<BucketKey, HostBucket>,
    pub last_applied_event_record_date: BTreeMap<String, DateTime<Utc>>,
}

impl Host {
    pub fn new(
        org_id: impl Into<String>,
        instance_id: impl Into<String>,
        instance_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.into(),
            instance_id: instance_id.into(),
            instance_type: instance_type.into(),
            inventory_id: None,
            insights_id: None,
            subscription_manager_id: None,
            hypervisor_uuid: None,
            display_name: None,
            hardware_type: None,
            cloud_provider: None,
            billing_provider: None,
            billing_account_id: None,
            is_guest: false,
            is_hypervisor: false,
            is_unmapped_guest: false,
            num_of_guests: None,
            last_seen: None,
            measurements: BTreeMap::new(),
            monthly_totals: BTreeMap::new(),
            buckets: BTreeMap::new(),
            last_applied_event_record_date: BTreeMap::new(),
        }
    }

    /// Placeholder for a hypervisor referenced by guests before its own record
    /// has been visited.
    pub fn hypervisor_placeholder(hypervisor_uuid: &str) -> Self {
        let mut host = Self::new("", hypervisor_uuid, HBI_HOST);
        host.subscription_manager_id = Some(hypervisor_uuid.to_string());
        host.is_hypervisor = true;
        host.num_of_guests = Some(0);
        host
    }

    pub fn set_measurement(&mut self, metric_id: MetricId, value: f64) {
        self.measurements.insert(metric_id, value);
    }

    pub fn measurement(&self, metric_id: &MetricId) -> Option<f64> {
        self.measurements.get(metric_id).copied()
    }

    /// Drop current measurements for metrics outside `reported`.
    pub fn retain_measurements(&mut self, reported: &BTreeSet<MetricId>) {
        self.measurements.retain(|metric, _| reported.contains(metric));
    }

    pub fn add_to_monthly_total(&mut self, timestamp: DateTime<Utc>, metric_id: MetricId, value: f64) {
        *self
            .monthly_totals
            .entry(MonthlyTotalKey::new(timestamp, metric_id))
            .or_insert(0.0) += value;
    }

    pub fn monthly_total(&self, month: &str, metric_id: &MetricId) -> Option<f64> {
        self.monthly_totals
            .get(&MonthlyTotalKey {
                month: month.to_string(),
                metric_id: metric_id.clone(),
            })
            .copied()
    }

    /// Insert or replace a bucket; a re-asserted bucket is no longer stale.
    pub fn add_bucket(&mut self, bucket: HostBucket) {
        self.buckets.insert(bucket.key.clone(), bucket);
    }

    pub fn bucket(&self, key: &BucketKey) -> Option<&HostBucket> {
        self.buckets.get(key)
    }

    pub fn mark_buckets_stale(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.stale = true;
        }
    }

    /// Remove buckets not re-asserted since the last [`mark_buckets_stale`](Self::mark_buckets_stale).
    pub fn clear_stale_buckets(&mut self) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.stale);
        before - self.buckets.len()
    }

    pub fn take_buckets(&mut self) -> Vec<HostBucket> {
        std::mem::take(&mut self.buckets).into_values().collect()
    }

    pub fn last_applied_event_record_date(&self, service_type: &str) -> Option<DateTime<Utc>> {
        self.last_applied_event_record_date.get(service_type).copied()
    }

    pub fn set_last_applied_event_record_date(
        &mut self,
        service_type: &str,
        record_date: DateTime<Utc>,
    ) {
        let entry = self
            .last_applied_event_record_date
            .entry(service_type.to_string())
            .or_insert(record_date);
        if record_date > *entry {
            *entry = record_date;
        }
    }

    pub fn hardware_measurement_type(&self) -> Option<HardwareMeasurementType> {
        match self.hardware_type {
            None | Some(HostHardwareType::Physical) => Some(HardwareMeasurementType::Physical),
            Some(HostHardwareType::Virtualized) => Some(HardwareMeasurementType::Virtual),
            Some(HostHardwareType::Cloud) => self
                .cloud_provider
                .as_deref()
                .and_then(HardwareMeasurementType::from_cloud_provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket(product: &str) -> HostBucket {
        HostBucket::new(
            UsageKey::any(product),
            false,
            HardwareMeasurementType::Physical,
            4,
            1,
        )
    }

    #[test]
    fn stale_buckets_are_cleared_unless_reasserted() {
        let mut host = Host::new("org1", "i-1", HBI_HOST);
        host.add_bucket(bucket("RHEL"));
        host.add_bucket(bucket("OpenShift"));

        host.mark_buckets_stale();
        host.add_bucket(bucket("RHEL"));
        assert_eq!(host.clear_stale_buckets(), 1);

        assert_eq!(host.buckets.len(), 1);
        assert!(host.buckets.keys().all(|k| k.usage_key.product_id == "RHEL"));
    }

    #[test]
    fn monthly_totals_accumulate_per_month() {
        let mut host = Host::new("org1", "i-1", "rosa Instance");
        let jan = Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        host.add_to_monthly_total(jan, MetricId::cores(), 2.0);
        host.add_to_monthly_total(jan, MetricId::cores(), 3.0);
        host.add_to_monthly_total(feb, MetricId::cores(), 1.0);

        assert_eq!(host.monthly_total("2024-01", &MetricId::cores()), Some(5.0));
        assert_eq!(host.monthly_total("2024-02", &MetricId::cores()), Some(1.0));
    }

    #[test]
    fn record_date_only_moves_forward() {
        let mut host = Host::new("org1", "i-1", "rosa Instance");
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        host.set_last_applied_event_record_date("rosa Instance", late);
        host.set_last_applied_event_record_date("rosa Instance", early);
        assert_eq!(host.last_applied_event_record_date("rosa Instance"), Some(late));
    }

    #[test]
    fn cloud_hosts_measure_against_their_provider() {
        let mut host = Host::new("org1", "i-1", HBI_HOST);
        host.hardware_type = Some(HostHardwareType::Cloud);
        host.cloud_provider = Some("azure".to_string());
        assert_eq!(
            host.hardware_measurement_type(),
            Some(HardwareMeasurementType::Azure)
        );
        host.cloud_provider = None;
        assert_eq!(host.hardware_measurement_type(), None);
    }
}
