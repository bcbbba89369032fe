//! Folding metric events into hosts and hour-indexed usage calculations.

use crate::clock::ApplicationClock;
use crate::models::{
    BillingProvider, Dimension, Event, HardwareMeasurementType, Host, HostBucket,
    HostHardwareType, MetricId, UsageKey,
};
use crate::registry::{ProductRegistry, ProductTagLookup};
use crate::services::metrics::{record_event, record_skipped_fact};
use crate::usage::AccountUsageCalculationCache;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Replaced current measurements and advanced `last_seen`.
    Applied,
    /// Older than `last_seen`: counted in monthly totals and hourly usage only.
    Late,
    /// Record date at or before the host's mark for this service type as it
    /// stood before the pass.
    AlreadyApplied,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Late => "late",
            Self::AlreadyApplied => "duplicate",
        }
    }
}

pub struct EventReconciler {
    registry: Arc<ProductRegistry>,
}

impl EventReconciler {
    pub fn new(registry: Arc<ProductRegistry>) -> Self {
        Self { registry }
    }

    /// Apply one event to its host and to the hour it happened in, checking it
    /// against the host's current record date mark.
    pub fn apply(
        &self,
        host: &mut Host,
        event: &Event,
        cache: &mut AccountUsageCalculationCache,
    ) -> EventOutcome {
        let applied_through = host.last_applied_event_record_date(&event.service_type);
        self.apply_after(host, event, applied_through, cache)
    }

    /// Like [`apply`](Self::apply), but only events recorded after
    /// `applied_through` count. Events of one pass arrive in timestamp order,
    /// so their record dates are unordered and must not be compared with each
    /// other.
    pub fn apply_after(
        &self,
        host: &mut Host,
        event: &Event,
        applied_through: Option<DateTime<Utc>>,
        cache: &mut AccountUsageCalculationCache,
    ) -> EventOutcome {
        if applied_through.is_some_and(|applied| event.record_date <= applied) {
            record_event(EventOutcome::AlreadyApplied.as_str());
            return EventOutcome::AlreadyApplied;
        }

        update_descriptors(host, event);
        let measurement_type = measurement_type(host, event);
        let keys = self.usage_keys(event);
        let known_metrics: BTreeSet<MetricId> = keys
            .iter()
            .map(|k| k.product_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .flat_map(|tag| self.registry.metric_ids(tag))
            .collect();
        if keys.is_empty() {
            record_skipped_fact("no_products");
            warn!(
                org_id = %event.org_id,
                instance_id = %event.instance_id,
                role = ?event.role,
                product_ids = ?event.product_ids,
                "No product mapping for event"
            );
        }

        let late = host
            .last_seen
            .is_some_and(|last_seen| event.timestamp < last_seen);
        let hour = ApplicationClock::start_of_hour(event.timestamp);
        let reported: BTreeSet<MetricId> =
            event.measurements.iter().map(|m| m.metric_id.clone()).collect();

        for measurement in &event.measurements {
            host.add_to_monthly_total(
                event.timestamp,
                measurement.metric_id.clone(),
                measurement.value,
            );
            if !late {
                host.set_measurement(measurement.metric_id.clone(), measurement.value);
            }
            if !known_metrics.contains(&measurement.metric_id) {
                if !keys.is_empty() {
                    record_skipped_fact("unknown_metric");
                    debug!(
                        org_id = %event.org_id,
                        metric = %measurement.metric_id,
                        "Metric not tracked for event products"
                    );
                }
                continue;
            }
            let account = cache.get_or_create(hour);
            for key in &keys {
                account.add_usage(
                    key,
                    measurement_type,
                    measurement.metric_id.clone(),
                    measurement.value,
                );
            }
        }

        if !late {
            host.retain_measurements(&reported);
            host.last_seen = Some(event.timestamp);
        }

        let cores = event
            .measurements
            .iter()
            .find(|m| m.metric_id == MetricId::cores())
            .map_or(0, |m| m.value.round() as i32);
        for key in keys {
            host.add_bucket(HostBucket::new(key, false, measurement_type, cores, 0));
        }

        host.set_last_applied_event_record_date(&event.service_type, event.record_date);
        cache.mark_event_applied(event.record_date);

        let outcome = if late {
            EventOutcome::Late
        } else {
            EventOutcome::Applied
        };
        record_event(outcome.as_str());
        outcome
    }

    /// Products from the event's role or engineering ids, crossed with the
    /// specific and wildcard value of every dimension. Absent sla and usage fall
    /// back to the service type defaults, then to empty.
    pub fn usage_keys(&self, event: &Event) -> BTreeSet<UsageKey> {
        let products = self.registry.product_tags(&ProductTagLookup {
            role: event.role.as_deref(),
            engineering_ids: &event.product_ids,
            arch: None,
            payg: Some(true),
        });
        let sla = event
            .sla
            .or_else(|| self.registry.default_sla(&event.service_type))
            .unwrap_or_default();
        let usage = event
            .usage
            .or_else(|| self.registry.default_usage(&event.service_type))
            .unwrap_or_default();
        let billing_provider = event.billing_provider.unwrap_or(BillingProvider::RedHat);
        let billing_account_id = event.billing_account_id.clone().unwrap_or_default();

        UsageKey::cartesian(
            &products,
            &Dimension::with_wildcard(sla),
            &Dimension::with_wildcard(usage),
            &Dimension::with_wildcard(billing_provider),
            &Dimension::with_wildcard(billing_account_id),
        )
    }
}

fn update_descriptors(host: &mut Host, event: &Event) {
    let overwrite = |target: &mut Option<String>, value: &Option<String>| {
        if value.is_some() {
            target.clone_from(value);
        }
    };
    overwrite(&mut host.display_name, &event.display_name);
    overwrite(&mut host.inventory_id, &event.inventory_id);
    overwrite(&mut host.hypervisor_uuid, &event.hypervisor_uuid);
    overwrite(&mut host.subscription_manager_id, &event.subscription_manager_id);
    overwrite(&mut host.cloud_provider, &event.cloud_provider);
    overwrite(&mut host.billing_account_id, &event.billing_account_id);
    let billing_provider = event.billing_provider.unwrap_or(BillingProvider::RedHat);
    host.billing_provider = Some(billing_provider.as_str().to_string());
    if let Some(hardware_type) = event.hardware_type {
        host.hardware_type = Some(hardware_type.into());
    } else if event.cloud_measurement_type().is_some() {
        host.hardware_type = Some(HostHardwareType::Cloud);
    }
}

fn measurement_type(host: &Host, event: &Event) -> HardwareMeasurementType {
    event
        .cloud_measurement_type()
        .or_else(|| host.hardware_measurement_type())
        .unwrap_or(HardwareMeasurementType::Physical)
}

/// Hosts touched by one hourly pass, keyed by `(instance_id, service_type)`.
///
/// Record date marks are captured when the batch is built and stay fixed for
/// the pass. A host's buckets are marked stale the first time an event for it is applied
/// and whatever was not re-asserted is cleared by [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct EventHostBatch {
    hosts: HashMap<(String, String), Host>,
    marks: HashMap<(String, String), DateTime<Utc>>,
    touched: BTreeSet<(String, String)>,
}

impl EventHostBatch {
    pub fn new(existing: impl IntoIterator<Item = Host>) -> Self {
        let hosts: HashMap<_, _> = existing
            .into_iter()
            .map(|host| ((host.instance_id.clone(), host.instance_type.clone()), host))
            .collect();
        let marks = hosts
            .iter()
            .filter_map(|(id, host)| {
                host.last_applied_event_record_date(&id.1)
                    .map(|mark| (id.clone(), mark))
            })
            .collect();
        Self {
            hosts,
            marks,
            touched: BTreeSet::new(),
        }
    }

    pub fn apply(
        &mut self,
        reconciler: &EventReconciler,
        event: &Event,
        cache: &mut AccountUsageCalculationCache,
    ) -> EventOutcome {
        let id = (event.instance_id.clone(), event.service_type.clone());
        let host = self.hosts.entry(id.clone()).or_insert_with(|| {
            Host::new(&event.org_id, &event.instance_id, &event.service_type)
        });
        let applied_through = self.marks.get(&id).copied();
        let already_applied = applied_through.is_some_and(|applied| event.record_date <= applied);
        if !already_applied && !self.touched.contains(&id) {
            host.mark_buckets_stale();
            self.touched.insert(id);
        }
        reconciler.apply_after(host, event, applied_through, cache)
    }

    /// Hosts that had at least one event applied, with stale buckets removed.
    pub fn finish(self) -> Vec<Host> {
        let touched = self.touched;
        self.hosts
            .into_iter()
            .filter(|(id, _)| touched.contains(id))
            .map(|(_, mut host)| {
                host.clear_stale_buckets();
                host
            })
            .collect()
    }
}
