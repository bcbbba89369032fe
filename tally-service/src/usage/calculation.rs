use crate::error::TallyError;
use crate::models::{HardwareMeasurementType, MetricId, UsageKey};
use std::collections::{BTreeMap, BTreeSet};

/// Accumulated value per metric for one hardware measurement type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Totals {
    values: BTreeMap<MetricId, f64>,
}

impl Totals {
    pub fn get(&self, metric_id: &MetricId) -> Option<f64> {
        self.values.get(metric_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricId, &f64)> {
        self.values.iter()
    }

    fn increment(&mut self, metric_id: MetricId, value: f64) {
        *self.values.entry(metric_id).or_insert(0.0) += value;
    }
}

/// Usage for one [`UsageKey`], broken down by hardware measurement type.
///
/// `TOTAL` is maintained on every [`add`](Self::add) and always equals the sum
/// of the other types for each metric.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageCalculation {
    key: UsageKey,
    mappings: BTreeMap<HardwareMeasurementType, Totals>,
}

impl UsageCalculation {
    pub fn new(key: UsageKey) -> Self {
        Self {
            key,
            mappings: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &UsageKey {
        &self.key
    }

    pub fn add(&mut self, measurement_type: HardwareMeasurementType, metric_id: MetricId, value: f64) {
        if measurement_type == HardwareMeasurementType::Total {
            tracing::warn!(key = %self.key, metric = %metric_id, "Ignoring direct add to TOTAL");
            return;
        }
        self.mappings
            .entry(measurement_type)
            .or_default()
            .increment(metric_id.clone(), value);
        self.mappings
            .entry(HardwareMeasurementType::Total)
            .or_default()
            .increment(metric_id, value);
    }

    /// `None` when the type was never added to, which is not the same as zero usage.
    pub fn get_totals(&self, measurement_type: HardwareMeasurementType) -> Option<&Totals> {
        self.mappings.get(&measurement_type)
    }

    pub fn has_measurements(&self) -> bool {
        !self.mappings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HardwareMeasurementType, &Totals)> {
        self.mappings.iter()
    }

    pub fn add_physical(&mut self, cores: i32, sockets: i32, instances: i32) {
        self.add_hardware(HardwareMeasurementType::Physical, cores, sockets, instances);
    }

    pub fn add_hypervisor(&mut self, cores: i32, sockets: i32, instances: i32) {
        self.add_hardware(HardwareMeasurementType::Hypervisor, cores, sockets, instances);
    }

    /// Guests whose hypervisor is unknown land here too.
    pub fn add_virtual(&mut self, cores: i32, sockets: i32, instances: i32) {
        self.add_hardware(HardwareMeasurementType::Virtual, cores, sockets, instances);
    }

    pub fn add_cloud_provider(
        &mut self,
        cloud_type: HardwareMeasurementType,
        cores: i32,
        sockets: i32,
        instances: i32,
    ) -> Result<(), TallyError> {
        if !cloud_type.is_cloud_provider() {
            return Err(TallyError::UnmappableFact(format!(
                "{} is not a supported cloud provider",
                cloud_type
            )));
        }
        self.add_hardware(cloud_type, cores, sockets, instances);
        Ok(())
    }

    /// Externally reported concurrent instances. The source reports no cores, so
    /// each instance counts as one socket.
    pub fn add_cloudigrade(&mut self, instances: i32) {
        let reported = self
            .get_totals(HardwareMeasurementType::Aws)
            .and_then(|t| t.get(&MetricId::instances()));
        if let Some(inventory) = reported.filter(|i| *i != instances as f64) {
            tracing::warn!(
                key = %self.key,
                inventory,
                reported = instances,
                "AWS instance counts differ by source"
            );
        }
        self.add_hardware(HardwareMeasurementType::AwsCloudigrade, 0, instances, instances);
    }

    fn add_hardware(
        &mut self,
        measurement_type: HardwareMeasurementType,
        cores: i32,
        sockets: i32,
        instances: i32,
    ) {
        self.add(measurement_type, MetricId::cores(), cores as f64);
        self.add(measurement_type, MetricId::sockets(), sockets as f64);
        self.add(measurement_type, MetricId::instances(), instances as f64);
    }
}

/// All usage calculations for one organization over one tally window.
#[derive(Debug, Clone)]
pub struct AccountUsageCalculation {
    org_id: String,
    owner_id: Option<String>,
    calculations: BTreeMap<UsageKey, UsageCalculation>,
    products: BTreeSet<String>,
}

impl AccountUsageCalculation {
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            owner_id: None,
            calculations: BTreeMap::new(),
            products: BTreeSet::new(),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    /// Record the org's owner. A second, different owner in the same pass is an
    /// invariant violation; `None` never overwrites a known owner.
    pub fn set_owner(&mut self, owner_id: Option<&str>) -> Result<(), TallyError> {
        let Some(owner_id) = owner_id else {
            return Ok(());
        };
        if let Some(current) = &self.owner_id {
            if !current.eq_ignore_ascii_case(owner_id) {
                return Err(TallyError::InvariantViolation {
                    org_id: self.org_id.clone(),
                    message: format!(
                        "Attempt to set a different owner for an org: {}:{}",
                        current, owner_id
                    ),
                });
            }
        }
        self.owner_id = Some(owner_id.to_string());
        Ok(())
    }

    /// Returns the calculation for `key`, creating it on first use.
    pub fn get_or_create_calculation(&mut self, key: &UsageKey) -> &mut UsageCalculation {
        self.products.insert(key.product_id.clone());
        self.calculations
            .entry(key.clone())
            .or_insert_with(|| UsageCalculation::new(key.clone()))
    }

    pub fn add_usage(
        &mut self,
        key: &UsageKey,
        measurement_type: HardwareMeasurementType,
        metric_id: MetricId,
        value: f64,
    ) {
        self.get_or_create_calculation(key)
            .add(measurement_type, metric_id, value);
    }

    pub fn get_calculation(&self, key: &UsageKey) -> Option<&UsageCalculation> {
        self.calculations.get(key)
    }

    pub fn contains_calculation(&self, key: &UsageKey) -> bool {
        self.calculations.contains_key(key)
    }

    pub fn calculations(&self) -> impl Iterator<Item = &UsageCalculation> {
        self.calculations.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &UsageKey> {
        self.calculations.keys()
    }

    pub fn products(&self) -> &BTreeSet<String> {
        &self.products
    }

    pub fn is_empty(&self) -> bool {
        self.calculations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dimension, ServiceLevel};

    fn key() -> UsageKey {
        UsageKey::any("RHEL")
    }

    #[test]
    fn total_tracks_every_add() {
        let mut calc = UsageCalculation::new(key());
        calc.add(HardwareMeasurementType::Physical, MetricId::cores(), 4.0);
        calc.add(HardwareMeasurementType::Virtual, MetricId::cores(), 2.5);
        calc.add(HardwareMeasurementType::Aws, MetricId::cores(), 1.5);
        calc.add(HardwareMeasurementType::Physical, MetricId::cores(), 1.0);

        let total = calc.get_totals(HardwareMeasurementType::Total).unwrap();
        assert_eq!(total.get(&MetricId::cores()), Some(9.0));

        let sum: f64 = calc
            .iter()
            .filter(|(t, _)| **t != HardwareMeasurementType::Total)
            .filter_map(|(_, totals)| totals.get(&MetricId::cores()))
            .sum();
        assert_eq!(sum, 9.0);
    }

    #[test]
    fn unseen_type_is_none_not_zero() {
        let mut calc = UsageCalculation::new(key());
        assert!(calc.get_totals(HardwareMeasurementType::Hypervisor).is_none());
        calc.add(HardwareMeasurementType::Hypervisor, MetricId::sockets(), 0.0);
        let totals = calc.get_totals(HardwareMeasurementType::Hypervisor).unwrap();
        assert_eq!(totals.get(&MetricId::sockets()), Some(0.0));
    }

    #[test]
    fn direct_total_add_is_ignored() {
        let mut calc = UsageCalculation::new(key());
        calc.add(HardwareMeasurementType::Total, MetricId::cores(), 10.0);
        assert!(!calc.has_measurements());
    }

    #[test]
    fn hardware_helpers_add_cores_sockets_and_one_instance() {
        let mut calc = UsageCalculation::new(key());
        calc.add_physical(8, 2, 1);
        calc.add_virtual(2, 1, 1);
        let physical = calc.get_totals(HardwareMeasurementType::Physical).unwrap();
        assert_eq!(physical.get(&MetricId::cores()), Some(8.0));
        assert_eq!(physical.get(&MetricId::sockets()), Some(2.0));
        let total = calc.get_totals(HardwareMeasurementType::Total).unwrap();
        assert_eq!(total.get(&MetricId::instances()), Some(2.0));
    }

    #[test]
    fn cloud_helper_rejects_non_cloud_types() {
        let mut calc = UsageCalculation::new(key());
        assert!(calc
            .add_cloud_provider(HardwareMeasurementType::Physical, 1, 1, 1)
            .is_err());
        assert!(calc
            .add_cloud_provider(HardwareMeasurementType::Azure, 4, 1, 1)
            .is_ok());
        assert!(calc.get_totals(HardwareMeasurementType::Physical).is_none());
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut account = AccountUsageCalculation::new("org1");
        account
            .get_or_create_calculation(&key())
            .add_physical(2, 1, 1);
        account
            .get_or_create_calculation(&key())
            .add_physical(2, 1, 1);
        assert_eq!(account.calculations().count(), 1);
        let total = account
            .get_calculation(&key())
            .and_then(|c| c.get_totals(HardwareMeasurementType::Total))
            .and_then(|t| t.get(&MetricId::cores()));
        assert_eq!(total, Some(4.0));
        assert!(account.products().contains("RHEL"));
    }

    #[test]
    fn conflicting_owner_is_rejected() {
        let mut account = AccountUsageCalculation::new("org1");
        account.set_owner(Some("owner-a")).unwrap();
        account.set_owner(None).unwrap();
        account.set_owner(Some("OWNER-A")).unwrap();
        let err = account.set_owner(Some("owner-b")).unwrap_err();
        assert!(matches!(err, TallyError::InvariantViolation { .. }));
        assert_eq!(account.owner_id(), Some("owner-a"));
    }

    #[test]
    fn distinct_keys_stay_separate() {
        let mut account = AccountUsageCalculation::new("org1");
        let premium = UsageKey::new(
            "RHEL",
            Dimension::Specific(ServiceLevel::Premium),
            Dimension::Any,
            Dimension::Any,
            Dimension::Any,
        );
        account.add_usage(&premium, HardwareMeasurementType::Physical, MetricId::cores(), 2.0);
        account.add_usage(&key(), HardwareMeasurementType::Physical, MetricId::cores(), 3.0);
        assert_eq!(account.calculations().count(), 2);
    }
}
