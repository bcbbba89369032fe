//! Per-product usage collectors.

use crate::error::TallyError;
use crate::models::{HardwareMeasurementType, HostBucket, NormalizedFacts, UsageKey};
use crate::registry::ProductRegistry;
use crate::usage::UsageCalculation;
use std::collections::HashMap;
use std::sync::Arc;

/// How one product counts a normalized system.
pub trait ProductUsageCollector: Send + Sync {
    /// Add the system's own usage to `calc`, returning the bucket it was counted in.
    /// `None` means the system contributes nothing by itself for this product.
    fn collect(
        &self,
        calc: &mut UsageCalculation,
        facts: &NormalizedFacts,
    ) -> Result<Option<HostBucket>, TallyError>;

    /// Add a hypervisor's usage on behalf of its mapped guests.
    fn collect_for_hypervisor(&self, calc: &mut UsageCalculation, hypervisor: &NormalizedFacts);

    fn build_bucket_for_hypervisor(
        &self,
        key: &UsageKey,
        hypervisor: &NormalizedFacts,
    ) -> Option<HostBucket>;
}

/// Every system counts itself: cloud under its provider, guests as VIRTUAL,
/// everything else as PHYSICAL.
#[derive(Debug, Default)]
pub struct DefaultCollector;

impl ProductUsageCollector for DefaultCollector {
    fn collect(
        &self,
        calc: &mut UsageCalculation,
        facts: &NormalizedFacts,
    ) -> Result<Option<HostBucket>, TallyError> {
        let measurement_type = if let Some(cloud_type) = facts.cloud_provider_type {
            calc.add_cloud_provider(cloud_type, facts.cores, facts.sockets, 1)?;
            cloud_type
        } else if facts.is_virtual {
            calc.add_virtual(facts.cores, facts.sockets, 1);
            HardwareMeasurementType::Virtual
        } else {
            calc.add_physical(facts.cores, facts.sockets, 1);
            HardwareMeasurementType::Physical
        };

        Ok(Some(HostBucket::new(
            calc.key().clone(),
            false,
            measurement_type,
            facts.cores,
            facts.sockets,
        )))
    }

    fn collect_for_hypervisor(&self, _calc: &mut UsageCalculation, _hypervisor: &NormalizedFacts) {}

    fn build_bucket_for_hypervisor(
        &self,
        _key: &UsageKey,
        _hypervisor: &NormalizedFacts,
    ) -> Option<HostBucket> {
        None
    }
}

/// Guests on a known hypervisor are paid for by the hypervisor: the guest adds
/// nothing, and the hypervisor is counted once as HYPERVISOR per usage key its
/// guests run under. Guests of unknown hypervisors fall back to VIRTUAL.
#[derive(Debug, Default)]
pub struct HypervisorDerivedCollector;

impl ProductUsageCollector for HypervisorDerivedCollector {
    fn collect(
        &self,
        calc: &mut UsageCalculation,
        facts: &NormalizedFacts,
    ) -> Result<Option<HostBucket>, TallyError> {
        if facts.is_mapped_guest() || facts.is_hypervisor {
            return Ok(None);
        }
        DefaultCollector.collect(calc, facts)
    }

    fn collect_for_hypervisor(&self, calc: &mut UsageCalculation, hypervisor: &NormalizedFacts) {
        calc.add_hypervisor(hypervisor.cores, hypervisor.sockets, 1);
    }

    fn build_bucket_for_hypervisor(
        &self,
        key: &UsageKey,
        hypervisor: &NormalizedFacts,
    ) -> Option<HostBucket> {
        Some(HostBucket::new(
            key.clone(),
            true,
            HardwareMeasurementType::Hypervisor,
            hypervisor.cores,
            hypervisor.sockets,
        ))
    }
}

/// Collectors keyed by product tag, resolved once from the product registry.
#[derive(Clone)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn ProductUsageCollector>>,
    fallback: Arc<dyn ProductUsageCollector>,
}

impl CollectorRegistry {
    pub fn from_registry(registry: &ProductRegistry) -> Self {
        let derived: Arc<dyn ProductUsageCollector> = Arc::new(HypervisorDerivedCollector);
        let default: Arc<dyn ProductUsageCollector> = Arc::new(DefaultCollector);

        let collectors = registry
            .tags()
            .into_iter()
            .map(|tag| {
                let collector = if registry.is_hypervisor_derived(&tag) {
                    derived.clone()
                } else {
                    default.clone()
                };
                (tag, collector)
            })
            .collect();

        Self {
            collectors,
            fallback: default,
        }
    }

    pub fn get(&self, product_tag: &str) -> &dyn ProductUsageCollector {
        self.collectors
            .get(product_tag)
            .unwrap_or(&self.fallback)
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricId;

    fn facts() -> NormalizedFacts {
        NormalizedFacts {
            cores: 4,
            sockets: 2,
            ..Default::default()
        }
    }

    fn total(calc: &UsageCalculation, t: HardwareMeasurementType) -> Option<f64> {
        calc.get_totals(t).and_then(|totals| totals.get(&MetricId::cores()))
    }

    #[test]
    fn default_collector_counts_guests_as_virtual() {
        let mut calc = UsageCalculation::new(UsageKey::any("OpenShift Container Platform"));
        let guest = NormalizedFacts {
            is_virtual: true,
            hypervisor_uuid: Some("hyp-1".into()),
            ..facts()
        };
        let bucket = DefaultCollector.collect(&mut calc, &guest).unwrap().unwrap();
        assert_eq!(bucket.measurement_type, HardwareMeasurementType::Virtual);
        assert_eq!(total(&calc, HardwareMeasurementType::Virtual), Some(4.0));
    }

    #[test]
    fn default_collector_counts_cloud_under_provider() {
        let mut calc = UsageCalculation::new(UsageKey::any("RHEL for x86"));
        let cloud = NormalizedFacts {
            cloud_provider_type: Some(HardwareMeasurementType::Aws),
            is_virtual: true,
            ..facts()
        };
        DefaultCollector.collect(&mut calc, &cloud).unwrap();
        assert_eq!(total(&calc, HardwareMeasurementType::Aws), Some(4.0));
        assert!(calc.get_totals(HardwareMeasurementType::Virtual).is_none());
    }

    #[test]
    fn derived_collector_skips_mapped_guests() {
        let mut calc = UsageCalculation::new(UsageKey::any("RHEL for x86"));
        let guest = NormalizedFacts {
            is_virtual: true,
            hypervisor_uuid: Some("hyp-1".into()),
            ..facts()
        };
        assert!(HypervisorDerivedCollector
            .collect(&mut calc, &guest)
            .unwrap()
            .is_none());
        assert!(!calc.has_measurements());

        let unmapped = NormalizedFacts {
            is_hypervisor_unknown: true,
            ..guest
        };
        HypervisorDerivedCollector.collect(&mut calc, &unmapped).unwrap();
        assert_eq!(total(&calc, HardwareMeasurementType::Virtual), Some(4.0));
    }

    #[test]
    fn derived_collector_counts_hypervisor_once_per_key() {
        let key = UsageKey::any("RHEL for x86");
        let mut calc = UsageCalculation::new(key.clone());
        let hypervisor = NormalizedFacts {
            is_hypervisor: true,
            ..facts()
        };
        HypervisorDerivedCollector.collect_for_hypervisor(&mut calc, &hypervisor);
        let bucket = HypervisorDerivedCollector
            .build_bucket_for_hypervisor(&key, &hypervisor)
            .unwrap();
        assert!(bucket.key.as_hypervisor);
        assert_eq!(total(&calc, HardwareMeasurementType::Hypervisor), Some(4.0));
    }

    #[test]
    fn registry_resolves_collectors_by_tag() {
        let registry = CollectorRegistry::from_registry(&ProductRegistry::builtin().unwrap());
        let guest = NormalizedFacts {
            is_virtual: true,
            hypervisor_uuid: Some("hyp-1".into()),
            ..facts()
        };
        let mut rhel = UsageCalculation::new(UsageKey::any("RHEL for x86"));
        assert!(registry.get("RHEL for x86").collect(&mut rhel, &guest).unwrap().is_none());
        let mut unknown = UsageCalculation::new(UsageKey::any("Unknown"));
        assert!(registry.get("Unknown").collect(&mut unknown, &guest).unwrap().is_some());
    }
}
