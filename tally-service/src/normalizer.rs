//! Turns raw inventory facts into [`NormalizedFacts`].

use crate::clock::ApplicationClock;
use crate::correlator::OrgHostsData;
use crate::models::facts::non_empty;
use crate::models::{
    HardwareMeasurementType, HostFacts, HostHardwareType, NormalizedFacts, ServiceLevel, Usage,
};
use crate::registry::{ProductRegistry, ProductTagLookup};
use chrono::Duration;
use std::sync::Arc;

pub struct FactNormalizer {
    registry: Arc<ProductRegistry>,
    clock: ApplicationClock,
    rhsm_sync_threshold: Duration,
}

impl FactNormalizer {
    pub fn new(
        registry: Arc<ProductRegistry>,
        clock: ApplicationClock,
        rhsm_sync_threshold_days: i64,
    ) -> Self {
        Self {
            registry,
            clock,
            rhsm_sync_threshold: Duration::days(rhsm_sync_threshold_days),
        }
    }

    pub fn normalize(&self, facts: &HostFacts, hypervisors: &OrgHostsData) -> NormalizedFacts {
        let hypervisor_uuid = facts.effective_hypervisor_uuid().map(str::to_string);
        let is_virtual = facts.is_virtual.unwrap_or(false)
            || non_empty(facts.satellite_hypervisor_uuid.as_deref()).is_some()
            || facts
                .infrastructure_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("virtual"));
        let is_hypervisor_unknown = is_virtual
            && hypervisor_uuid
                .as_deref()
                .is_none_or(|uuid| !hypervisors.is_mapped_hypervisor(uuid));
        let is_hypervisor = facts
            .subscription_manager_id
            .as_deref()
            .is_some_and(|id| hypervisors.is_mapped_hypervisor(id));

        let cloud_provider_type = facts
            .cloud_provider
            .as_deref()
            .and_then(HardwareMeasurementType::from_cloud_provider);
        let hardware_type = if cloud_provider_type.is_some() {
            HostHardwareType::Cloud
        } else if is_virtual {
            HostHardwareType::Virtualized
        } else {
            HostHardwareType::Physical
        };

        let rhsm_current = self.is_rhsm_current(facts);
        let (role, sla, usage) = if rhsm_current {
            (&facts.rhsm_role, &facts.rhsm_sla, &facts.rhsm_usage)
        } else {
            (&facts.satellite_role, &facts.satellite_sla, &facts.satellite_usage)
        };

        let products = self.registry.product_tags(&ProductTagLookup {
            role: non_empty(role.as_deref()),
            engineering_ids: &facts.product_ids,
            arch: non_empty(facts.arch.as_deref()),
            payg: Some(false),
        });
        if products.is_empty() {
            tracing::debug!(
                org_id = %facts.org_id,
                inventory_id = %facts.inventory_id,
                role = ?role,
                arch = ?facts.arch,
                "No product mapping for system"
            );
        }

        NormalizedFacts {
            org_id: facts.org_id.clone(),
            instance_id: facts.instance_id().to_string(),
            inventory_id: Some(facts.inventory_id.clone()),
            insights_id: facts.insights_id.clone(),
            subscription_manager_id: facts.subscription_manager_id.clone(),
            display_name: facts.display_name.clone(),
            owner_id: facts.owner_id.clone(),
            products,
            sla: sla.as_deref().map(ServiceLevel::from_str).unwrap_or_default(),
            usage: usage.as_deref().map(Usage::from_str).unwrap_or_default(),
            cores: facts.cores.unwrap_or(0).max(0),
            sockets: facts.sockets.unwrap_or(0).max(0),
            is_virtual,
            is_hypervisor,
            is_hypervisor_unknown,
            hypervisor_uuid,
            hardware_type: Some(hardware_type),
            cloud_provider_type,
        }
    }

    /// RHSM-reported values are trusted only while the last sync is recent.
    fn is_rhsm_current(&self, facts: &HostFacts) -> bool {
        match facts.sync_timestamp {
            Some(synced) => self.clock.now() - synced <= self.rhsm_sync_threshold,
            None => facts.rhsm_role.is_some() || facts.rhsm_sla.is_some(),
        }
    }
}
