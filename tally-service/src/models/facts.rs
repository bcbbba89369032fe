use crate::models::dimensions::{ServiceLevel, Usage};
use crate::models::host::HostHardwareType;
use crate::models::measurement::HardwareMeasurementType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;

/// One inventory system as reported upstream, before normalization.
#[derive(Debug, Clone, Default, PartialEq, FromRow, Serialize, Deserialize)]
pub struct HostFacts {
    pub org_id: String,
    pub inventory_id: String,
    pub provider_id: Option<String>,
    pub insights_id: Option<String>,
    pub display_name: Option<String>,
    pub subscription_manager_id: Option<String>,
    pub owner_id: Option<String>,
    pub hypervisor_uuid: Option<String>,
    pub satellite_hypervisor_uuid: Option<String>,
    pub infrastructure_type: Option<String>,
    pub cloud_provider: Option<String>,
    pub is_virtual: Option<bool>,
    pub cores: Option<i32>,
    pub sockets: Option<i32>,
    pub arch: Option<String>,
    pub rhsm_role: Option<String>,
    pub rhsm_sla: Option<String>,
    pub rhsm_usage: Option<String>,
    pub sync_timestamp: Option<DateTime<Utc>>,
    pub satellite_role: Option<String>,
    pub satellite_sla: Option<String>,
    pub satellite_usage: Option<String>,
    #[sqlx(default)]
    #[serde(default)]
    pub product_ids: Vec<String>,
}

impl HostFacts {
    /// Hypervisor this system runs on, preferring the satellite-reported id.
    pub fn effective_hypervisor_uuid(&self) -> Option<&str> {
        non_empty(self.satellite_hypervisor_uuid.as_deref())
            .or_else(|| non_empty(self.hypervisor_uuid.as_deref()))
    }

    /// Instance id: the cloud provider id when present, else the inventory id.
    pub fn instance_id(&self) -> &str {
        non_empty(self.provider_id.as_deref()).unwrap_or(&self.inventory_id)
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Facts after role/product mapping and hardware classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFacts {
    pub org_id: String,
    pub instance_id: String,
    pub inventory_id: Option<String>,
    pub insights_id: Option<String>,
    pub subscription_manager_id: Option<String>,
    pub display_name: Option<String>,
    pub owner_id: Option<String>,
    pub products: BTreeSet<String>,
    pub sla: ServiceLevel,
    pub usage: Usage,
    pub cores: i32,
    pub sockets: i32,
    pub is_virtual: bool,
    pub is_hypervisor: bool,
    pub is_hypervisor_unknown: bool,
    pub hypervisor_uuid: Option<String>,
    pub hardware_type: Option<HostHardwareType>,
    pub cloud_provider_type: Option<HardwareMeasurementType>,
}

impl NormalizedFacts {
    pub fn is_cloud(&self) -> bool {
        self.cloud_provider_type.is_some()
    }

    /// Guest whose hypervisor was resolved within the current context.
    pub fn is_mapped_guest(&self) -> bool {
        self.is_virtual && self.hypervisor_uuid.is_some() && !self.is_hypervisor_unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satellite_hypervisor_wins() {
        let facts = HostFacts {
            hypervisor_uuid: Some("hbi-hyp".into()),
            satellite_hypervisor_uuid: Some("sat-hyp".into()),
            ..Default::default()
        };
        assert_eq!(facts.effective_hypervisor_uuid(), Some("sat-hyp"));

        let blank_satellite = HostFacts {
            hypervisor_uuid: Some("hbi-hyp".into()),
            satellite_hypervisor_uuid: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank_satellite.effective_hypervisor_uuid(), Some("hbi-hyp"));
    }

    #[test]
    fn provider_id_is_preferred_instance_id() {
        let mut facts = HostFacts {
            inventory_id: "inv-1".into(),
            ..Default::default()
        };
        assert_eq!(facts.instance_id(), "inv-1");
        facts.provider_id = Some("i-0abc".into());
        assert_eq!(facts.instance_id(), "i-0abc");
    }
}
