use crate::models::dimensions::{BillingProvider, ServiceLevel, Usage};
use crate::models::host::HostHardwareType;
use crate::models::measurement::{HardwareMeasurementType, MetricId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventHardwareType {
    Physical,
    Virtual,
    Cloud,
}

impl From<EventHardwareType> for HostHardwareType {
    fn from(value: EventHardwareType) -> Self {
        match value {
            EventHardwareType::Physical => HostHardwareType::Physical,
            EventHardwareType::Virtual => HostHardwareType::Virtualized,
            EventHardwareType::Cloud => HostHardwareType::Cloud,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(alias = "uom")]
    pub metric_id: MetricId,
    pub value: f64,
}

/// A timestamped metric event for one instance.
///
/// `timestamp` is business time (when the usage happened) and drives late-event
/// detection against the host's `last_seen`. `record_date` is ingestion time and
/// drives "already applied" bookkeeping; the ingestion endpoint overwrites it
/// with the time of receipt. The two are never compared to each other.
///
/// Optional descriptive fields only overwrite the host when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub org_id: String,
    pub instance_id: String,
    pub service_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub record_date: DateTime<Utc>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub inventory_id: Option<String>,
    #[serde(default)]
    pub hypervisor_uuid: Option<String>,
    #[serde(default)]
    pub subscription_manager_id: Option<String>,
    #[serde(default)]
    pub hardware_type: Option<EventHardwareType>,
    #[serde(default)]
    pub cloud_provider: Option<String>,
    #[serde(default)]
    pub billing_provider: Option<BillingProvider>,
    #[serde(default)]
    pub billing_account_id: Option<String>,
    #[serde(default)]
    pub sla: Option<ServiceLevel>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub product_ids: Vec<String>,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl Event {
    pub fn cloud_measurement_type(&self) -> Option<HardwareMeasurementType> {
        self.cloud_provider
            .as_deref()
            .and_then(HardwareMeasurementType::from_cloud_provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_event_deserializes_with_defaults() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "org_id": "org1",
            "instance_id": "i-1",
            "service_type": "rosa Instance",
            "timestamp": "2024-03-01T10:00:00Z",
            "measurements": [{"uom": "Instance-hours", "value": 1.0}]
        }))
        .unwrap();

        assert_eq!(event.measurements[0].metric_id, MetricId::instance_hours());
        assert!(event.product_ids.is_empty());
        assert!(event.hardware_type.is_none());
    }
}
