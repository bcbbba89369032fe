#![allow(clippy::should_implement_trait)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Source category a measurement is attributed to. `Total` is synthetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HardwareMeasurementType {
    Physical,
    Hypervisor,
    Virtual,
    Aws,
    AwsCloudigrade,
    Azure,
    Alibaba,
    Google,
    Total,
}

impl HardwareMeasurementType {
    pub const CLOUD_PROVIDERS: [HardwareMeasurementType; 4] =
        [Self::Aws, Self::Azure, Self::Alibaba, Self::Google];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Physical => "PHYSICAL",
            Self::Hypervisor => "HYPERVISOR",
            Self::Virtual => "VIRTUAL",
            Self::Aws => "AWS",
            Self::AwsCloudigrade => "AWS_CLOUDIGRADE",
            Self::Azure => "AZURE",
            Self::Alibaba => "ALIBABA",
            Self::Google => "GOOGLE",
            Self::Total => "TOTAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PHYSICAL" => Some(Self::Physical),
            "HYPERVISOR" => Some(Self::Hypervisor),
            "VIRTUAL" => Some(Self::Virtual),
            "AWS" => Some(Self::Aws),
            "AWS_CLOUDIGRADE" => Some(Self::AwsCloudigrade),
            "AZURE" => Some(Self::Azure),
            "ALIBABA" => Some(Self::Alibaba),
            "GOOGLE" => Some(Self::Google),
            "TOTAL" => Some(Self::Total),
            _ => None,
        }
    }

    pub fn is_cloud_provider(&self) -> bool {
        Self::CLOUD_PROVIDERS.contains(self)
    }

    /// Maps a cloud provider name as reported by inventory to its category.
    pub fn from_cloud_provider(provider: &str) -> Option<Self> {
        Self::from_str(provider).filter(|t| t.is_cloud_provider())
    }

    pub fn is_supported_cloud_provider(provider: &str) -> bool {
        Self::from_cloud_provider(provider).is_some()
    }
}

impl fmt::Display for HardwareMeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HardwareMeasurementType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HardwareMeasurementType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("unknown hardware measurement type: {}", s))
        })
    }
}

/// Metric identifier, normalised to upper case with `_` separators
/// (`Instance-hours` and `INSTANCE_HOURS` are the same metric).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct MetricId(String);

impl MetricId {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().replace('-', "_").to_ascii_uppercase())
    }

    pub fn cores() -> Self {
        Self("CORES".to_string())
    }

    pub fn sockets() -> Self {
        Self("SOCKETS".to_string())
    }

    /// Count of systems, used by the nightly host tally.
    pub fn instances() -> Self {
        Self("INSTANCES".to_string())
    }

    pub fn instance_hours() -> Self {
        Self("INSTANCE_HOURS".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MetricId {
    fn from(raw: String) -> Self {
        MetricId::new(&raw)
    }
}

impl From<MetricId> for String {
    fn from(id: MetricId) -> Self {
        id.0
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(hardware measurement type, metric)` coordinate of a snapshot measurement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub hardware_measurement_type: HardwareMeasurementType,
    pub metric_id: MetricId,
}

impl MeasurementKey {
    pub fn new(hardware_measurement_type: HardwareMeasurementType, metric_id: MetricId) -> Self {
        Self {
            hardware_measurement_type,
            metric_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_ids_are_normalised() {
        assert_eq!(MetricId::new("Instance-hours"), MetricId::instance_hours());
        assert_eq!(MetricId::new(" cores "), MetricId::cores());
        let parsed: MetricId = serde_json::from_str("\"sockets\"").unwrap();
        assert_eq!(parsed, MetricId::sockets());
    }

    #[test]
    fn only_real_clouds_are_cloud_providers() {
        assert_eq!(
            HardwareMeasurementType::from_cloud_provider("aws"),
            Some(HardwareMeasurementType::Aws)
        );
        assert!(HardwareMeasurementType::is_supported_cloud_provider("google"));
        assert!(!HardwareMeasurementType::is_supported_cloud_provider("PHYSICAL"));
        assert!(!HardwareMeasurementType::is_supported_cloud_provider("ibm"));
    }
}
