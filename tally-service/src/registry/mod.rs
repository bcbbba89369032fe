//! Product registry: maps roles and engineering ids to product tags.
//!
//! Loaded once at startup and shared read-only through an `Arc`.

pub mod collector;

pub use collector::{
    CollectorRegistry, DefaultCollector, HypervisorDerivedCollector, ProductUsageCollector,
};

use crate::models::{MetricId, ServiceLevel, Usage};
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

const BUILTIN_REGISTRY: &str = include_str!("../../config/product_registry.json");

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefinitionDefaults {
    #[serde(default)]
    pub sla: Option<ServiceLevel>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub tag: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub engineering_ids: BTreeSet<String>,
    /// Empty means any architecture.
    #[serde(default)]
    pub arches: BTreeSet<String>,
}

impl Variant {
    fn matches_arch(&self, arch: Option<&str>) -> bool {
        match arch {
            Some(arch) if !self.arches.is_empty() => self.arches.contains(arch),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDefinition {
    pub id: String,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub payg: bool,
    /// Guests with a known hypervisor are counted through the hypervisor.
    #[serde(default)]
    pub hypervisor_derived: bool,
    #[serde(default)]
    pub metrics: Vec<MetricId>,
    #[serde(default)]
    pub defaults: DefinitionDefaults,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    subscriptions: Vec<SubscriptionDefinition>,
}

/// What a fact or event knows about the product it runs.
#[derive(Debug, Clone, Default)]
pub struct ProductTagLookup<'a> {
    pub role: Option<&'a str>,
    pub engineering_ids: &'a [String],
    pub arch: Option<&'a str>,
    /// `Some` restricts the search to payg (or non-payg) definitions.
    pub payg: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ProductRegistry {
    subscriptions: Vec<SubscriptionDefinition>,
    by_tag: HashMap<String, usize>,
}

impl ProductRegistry {
    pub fn new(subscriptions: Vec<SubscriptionDefinition>) -> Self {
        let mut by_tag = HashMap::new();
        for (index, subscription) in subscriptions.iter().enumerate() {
            for variant in &subscription.variants {
                by_tag.insert(variant.tag.clone(), index);
            }
        }
        Self {
            subscriptions,
            by_tag,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let file: RegistryFile = serde_json::from_str(json).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid product registry: {}", e))
        })?;
        Ok(Self::new(file.subscriptions))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Failed to read product registry {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// Definitions shipped with the service.
    pub fn builtin() -> Result<Self, AppError> {
        Self::from_json(BUILTIN_REGISTRY)
    }

    /// Load from `path` when given, otherwise fall back to the shipped definitions.
    pub fn load(path: Option<&str>) -> Result<Self, AppError> {
        match path {
            Some(path) => {
                tracing::info!(path = %path, "Loading product registry from file");
                Self::from_file(path)
            }
            None => Self::builtin(),
        }
    }

    pub fn subscriptions(&self) -> &[SubscriptionDefinition] {
        &self.subscriptions
    }

    pub fn definition_for_tag(&self, tag: &str) -> Option<&SubscriptionDefinition> {
        self.by_tag.get(tag).map(|index| &self.subscriptions[*index])
    }

    pub fn tags(&self) -> BTreeSet<String> {
        self.by_tag.keys().cloned().collect()
    }

    /// Tags billed from metric events (`payg`) or from inventory (`!payg`).
    /// The hourly and nightly passes each own one of the two sets.
    pub fn tags_for_payg(&self, payg: bool) -> BTreeSet<String> {
        self.by_tag
            .keys()
            .filter(|tag| self.is_payg(tag) == payg)
            .cloned()
            .collect()
    }

    pub fn is_payg(&self, tag: &str) -> bool {
        self.definition_for_tag(tag).is_some_and(|d| d.payg)
    }

    pub fn is_hypervisor_derived(&self, tag: &str) -> bool {
        self.definition_for_tag(tag)
            .is_some_and(|d| d.hypervisor_derived)
    }

    pub fn metric_ids(&self, tag: &str) -> Vec<MetricId> {
        self.definition_for_tag(tag)
            .map(|d| d.metrics.clone())
            .unwrap_or_default()
    }

    /// Tags of every variant matching the role or one of the engineering ids.
    ///
    /// A role match wins: engineering ids are only consulted when no variant
    /// matches the role.
    pub fn product_tags(&self, lookup: &ProductTagLookup<'_>) -> BTreeSet<String> {
        let candidates = || {
            self.subscriptions
                .iter()
                .filter(|s| lookup.payg.is_none_or(|payg| s.payg == payg))
                .flat_map(|s| s.variants.iter())
                .filter(|v| v.matches_arch(lookup.arch))
        };

        let by_role: BTreeSet<String> = match lookup.role.filter(|r| !r.trim().is_empty()) {
            Some(role) => candidates()
                .filter(|v| v.roles.contains(role))
                .map(|v| v.tag.clone())
                .collect(),
            None => BTreeSet::new(),
        };
        if !by_role.is_empty() {
            return by_role;
        }

        candidates()
            .filter(|v| {
                lookup
                    .engineering_ids
                    .iter()
                    .any(|id| v.engineering_ids.contains(id))
            })
            .map(|v| v.tag.clone())
            .collect()
    }

    /// First non-payg tag whose variant lists `role` and accepts `arch`.
    pub fn tag_for_role_and_arch(&self, role: &str, arch: &str) -> Option<String> {
        self.variants_for_payg(false)
            .find(|v| v.roles.contains(role) && v.matches_arch(Some(arch)))
            .map(|v| v.tag.clone())
    }

    /// First non-payg tag whose variant lists `role`, whatever its arches.
    pub fn tag_for_role(&self, role: &str) -> Option<String> {
        self.variants_for_payg(false)
            .find(|v| v.roles.contains(role))
            .map(|v| v.tag.clone())
    }

    /// First non-payg tag whose variant explicitly lists `arch`.
    pub fn tag_for_arch(&self, arch: &str) -> Option<String> {
        self.variants_for_payg(false)
            .find(|v| v.arches.contains(arch))
            .map(|v| v.tag.clone())
    }

    fn variants_for_payg(&self, payg: bool) -> impl Iterator<Item = &Variant> {
        self.subscriptions
            .iter()
            .filter(move |s| s.payg == payg)
            .flat_map(|s| s.variants.iter())
    }

    /// Default service level for a service type, only when every definition of
    /// that type agrees on exactly one value.
    pub fn default_sla(&self, service_type: &str) -> Option<ServiceLevel> {
        let distinct: BTreeSet<ServiceLevel> = self
            .definitions_for_service_type(service_type)
            .filter_map(|d| d.defaults.sla)
            .collect();
        single(distinct)
    }

    pub fn default_usage(&self, service_type: &str) -> Option<Usage> {
        let distinct: BTreeSet<Usage> = self
            .definitions_for_service_type(service_type)
            .filter_map(|d| d.defaults.usage)
            .collect();
        single(distinct)
    }

    fn definitions_for_service_type<'a>(
        &'a self,
        service_type: &'a str,
    ) -> impl Iterator<Item = &'a SubscriptionDefinition> + 'a {
        self.subscriptions
            .iter()
            .filter(move |d| d.service_type.as_deref() == Some(service_type))
    }
}

fn single<T>(values: BTreeSet<T>) -> Option<T> {
    if values.len() == 1 {
        values.into_iter().next()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProductRegistry {
        ProductRegistry::builtin().unwrap()
    }

    #[test]
    fn builtin_registry_parses() {
        let registry = registry();
        assert!(registry.definition_for_tag("RHEL for x86").is_some());
        assert!(registry.is_hypervisor_derived("RHEL for x86"));
        assert!(!registry.is_hypervisor_derived("OpenShift Container Platform"));
        assert!(registry.is_payg("rosa"));
    }

    #[test]
    fn role_match_takes_precedence_over_engineering_ids() {
        let registry = registry();
        let eng_ids = vec!["290".to_string()];
        let tags = registry.product_tags(&ProductTagLookup {
            role: Some("Red Hat Enterprise Linux Server"),
            engineering_ids: &eng_ids,
            arch: Some("x86_64"),
            payg: None,
        });
        assert_eq!(tags, BTreeSet::from(["RHEL for x86".to_string()]));

        let tags = registry.product_tags(&ProductTagLookup {
            role: None,
            engineering_ids: &eng_ids,
            ..Default::default()
        });
        assert_eq!(tags, BTreeSet::from(["OpenShift Container Platform".to_string()]));
    }

    #[test]
    fn arch_filters_variants() {
        let registry = registry();
        let eng_ids = vec!["69".to_string()];
        let tags = registry.product_tags(&ProductTagLookup {
            engineering_ids: &eng_ids,
            arch: Some("aarch64"),
            ..Default::default()
        });
        assert!(tags.is_empty());
        assert_eq!(
            registry.tag_for_role_and_arch("Red Hat Enterprise Linux Server", "x86_64"),
            Some("RHEL for x86".to_string())
        );
    }

    #[test]
    fn payg_filter_excludes_other_billing_models() {
        let registry = registry();
        let tags = registry.product_tags(&ProductTagLookup {
            role: Some("rosa"),
            payg: Some(false),
            ..Default::default()
        });
        assert!(tags.is_empty());
    }

    #[test]
    fn payg_and_inventory_tags_partition_the_registry() {
        let registry = registry();
        let payg = registry.tags_for_payg(true);
        let inventory = registry.tags_for_payg(false);

        assert!(payg.contains("rosa"));
        assert!(inventory.contains("RHEL for x86"));
        assert!(payg.is_disjoint(&inventory));
        assert_eq!(payg.len() + inventory.len(), registry.tags().len());
    }

    #[test]
    fn service_type_defaults_require_a_single_value() {
        let registry = ProductRegistry::from_json(
            r#"{"subscriptions": [
                {"id": "a", "service_type": "st", "defaults": {"sla": "Premium", "usage": "Production"}},
                {"id": "b", "service_type": "st", "defaults": {"sla": "Standard", "usage": "Production"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(registry.default_sla("st"), None);
        assert_eq!(registry.default_usage("st"), Some(Usage::Production));
        assert_eq!(registry.default_usage("other"), None);
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = ProductRegistry::from_json("{").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
