//! Usage dimensions and the `_ANY` wildcard.
//!
//! Every dimension of a [`UsageKey`] except the product is a [`Dimension`]:
//! either a specific value or the wildcard. Buckets and calculations are always
//! produced for both, so totals can be read precisely or in aggregate without a
//! second pass.

#![allow(clippy::should_implement_trait)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;

/// Wire spelling of the wildcard.
pub const ANY: &str = "_ANY";

/// A value that can sit inside a [`Dimension`].
pub trait DimensionValue: Clone + Ord + Hash + fmt::Debug {
    fn as_str(&self) -> &str;
    fn parse(s: &str) -> Self;
}

/// A specific dimension value or the wildcard.
///
/// Ordering is the value's own order, with `Any` after every specific value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension<T> {
    Specific(T),
    Any,
}

impl<T: DimensionValue> Dimension<T> {
    /// The specific value followed by the wildcard.
    pub fn with_wildcard(value: T) -> Vec<Dimension<T>> {
        vec![Dimension::Specific(value), Dimension::Any]
    }

    pub fn any_only() -> Vec<Dimension<T>> {
        vec![Dimension::Any]
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Dimension::Any)
    }

    pub fn specific(&self) -> Option<&T> {
        match self {
            Dimension::Specific(v) => Some(v),
            Dimension::Any => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Dimension::Specific(v) => v.as_str(),
            Dimension::Any => ANY,
        }
    }

    pub fn from_str(s: &str) -> Self {
        if s == ANY {
            Dimension::Any
        } else {
            Dimension::Specific(T::parse(s))
        }
    }
}

impl<T: DimensionValue> fmt::Display for Dimension<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T: DimensionValue> Serialize for Dimension<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, T: DimensionValue> Deserialize<'de> for Dimension<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Dimension::from_str(&s))
    }
}

// ============================================================================
// Service level
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ServiceLevel {
    #[default]
    Empty,
    Premium,
    Standard,
    SelfSupport,
}

impl ServiceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "",
            Self::Premium => "Premium",
            Self::Standard => "Standard",
            Self::SelfSupport => "Self-Support",
        }
    }

    /// Case-insensitive; anything unrecognised is `Empty`.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "premium" => Self::Premium,
            "standard" => Self::Standard,
            "self-support" | "self_support" => Self::SelfSupport,
            _ => Self::Empty,
        }
    }
}

impl DimensionValue for ServiceLevel {
    fn as_str(&self) -> &str {
        ServiceLevel::as_str(self)
    }

    fn parse(s: &str) -> Self {
        ServiceLevel::from_str(s)
    }
}

// ============================================================================
// Usage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Usage {
    #[default]
    Empty,
    Production,
    DevelopmentTest,
    DisasterRecovery,
}

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "",
            Self::Production => "Production",
            Self::DevelopmentTest => "Development/Test",
            Self::DisasterRecovery => "Disaster Recovery",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" => Self::Production,
            "development/test" | "development_test" => Self::DevelopmentTest,
            "disaster recovery" | "disaster_recovery" => Self::DisasterRecovery,
            _ => Self::Empty,
        }
    }
}

impl DimensionValue for Usage {
    fn as_str(&self) -> &str {
        Usage::as_str(self)
    }

    fn parse(s: &str) -> Self {
        Usage::from_str(s)
    }
}

// ============================================================================
// Billing provider
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BillingProvider {
    #[default]
    Empty,
    RedHat,
    Aws,
    Gcp,
    Azure,
    Oracle,
}

impl BillingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "",
            Self::RedHat => "red hat",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Oracle => "oracle",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "red hat" | "red_hat" | "rhm" => Self::RedHat,
            "aws" => Self::Aws,
            "gcp" => Self::Gcp,
            "azure" => Self::Azure,
            "oracle" => Self::Oracle,
            _ => Self::Empty,
        }
    }
}

impl DimensionValue for BillingProvider {
    fn as_str(&self) -> &str {
        BillingProvider::as_str(self)
    }

    fn parse(s: &str) -> Self {
        BillingProvider::from_str(s)
    }
}

impl DimensionValue for String {
    fn as_str(&self) -> &str {
        self.as_str()
    }

    fn parse(s: &str) -> Self {
        s.to_string()
    }
}

macro_rules! serde_as_str {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.serialize_str(self.as_str())
                }
            }

            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let s = String::deserialize(deserializer)?;
                    Ok(<$ty>::from_str(&s))
                }
            }
        )*
    };
}

serde_as_str!(ServiceLevel, Usage, BillingProvider);

// ============================================================================
// Usage key
// ============================================================================

/// Identity of one usage calculation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub product_id: String,
    pub sla: Dimension<ServiceLevel>,
    pub usage: Dimension<Usage>,
    pub billing_provider: Dimension<BillingProvider>,
    pub billing_account_id: Dimension<String>,
}

impl UsageKey {
    pub fn new(
        product_id: impl Into<String>,
        sla: Dimension<ServiceLevel>,
        usage: Dimension<Usage>,
        billing_provider: Dimension<BillingProvider>,
        billing_account_id: Dimension<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            sla,
            usage,
            billing_provider,
            billing_account_id,
        }
    }

    /// Key with every dimension set to the wildcard.
    pub fn any(product_id: impl Into<String>) -> Self {
        Self::new(
            product_id,
            Dimension::Any,
            Dimension::Any,
            Dimension::Any,
            Dimension::Any,
        )
    }

    /// Cartesian product of the given products and dimension choices, in key order.
    pub fn cartesian<'a>(
        product_ids: impl IntoIterator<Item = &'a String>,
        slas: &[Dimension<ServiceLevel>],
        usages: &[Dimension<Usage>],
        billing_providers: &[Dimension<BillingProvider>],
        billing_account_ids: &[Dimension<String>],
    ) -> BTreeSet<UsageKey> {
        let mut keys = BTreeSet::new();
        for product_id in product_ids {
            for sla in slas {
                for usage in usages {
                    for billing_provider in billing_providers {
                        for billing_account_id in billing_account_ids {
                            keys.insert(UsageKey::new(
                                product_id.clone(),
                                sla.clone(),
                                usage.clone(),
                                billing_provider.clone(),
                                billing_account_id.clone(),
                            ));
                        }
                    }
                }
            }
        }
        keys
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.product_id, self.sla, self.usage, self.billing_provider, self.billing_account_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_sorts_after_specific_values() {
        let mut values = vec![
            Dimension::Any,
            Dimension::Specific(ServiceLevel::Standard),
            Dimension::Specific(ServiceLevel::Premium),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Dimension::Specific(ServiceLevel::Premium),
                Dimension::Specific(ServiceLevel::Standard),
                Dimension::Any,
            ]
        );
    }

    #[test]
    fn wildcard_round_trips_through_json() {
        let any: Dimension<Usage> = serde_json::from_str("\"_ANY\"").unwrap();
        assert!(any.is_any());
        let prod: Dimension<Usage> = serde_json::from_str("\"Production\"").unwrap();
        assert_eq!(prod, Dimension::Specific(Usage::Production));
        assert_eq!(serde_json::to_string(&Dimension::<Usage>::Any).unwrap(), "\"_ANY\"");
    }

    #[test]
    fn unknown_values_fall_back_to_empty() {
        assert_eq!(ServiceLevel::from_str("platinum"), ServiceLevel::Empty);
        assert_eq!(Usage::from_str("PRODUCTION"), Usage::Production);
        assert_eq!(BillingProvider::from_str("AWS"), BillingProvider::Aws);
    }

    #[test]
    fn cartesian_covers_every_combination_once() {
        let products: BTreeSet<String> = ["RHEL".to_string(), "OpenShift".to_string()].into();
        let keys = UsageKey::cartesian(
            &products,
            &Dimension::with_wildcard(ServiceLevel::Premium),
            &Dimension::with_wildcard(Usage::Production),
            &Dimension::with_wildcard(BillingProvider::Aws),
            &Dimension::with_wildcard("acct-1".to_string()),
        );
        assert_eq!(keys.len(), 2 * 2 * 2 * 2 * 2);
        assert!(keys.contains(&UsageKey::any("RHEL")));
        assert!(keys.contains(&UsageKey::new(
            "OpenShift",
            Dimension::Specific(ServiceLevel::Premium),
            Dimension::Any,
            Dimension::Specific(BillingProvider::Aws),
            Dimension::Any,
        )));
    }

    #[test]
    fn cartesian_collapses_duplicate_choices() {
        let products: BTreeSet<String> = ["RHEL".to_string()].into();
        let keys = UsageKey::cartesian(
            &products,
            &[Dimension::Any, Dimension::Any],
            &Dimension::any_only(),
            &Dimension::any_only(),
            &Dimension::any_only(),
        );
        assert_eq!(keys.len(), 1);
    }
}
