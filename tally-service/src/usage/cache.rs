use crate::usage::AccountUsageCalculation;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Hour-indexed account calculations for one org, plus the high-water mark of
/// event record dates already folded in.
///
/// The cache never deduplicates on its own: callers check
/// [`is_event_applied`](Self::is_event_applied) before mutating.
#[derive(Debug, Clone)]
pub struct AccountUsageCalculationCache {
    org_id: String,
    calculations: BTreeMap<DateTime<Utc>, AccountUsageCalculation>,
    last_event_applied: Option<DateTime<Utc>>,
}

impl AccountUsageCalculationCache {
    pub fn new(org_id: impl Into<String>, last_event_applied: Option<DateTime<Utc>>) -> Self {
        Self {
            org_id: org_id.into(),
            calculations: BTreeMap::new(),
            last_event_applied,
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn contains(&self, hour: &DateTime<Utc>) -> bool {
        self.calculations.contains_key(hour)
    }

    pub fn insert(&mut self, hour: DateTime<Utc>, calculation: AccountUsageCalculation) {
        self.calculations.insert(hour, calculation);
    }

    pub fn get(&self, hour: &DateTime<Utc>) -> Option<&AccountUsageCalculation> {
        self.calculations.get(hour)
    }

    /// Calculation for `hour`, starting empty when nothing was loaded for it.
    pub fn get_or_create(&mut self, hour: DateTime<Utc>) -> &mut AccountUsageCalculation {
        let org_id = &self.org_id;
        self.calculations
            .entry(hour)
            .or_insert_with(|| AccountUsageCalculation::new(org_id.clone()))
    }

    pub fn is_event_applied(&self, record_date: DateTime<Utc>) -> bool {
        self.last_event_applied
            .is_some_and(|applied| record_date <= applied)
    }

    pub fn mark_event_applied(&mut self, record_date: DateTime<Utc>) {
        if !self.is_event_applied(record_date) {
            self.last_event_applied = Some(record_date);
        }
    }

    pub fn last_event_applied(&self) -> Option<DateTime<Utc>> {
        self.last_event_applied
    }

    pub fn is_empty(&self) -> bool {
        self.calculations.is_empty()
    }

    pub fn calculations(&self) -> &BTreeMap<DateTime<Utc>, AccountUsageCalculation> {
        &self.calculations
    }
}
