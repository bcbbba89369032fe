//! Cloud concurrency enrichment of nightly calculations.
//!
//! An external service reports, per day, the peak number of concurrently running
//! cloud instances per role or arch. Those counts are added under
//! `AWS_CLOUDIGRADE` to the matching calculations. A missing or failing source
//! never fails a tally pass.

use crate::config::EnrichmentConfig;
use crate::error::TallyError;
use crate::models::{Dimension, ServiceLevel, Usage, UsageKey, ANY};
use crate::registry::ProductRegistry;
use crate::services::metrics::record_skipped_fact;
use crate::usage::AccountUsageCalculation;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use service_core::observability::inject_trace_context;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConcurrencyReport {
    #[serde(default)]
    pub data: Vec<DailyConcurrency>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DailyConcurrency {
    pub date: NaiveDate,
    #[serde(default)]
    pub maximum_counts: Vec<UsageCount>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UsageCount {
    pub role: String,
    pub arch: String,
    #[serde(default)]
    pub sla: Option<String>,
    #[serde(default)]
    pub usage: Option<String>,
    /// Absent from older reports; treated like `_ANY`.
    #[serde(default)]
    pub service_type: Option<String>,
    pub instances_count: i32,
}

#[async_trait]
pub trait ConcurrencyReportSource: Send + Sync {
    async fn daily_concurrency(
        &self,
        org_id: &str,
        date: NaiveDate,
    ) -> Result<ConcurrencyReport, TallyError>;
}

pub struct HttpConcurrencySource {
    client: Client,
    url: String,
}

impl HttpConcurrencySource {
    pub fn new(url: impl Into<String>, config: &EnrichmentConfig) -> Result<Self, TallyError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TallyError::EnrichmentUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConcurrencyReportSource for HttpConcurrencySource {
    #[instrument(skip(self), fields(org_id = %org_id))]
    async fn daily_concurrency(
        &self,
        org_id: &str,
        date: NaiveDate,
    ) -> Result<ConcurrencyReport, TallyError> {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        let day = date.to_string();

        let response = self
            .client
            .get(&self.url)
            .headers(headers)
            .query(&[
                ("org_id", org_id),
                ("start_date", day.as_str()),
                ("end_date", day.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TallyError::EnrichmentUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| TallyError::EnrichmentUnavailable(e.to_string()))?;

        response
            .json::<ConcurrencyReport>()
            .await
            .map_err(|e| TallyError::EnrichmentUnavailable(e.to_string()))
    }
}

pub struct CloudigradeEnricher {
    source: Arc<dyn ConcurrencyReportSource>,
    registry: Arc<ProductRegistry>,
}

impl CloudigradeEnricher {
    pub fn new(source: Arc<dyn ConcurrencyReportSource>, registry: Arc<ProductRegistry>) -> Self {
        Self { source, registry }
    }

    /// Build the enricher from config; `None` when disabled or unconfigured.
    pub fn from_config(
        config: &EnrichmentConfig,
        registry: Arc<ProductRegistry>,
    ) -> Result<Option<Self>, TallyError> {
        match config.url.as_deref().filter(|_| config.enabled) {
            Some(url) => {
                let source = HttpConcurrencySource::new(url, config)?;
                Ok(Some(Self::new(Arc::new(source), registry)))
            }
            None => Ok(None),
        }
    }

    /// Add the day's reported concurrency to `account`. Returns how many counts
    /// were applied.
    pub async fn enrich(&self, account: &mut AccountUsageCalculation, date: NaiveDate) -> usize {
        let org_id = account.org_id().to_string();
        let report = match self.source.daily_concurrency(&org_id, date).await {
            Ok(report) => report,
            Err(e) => {
                warn!(org_id = %org_id, error = %e, "Skipping concurrency enrichment");
                return 0;
            }
        };
        if report.data.len() > 1 {
            warn!(org_id = %org_id, days = report.data.len(), "More than one day of concurrency data; using the first");
        }
        let Some(day) = report.data.into_iter().next() else {
            warn!(org_id = %org_id, date = %date, "Empty concurrency report");
            return 0;
        };

        let mut applied = 0;
        for count in &day.maximum_counts {
            if count.service_type.as_deref().is_some_and(|st| st != ANY) {
                continue;
            }
            match self.usage_key(count) {
                Some(key) => {
                    account
                        .get_or_create_calculation(&key)
                        .add_cloudigrade(count.instances_count);
                    applied += 1;
                }
                None => {
                    record_skipped_fact("unmapped_concurrency");
                    warn!(
                        org_id = %org_id,
                        role = %count.role,
                        arch = %count.arch,
                        "Skipping concurrency count with no product mapping"
                    );
                }
            }
        }
        debug!(org_id = %org_id, applied, "Concurrency enrichment applied");
        applied
    }

    fn usage_key(&self, count: &UsageCount) -> Option<UsageKey> {
        let product = match (count.role.as_str(), count.arch.as_str()) {
            (ANY, ANY) => None,
            (role, ANY) => self.registry.tag_for_role(role),
            (ANY, arch) => self.registry.tag_for_arch(arch),
            (role, arch) => self.registry.tag_for_role_and_arch(role, arch),
        }?;
        let sla = count
            .sla
            .as_deref()
            .map_or(Dimension::Any, Dimension::<ServiceLevel>::from_str);
        let usage = count
            .usage
            .as_deref()
            .map_or(Dimension::Any, Dimension::<Usage>::from_str);
        Some(UsageKey::new(product, sla, usage, Dimension::Any, Dimension::Any))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HardwareMeasurementType, MetricId};

    struct Fixed(Result<ConcurrencyReport, ()>);

    #[async_trait]
    impl ConcurrencyReportSource for Fixed {
        async fn daily_concurrency(
            &self,
            _org_id: &str,
            _date: NaiveDate,
        ) -> Result<ConcurrencyReport, TallyError> {
            self.0
                .clone()
                .map_err(|_| TallyError::EnrichmentUnavailable("down".into()))
        }
    }

    fn enricher(report: Result<ConcurrencyReport, ()>) -> CloudigradeEnricher {
        CloudigradeEnricher::new(
            Arc::new(Fixed(report)),
            Arc::new(ProductRegistry::builtin().unwrap()),
        )
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn count(role: &str, arch: &str, service_type: Option<&str>, instances: i32) -> UsageCount {
        UsageCount {
            role: role.into(),
            arch: arch.into(),
            sla: Some("Premium".into()),
            usage: None,
            service_type: service_type.map(str::to_string),
            instances_count: instances,
        }
    }

    #[tokio::test]
    async fn counts_land_under_cloudigrade_for_mapped_products() {
        let report = ConcurrencyReport {
            data: vec![DailyConcurrency {
                date: date(),
                maximum_counts: vec![
                    count(ANY, "x86_64", Some(ANY), 3),
                    count(ANY, "x86_64", Some("Linux"), 9),
                    count(ANY, ANY, None, 5),
                ],
            }],
        };
        let mut account = AccountUsageCalculation::new("org1");
        let applied = enricher(Ok(report)).enrich(&mut account, date()).await;
        assert_eq!(applied, 1);

        let key = UsageKey::new(
            "RHEL for x86",
            Dimension::Specific(ServiceLevel::Premium),
            Dimension::Any,
            Dimension::Any,
            Dimension::Any,
        );
        let totals = account
            .get_calculation(&key)
            .and_then(|c| c.get_totals(HardwareMeasurementType::AwsCloudigrade))
            .unwrap();
        assert_eq!(totals.get(&MetricId::instances()), Some(3.0));
        assert_eq!(totals.get(&MetricId::cores()), Some(0.0));
    }

    #[tokio::test]
    async fn unavailable_source_leaves_calculations_alone() {
        let mut account = AccountUsageCalculation::new("org1");
        assert_eq!(enricher(Err(())).enrich(&mut account, date()).await, 0);
        assert!(account.is_empty());

        let empty = ConcurrencyReport { data: vec![] };
        assert_eq!(enricher(Ok(empty)).enrich(&mut account, date()).await, 0);
    }

    #[test]
    fn report_json_parses() {
        let report: ConcurrencyReport = serde_json::from_str(
            r#"{"data": [{"date": "2024-03-01", "maximum_counts": [
                {"role": "_ANY", "arch": "aarch64", "sla": "_ANY", "instances_count": 2}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(report.data[0].maximum_counts[0].instances_count, 2);
        assert!(report.data[0].maximum_counts[0].service_type.is_none());
    }
}
