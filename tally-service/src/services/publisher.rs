//! Hand-off of changed snapshots to downstream consumers.

use crate::config::PublisherConfig;
use crate::error::TallyError;
use crate::models::{Snapshot, SnapshotRecord};
use crate::services::metrics::record_publish_attempt;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use service_core::observability::inject_trace_context;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

/// Payload published per org after a tally pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallySummary {
    pub org_id: String,
    pub tally_snapshots: Vec<SnapshotRecord>,
}

impl TallySummary {
    pub fn new(org_id: &str, snapshots: &[Snapshot]) -> Self {
        Self {
            org_id: org_id.to_string(),
            tally_snapshots: snapshots.iter().map(SnapshotRecord::from).collect(),
        }
    }
}

#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    /// Publish the snapshots a pass created or modified, keyed by org.
    async fn publish(&self, snapshots: &HashMap<String, Vec<Snapshot>>) -> Result<(), TallyError>;
}

/// Posts one [`TallySummary`] per org, retrying with exponential backoff.
pub struct HttpPublisher {
    client: Client,
    url: String,
    config: PublisherConfig,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>, config: PublisherConfig) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            config,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_interval,
            max_elapsed_time: Some(self.config.max_elapsed),
            ..Default::default()
        }
    }

    async fn send(&self, summary: &TallySummary) -> Result<(), backoff::Error<TallyError>> {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .json(summary)
            .send()
            .await
            .map_err(|e| {
                record_publish_attempt("error");
                backoff::Error::transient(TallyError::PublishFailed(e.to_string()))
            })?;

        let status = response.status();
        if status.is_success() {
            record_publish_attempt("success");
            return Ok(());
        }

        record_publish_attempt("error");
        let error = TallyError::PublishFailed(format!(
            "{} rejected tally summary for org {}: {}",
            self.url, summary.org_id, status
        ));
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(backoff::Error::transient(error))
        } else {
            Err(backoff::Error::permanent(error))
        }
    }
}

#[async_trait]
impl SnapshotPublisher for HttpPublisher {
    #[instrument(skip(self, snapshots), fields(orgs = snapshots.len()))]
    async fn publish(&self, snapshots: &HashMap<String, Vec<Snapshot>>) -> Result<(), TallyError> {
        for (org_id, org_snapshots) in snapshots {
            if org_snapshots.is_empty() {
                continue;
            }
            let summary = TallySummary::new(org_id, org_snapshots);
            retry(self.backoff(), || async { self.send(&summary).await }).await?;
            info!(
                org_id = %org_id,
                snapshots = org_snapshots.len(),
                "Published tally summary"
            );
        }
        Ok(())
    }
}

/// Used when no publisher URL is configured.
#[derive(Debug, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl SnapshotPublisher for LoggingPublisher {
    async fn publish(&self, snapshots: &HashMap<String, Vec<Snapshot>>) -> Result<(), TallyError> {
        for (org_id, org_snapshots) in snapshots {
            info!(
                org_id = %org_id,
                snapshots = org_snapshots.len(),
                "Tally summary ready (no publisher configured)"
            );
        }
        record_publish_attempt("skipped");
        Ok(())
    }
}

/// Pick the publisher for `config`.
pub fn from_config(config: &PublisherConfig) -> std::sync::Arc<dyn SnapshotPublisher> {
    match config.url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => std::sync::Arc::new(HttpPublisher::new(url, config.clone())),
        None => {
            warn!("PUBLISHER_URL not set; tally summaries will only be logged");
            std::sync::Arc::new(LoggingPublisher)
        }
    }
}
