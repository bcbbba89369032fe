//! Job runner: at most one running task per job class.
//!
//! Single-org triggers run inline and hand their report back; all-org triggers
//! claim the class, then fan out over org ids in a background task.

use crate::controller::{
    EventTallyService, HostTallyReport, HostTallyService, HourlyTallyReport, RetentionService,
};
use crate::error::TallyError;
use crate::models::Granularity;
use crate::services::store::Stores;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    HostTally,
    HourlyTally,
    Retention,
}

impl JobClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostTally => "host_tally",
            Self::HourlyTally => "hourly_tally",
            Self::Retention => "retention",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub orgs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct JobRunner {
    host_tally: Arc<HostTallyService>,
    event_tally: Arc<EventTallyService>,
    retention: Arc<RetentionService>,
    stores: Stores,
    org_concurrency: usize,
    host_permit: Arc<Semaphore>,
    hourly_permit: Arc<Semaphore>,
    retention_permit: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        host_tally: Arc<HostTallyService>,
        event_tally: Arc<EventTallyService>,
        retention: Arc<RetentionService>,
        stores: Stores,
        org_concurrency: usize,
    ) -> Self {
        Self {
            host_tally,
            event_tally,
            retention,
            stores,
            org_concurrency: org_concurrency.max(1),
            host_permit: Arc::new(Semaphore::new(1)),
            hourly_permit: Arc::new(Semaphore::new(1)),
            retention_permit: Arc::new(Semaphore::new(1)),
            shutdown: CancellationToken::new(),
        }
    }

    fn claim(&self, class: JobClass) -> Result<OwnedSemaphorePermit, AppError> {
        let semaphore = match class {
            JobClass::HostTally => &self.host_permit,
            JobClass::HourlyTally => &self.hourly_permit,
            JobClass::Retention => &self.retention_permit,
        };
        semaphore.clone().try_acquire_owned().map_err(|_| {
            AppError::Conflict(anyhow::anyhow!("A {} job is already running", class.as_str()))
        })
    }

    pub fn is_running(&self, class: JobClass) -> bool {
        self.claim(class).is_err()
    }

    pub async fn tally_org(&self, org_id: &str) -> Result<HostTallyReport, AppError> {
        let _permit = self.claim(JobClass::HostTally)?;
        Ok(self.host_tally.tally_org(org_id).await?)
    }

    pub async fn tally_hourly(&self, org_id: &str) -> Result<HourlyTallyReport, AppError> {
        let _permit = self.claim(JobClass::HourlyTally)?;
        Ok(self.event_tally.tally_hourly(org_id).await?)
    }

    pub async fn purge_expired(&self) -> Result<BTreeMap<Granularity, u64>, AppError> {
        let _permit = self.claim(JobClass::Retention)?;
        Ok(self.retention.purge_expired().await?)
    }

    /// Claim `class` and run the nightly pass for every org with facts in the
    /// background. Fails with Conflict when the class is busy.
    pub fn start_all_host_tallies(self: &Arc<Self>) -> Result<(), AppError> {
        let permit = self.claim(JobClass::HostTally)?;
        let runner = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let org_ids = match runner.stores.facts.org_ids_with_facts().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "Could not list orgs for host tally");
                    return;
                }
            };
            let service = runner.host_tally.clone();
            let summary = runner
                .fan_out(JobClass::HostTally, org_ids, move |org_id| {
                    let service = service.clone();
                    async move { service.tally_org(&org_id).await }
                })
                .await;
            info!(job = "host_tally", ?summary, "Job finished");
        });
        Ok(())
    }

    pub fn start_all_hourly_tallies(self: &Arc<Self>) -> Result<(), AppError> {
        let permit = self.claim(JobClass::HourlyTally)?;
        let runner = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let org_ids = match runner.stores.events.org_ids_with_events().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "Could not list orgs for hourly tally");
                    return;
                }
            };
            let service = runner.event_tally.clone();
            let summary = runner
                .fan_out(JobClass::HourlyTally, org_ids, move |org_id| {
                    let service = service.clone();
                    async move { service.tally_hourly(&org_id).await }
                })
                .await;
            info!(job = "hourly_tally", ?summary, "Job finished");
        });
        Ok(())
    }

    async fn fan_out<F, Fut, T>(&self, class: JobClass, org_ids: Vec<String>, run: F) -> JobSummary
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, TallyError>>,
    {
        let orgs = org_ids.len();
        info!(job = class.as_str(), orgs, "Starting job");
        let outcomes: Vec<bool> = stream::iter(org_ids)
            .map(|org_id| {
                let pass = run(org_id.clone());
                async move {
                    match pass.await {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(job = class.as_str(), org_id = %org_id, error = %e, "Org failed");
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.org_concurrency)
            .take_until(self.shutdown.cancelled())
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|ok| **ok).count();
        JobSummary {
            orgs,
            succeeded,
            failed: outcomes.len() - succeeded,
            cancelled: outcomes.len() < orgs,
        }
    }

    /// Stop handing out orgs to running jobs. Orgs already in flight finish.
    pub fn shutdown(&self) {
        info!("Stopping job runner");
        self.shutdown.cancel();
    }
}

