//! Nightly reconciliation of inventory facts into persisted hosts.

use crate::clock::ApplicationClock;
use crate::correlator::{CorrelatedPair, CorrelationVisitor, OrgHostsData};
use crate::error::TallyError;
use crate::models::{
    Dimension, HardwareMeasurementType, Host, HostBucket, NormalizedFacts, UsageKey, HBI_HOST,
};
use crate::normalizer::FactNormalizer;
use crate::registry::CollectorRegistry;
use crate::services::metrics::record_skipped_fact;
use crate::services::store::HostStore;
use crate::usage::{AccountUsageCalculation, UsageCalculation};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unmapped: usize,
}

/// Correlation visitor that keeps the org's hosts in step with inventory.
///
/// Writes are buffered and flushed every `flush_interval` visits and once more
/// by [`finish`](Self::finish).
pub struct HostReconciler {
    org_id: String,
    normalizer: Arc<FactNormalizer>,
    collectors: Arc<CollectorRegistry>,
    hosts: Arc<dyn HostStore>,
    clock: ApplicationClock,
    flush_interval: usize,
    pending_saves: Vec<Host>,
    pending_deletes: Vec<Uuid>,
    owner: AccountUsageCalculation,
    stats: HostReconcileStats,
}

impl HostReconciler {
    pub fn new(
        org_id: &str,
        normalizer: Arc<FactNormalizer>,
        collectors: Arc<CollectorRegistry>,
        hosts: Arc<dyn HostStore>,
        clock: ApplicationClock,
        flush_interval: usize,
    ) -> Self {
        Self {
            org_id: org_id.to_string(),
            normalizer,
            collectors,
            hosts,
            clock,
            flush_interval: flush_interval.max(1),
            pending_saves: Vec::new(),
            pending_deletes: Vec::new(),
            owner: AccountUsageCalculation::new(org_id),
            stats: HostReconcileStats::default(),
        }
    }

    /// Flush what is left and return the pass statistics and the org owner.
    pub async fn finish(mut self) -> Result<(HostReconcileStats, Option<String>), TallyError> {
        self.flush().await?;
        let owner = self.owner.owner_id().map(str::to_string);
        Ok((self.stats, owner))
    }

    async fn flush(&mut self) -> Result<(), TallyError> {
        if !self.pending_saves.is_empty() {
            let saves = std::mem::take(&mut self.pending_saves);
            self.hosts.save_all(&saves).await?;
        }
        if !self.pending_deletes.is_empty() {
            let deletes = std::mem::take(&mut self.pending_deletes);
            self.hosts.delete_all(&deletes).await?;
        }
        Ok(())
    }

    fn reconcile(
        &mut self,
        normalized: &NormalizedFacts,
        existing: Option<Host>,
        context: &mut OrgHostsData,
    ) -> Host {
        let mut host = match existing {
            Some(host) => {
                self.stats.updated += 1;
                host
            }
            None => {
                self.stats.created += 1;
                Host::new(&self.org_id, &normalized.instance_id, HBI_HOST)
            }
        };
        apply_facts(&mut host, normalized, self.clock);

        if normalized.is_mapped_guest() {
            context.increment_guest_count();
        }

        host.mark_buckets_stale();
        let keys = usage_keys(normalized);
        if keys.is_empty() {
            self.stats.unmapped += 1;
            record_skipped_fact("no_products");
        }

        for key in &keys {
            let collector = self.collectors.get(&key.product_id);
            let mut scratch = UsageCalculation::new(key.clone());
            match collector.collect(&mut scratch, normalized) {
                Ok(Some(bucket)) => host.add_bucket(bucket),
                Ok(None) if normalized.is_mapped_guest() => {
                    context.add_hypervisor_key(key.clone())
                }
                Ok(None) => {}
                Err(e) => {
                    record_skipped_fact("unsupported_hardware");
                    debug!(
                        org_id = %self.org_id,
                        instance_id = %host.instance_id,
                        error = %e,
                        "Skipping usage for system"
                    );
                }
            }
        }

        let placeholder = normalized
            .subscription_manager_id
            .as_deref()
            .and_then(|id| context.take_placeholder(id));
        if let Some(placeholder) = placeholder {
            host.is_hypervisor = true;
            host.num_of_guests = Some(placeholder.guest_count);
            let hypervisor_keys: BTreeSet<UsageKey> =
                placeholder.usage_keys.into_iter().chain(keys).collect();
            for key in &hypervisor_keys {
                let collector = self.collectors.get(&key.product_id);
                if let Some(bucket) = collector.build_bucket_for_hypervisor(key, normalized) {
                    host.add_bucket(bucket);
                }
            }
        } else {
            host.num_of_guests = None;
        }

        host.clear_stale_buckets();
        host
    }
}

#[async_trait]
impl CorrelationVisitor for HostReconciler {
    async fn visit(
        &mut self,
        pair: CorrelatedPair,
        context: &mut OrgHostsData,
        iteration: usize,
    ) -> Result<(), TallyError> {
        for duplicate in pair.duplicate_hosts {
            self.stats.deleted += 1;
            self.pending_deletes.push(duplicate.id);
        }

        match (pair.facts, pair.host) {
            (Some(facts), existing) => {
                let normalized = self.normalizer.normalize(&facts, context);
                self.owner.set_owner(normalized.owner_id.as_deref())?;
                let host = self.reconcile(&normalized, existing, context);
                self.pending_saves.push(host);
            }
            (None, Some(stale)) => {
                debug!(
                    org_id = %self.org_id,
                    instance_id = %stale.instance_id,
                    "Removing host no longer reported by inventory"
                );
                self.stats.deleted += 1;
                self.pending_deletes.push(stale.id);
            }
            (None, None) => {}
        }

        if iteration % self.flush_interval == 0 {
            self.flush().await?;
        }
        Ok(())
    }
}

fn apply_facts(host: &mut Host, facts: &NormalizedFacts, clock: ApplicationClock) {
    host.org_id = facts.org_id.clone();
    host.instance_id = facts.instance_id.clone();
    host.inventory_id = facts.inventory_id.clone();
    host.insights_id = facts.insights_id.clone();
    host.subscription_manager_id = facts.subscription_manager_id.clone();
    host.display_name = facts.display_name.clone();
    host.hypervisor_uuid = facts.hypervisor_uuid.clone();
    host.hardware_type = facts.hardware_type;
    host.cloud_provider = facts.cloud_provider_type.map(|t| t.as_str().to_string());
    host.is_guest = facts.is_virtual;
    host.is_hypervisor = facts.is_hypervisor;
    host.is_unmapped_guest = facts.is_virtual && facts.is_hypervisor_unknown;
    host.last_seen = Some(clock.now());
}

/// Every product crossed with the specific and wildcard sla and usage. Billing
/// dimensions are always the wildcard for inventory-derived usage.
pub fn usage_keys(facts: &NormalizedFacts) -> BTreeSet<UsageKey> {
    UsageKey::cartesian(
        &facts.products,
        &Dimension::with_wildcard(facts.sla),
        &Dimension::with_wildcard(facts.usage),
        &Dimension::any_only(),
        &Dimension::any_only(),
    )
}

/// Total the buckets of `hosts` into one account calculation.
pub fn tally_buckets<'a>(
    org_id: &str,
    hosts: impl IntoIterator<Item = &'a Host>,
) -> AccountUsageCalculation {
    let mut account = AccountUsageCalculation::new(org_id);
    for host in hosts {
        for bucket in host.buckets.values() {
            add_bucket(&mut account, bucket);
        }
    }
    account
}

fn add_bucket(account: &mut AccountUsageCalculation, bucket: &HostBucket) {
    let calc = account.get_or_create_calculation(&bucket.key.usage_key);
    match bucket.measurement_type {
        HardwareMeasurementType::Physical => calc.add_physical(bucket.cores, bucket.sockets, 1),
        HardwareMeasurementType::Hypervisor => {
            calc.add_hypervisor(bucket.cores, bucket.sockets, 1)
        }
        HardwareMeasurementType::Virtual => calc.add_virtual(bucket.cores, bucket.sockets, 1),
        cloud => {
            if let Err(e) = calc.add_cloud_provider(cloud, bucket.cores, bucket.sockets, 1) {
                debug!(error = %e, "Ignoring bucket with unsupported measurement type");
            }
        }
    }
}
