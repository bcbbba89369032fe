//! Single-pass merge-join of inventory facts against persisted hosts.
//!
//! Both primary streams arrive sorted by [`SortKey`]: hardware id, then
//! hypervisor uuid (nulls last), then inventory id. Every system running on a
//! hypervisor therefore shares a hardware id with it and is visited just before
//! it, so hypervisor state only has to live for one group at a time. A third
//! stream of active hypervisor ids, sorted the same way, tells the pass which
//! referenced hypervisors actually exist.
//!
//! The key stops at inventory id and has no instance id component, so rows
//! sharing all three columns come back in no particular order. Nothing depends
//! on that order: host rows with an equal key are drained together as
//! duplicates, and a fact is skipped when its instance id equals the previous
//! fact's. Both store queries order by exactly these three columns.

use crate::error::TallyError;
use crate::models::facts::non_empty;
use crate::models::{Host, HostFacts, NormalizedFacts, UsageKey};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use service_core::error::AppError;
use std::cmp::Ordering;
use std::collections::BTreeSet;

// ============================================================================
// Sort key
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub hardware_id: Option<String>,
    pub hypervisor_uuid: Option<String>,
    pub inventory_id: Option<String>,
}

impl SortKey {
    pub fn from_facts(facts: &HostFacts) -> Self {
        let hypervisor_uuid = facts.effective_hypervisor_uuid().map(str::to_string);
        let hardware_id = hypervisor_uuid
            .clone()
            .or_else(|| facts.subscription_manager_id.clone());
        Self {
            hardware_id,
            hypervisor_uuid,
            inventory_id: Some(facts.inventory_id.clone()),
        }
    }

    pub fn from_host(host: &Host) -> Self {
        let hypervisor_uuid = non_empty(host.hypervisor_uuid.as_deref()).map(str::to_string);
        let hardware_id = hypervisor_uuid
            .clone()
            .or_else(|| host.subscription_manager_id.clone());
        Self {
            hardware_id,
            hypervisor_uuid,
            inventory_id: host.inventory_id.clone(),
        }
    }
}

/// Byte-wise string order with `None` after every value, matching
/// `ORDER BY .. COLLATE "C" NULLS LAST` on each of the three key columns.
fn nulls_last(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        nulls_last(&self.hardware_id, &other.hardware_id)
            .then_with(|| nulls_last(&self.hypervisor_uuid, &other.hypervisor_uuid))
            .then_with(|| nulls_last(&self.inventory_id, &other.inventory_id))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// Hypervisor context
// ============================================================================

/// Hypervisor state for the group currently being visited.
///
/// The correlator replaces the context whenever a fact references a hypervisor
/// other than the tracked one; the visitor fills it in as guests go by and
/// consumes it when the hypervisor itself is visited.
#[derive(Debug, Default)]
pub struct OrgHostsData {
    hypervisor_uuid: Option<String>,
    mapped: bool,
    placeholder: Option<HypervisorPlaceholder>,
}

/// What guests have recorded about their hypervisor before it is visited.
#[derive(Debug)]
pub struct HypervisorPlaceholder {
    pub host: Host,
    pub facts: NormalizedFacts,
    pub guest_count: i32,
    pub usage_keys: BTreeSet<UsageKey>,
}

impl OrgHostsData {
    /// Context for `hypervisor_uuid`; `mapped` says whether it is an active system.
    pub fn tracking(hypervisor_uuid: &str, mapped: bool) -> Self {
        let placeholder = mapped.then(|| HypervisorPlaceholder {
            host: Host::hypervisor_placeholder(hypervisor_uuid),
            facts: NormalizedFacts::default(),
            guest_count: 0,
            usage_keys: BTreeSet::new(),
        });
        Self {
            hypervisor_uuid: Some(hypervisor_uuid.to_string()),
            mapped,
            placeholder,
        }
    }

    pub fn is_tracking(&self, hypervisor_uuid: &str) -> bool {
        self.hypervisor_uuid.as_deref() == Some(hypervisor_uuid)
    }

    /// True when `id` is the tracked hypervisor and it exists in inventory.
    pub fn is_mapped_hypervisor(&self, id: &str) -> bool {
        self.mapped && self.is_tracking(id)
    }

    pub fn increment_guest_count(&mut self) {
        if let Some(placeholder) = self.placeholder.as_mut() {
            placeholder.guest_count += 1;
        }
    }

    pub fn add_hypervisor_key(&mut self, key: UsageKey) {
        if let Some(placeholder) = self.placeholder.as_mut() {
            placeholder.usage_keys.insert(key);
        }
    }

    pub fn guest_count(&self) -> i32 {
        self.placeholder.as_ref().map_or(0, |p| p.guest_count)
    }

    /// Hand the placeholder to the hypervisor record with subscription manager id
    /// `id`. Only the first copy of a duplicated hypervisor gets it.
    pub fn take_placeholder(&mut self, id: &str) -> Option<HypervisorPlaceholder> {
        if self.is_mapped_hypervisor(id) {
            self.placeholder.take()
        } else {
            None
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// One-element lookahead over a fallible stream.
pub struct Cursor<'a, T> {
    stream: BoxStream<'a, Result<T, AppError>>,
    head: Option<T>,
    exhausted: bool,
}

impl<'a, T> Cursor<'a, T> {
    pub fn new(stream: BoxStream<'a, Result<T, AppError>>) -> Self {
        Self {
            stream,
            head: None,
            exhausted: false,
        }
    }

    pub async fn peek(&mut self) -> Result<Option<&T>, AppError> {
        if self.head.is_none() && !self.exhausted {
            match self.stream.next().await {
                Some(item) => self.head = Some(item?),
                None => self.exhausted = true,
            }
        }
        Ok(self.head.as_ref())
    }

    pub async fn advance(&mut self) -> Result<Option<T>, AppError> {
        self.peek().await?;
        Ok(self.head.take())
    }
}

// ============================================================================
// Merge-join
// ============================================================================

/// Records sharing one sort key.
#[derive(Debug, Default)]
pub struct CorrelatedPair {
    pub facts: Option<HostFacts>,
    pub host: Option<Host>,
    /// Further persisted hosts with the same key; they should be removed.
    pub duplicate_hosts: Vec<Host>,
}

#[async_trait]
pub trait CorrelationVisitor: Send {
    async fn visit(
        &mut self,
        pair: CorrelatedPair,
        context: &mut OrgHostsData,
        iteration: usize,
    ) -> Result<(), TallyError>;
}

/// Drive `visitor` over the union of both primary streams, once per distinct key.
/// Returns the number of keys visited.
pub async fn correlate<V: CorrelationVisitor>(
    facts: BoxStream<'_, Result<HostFacts, AppError>>,
    hosts: BoxStream<'_, Result<Host, AppError>>,
    active_hypervisor_ids: BoxStream<'_, Result<String, AppError>>,
    visitor: &mut V,
) -> Result<usize, TallyError> {
    let mut facts = Cursor::new(facts);
    let mut hosts = Cursor::new(hosts);
    let mut hypervisor_ids = Cursor::new(active_hypervisor_ids);

    let mut context = OrgHostsData::default();
    let mut previous_instance_id: Option<String> = None;
    let mut iteration = 0;

    loop {
        let fact_key = facts.peek().await?.map(SortKey::from_facts);
        let host_key = hosts.peek().await?.map(SortKey::from_host);
        let active_key = match (&fact_key, &host_key) {
            (None, None) => break,
            (Some(key), None) | (None, Some(key)) => key.clone(),
            (Some(f), Some(h)) => f.min(h).clone(),
        };
        iteration += 1;

        let fact = if fact_key.as_ref() == Some(&active_key) {
            facts.advance().await?
        } else {
            None
        };
        let host = if host_key.as_ref() == Some(&active_key) {
            hosts.advance().await?
        } else {
            None
        };

        let mut duplicate_hosts = Vec::new();
        if host.is_some() {
            while hosts
                .peek()
                .await?
                .is_some_and(|next| SortKey::from_host(next) == active_key)
            {
                if let Some(duplicate) = hosts.advance().await? {
                    tracing::debug!(
                        host_id = %duplicate.id,
                        instance_id = %duplicate.instance_id,
                        "Duplicate persisted host"
                    );
                    duplicate_hosts.push(duplicate);
                }
            }
        }

        if let Some(uuid) = fact.as_ref().and_then(|f| f.effective_hypervisor_uuid()) {
            if !context.is_tracking(uuid) {
                context = track_active_hypervisor(uuid, &mut hypervisor_ids).await?;
            }
        }

        let instance_id = fact.as_ref().map(|f| f.instance_id().to_string());
        let is_duplicate_fact =
            instance_id.is_some() && instance_id.as_deref() == previous_instance_id.as_deref();
        previous_instance_id = instance_id;

        let pair = if is_duplicate_fact {
            tracing::debug!(
                instance_id = ?previous_instance_id,
                "Skipping duplicate inventory record for instance"
            );
            if host.is_none() && duplicate_hosts.is_empty() {
                continue;
            }
            CorrelatedPair {
                facts: None,
                host,
                duplicate_hosts,
            }
        } else {
            CorrelatedPair {
                facts: fact,
                host,
                duplicate_hosts,
            }
        };

        visitor.visit(pair, &mut context, iteration).await?;
    }

    Ok(iteration)
}

/// Skip active ids below `hypervisor_uuid` and report whether it is present.
async fn track_active_hypervisor(
    hypervisor_uuid: &str,
    active_ids: &mut Cursor<'_, String>,
) -> Result<OrgHostsData, AppError> {
    while active_ids
        .peek()
        .await?
        .is_some_and(|id| id.as_str() < hypervisor_uuid)
    {
        active_ids.advance().await?;
    }
    let mapped = active_ids
        .peek()
        .await?
        .is_some_and(|id| id == hypervisor_uuid);
    tracing::debug!(hypervisor_uuid = %hypervisor_uuid, mapped, "Tracking hypervisor");
    Ok(OrgHostsData::tracking(hypervisor_uuid, mapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HBI_HOST;
    use futures::stream;

    fn fact(inventory_id: &str, subman: &str, hypervisor: Option<&str>) -> HostFacts {
        HostFacts {
            org_id: "org1".into(),
            inventory_id: inventory_id.into(),
            subscription_manager_id: Some(subman.into()),
            hypervisor_uuid: hypervisor.map(str::to_string),
            ..Default::default()
        }
    }

    fn host(inventory_id: &str, subman: &str, hypervisor: Option<&str>) -> Host {
        let mut host = Host::new("org1", inventory_id, HBI_HOST);
        host.inventory_id = Some(inventory_id.into());
        host.subscription_manager_id = Some(subman.into());
        host.hypervisor_uuid = hypervisor.map(str::to_string);
        host
    }

    fn sorted_stream<T: Send + 'static>(
        mut items: Vec<T>,
        key: fn(&T) -> SortKey,
    ) -> BoxStream<'static, Result<T, AppError>> {
        items.sort_by_key(key);
        stream::iter(items.into_iter().map(Ok)).boxed()
    }

    fn ids(ids: &[&str]) -> BoxStream<'static, Result<String, AppError>> {
        let ids: Vec<Result<String, AppError>> = ids.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(ids).boxed()
    }

    #[derive(Default)]
    struct Recorder {
        visits: Vec<(Option<String>, Option<String>, usize, bool)>,
        guest_counts: Vec<i32>,
    }

    #[async_trait]
    impl CorrelationVisitor for Recorder {
        async fn visit(
            &mut self,
            pair: CorrelatedPair,
            context: &mut OrgHostsData,
            _iteration: usize,
        ) -> Result<(), TallyError> {
            let mut is_hypervisor = false;
            if let Some(f) = &pair.facts {
                if let Some(uuid) = f.effective_hypervisor_uuid() {
                    if context.is_mapped_hypervisor(uuid) {
                        context.increment_guest_count();
                    }
                }
                if let Some(id) = &f.subscription_manager_id {
                    if let Some(placeholder) = context.take_placeholder(id) {
                        is_hypervisor = true;
                        self.guest_counts.push(placeholder.guest_count);
                    }
                }
            }
            self.visits.push((
                pair.facts.map(|f| f.inventory_id),
                pair.host.and_then(|h| h.inventory_id),
                pair.duplicate_hosts.len(),
                is_hypervisor,
            ));
            Ok(())
        }
    }

    #[test]
    fn guests_sort_before_their_hypervisor() {
        let hypervisor = SortKey::from_facts(&fact("inv-h", "hyp-1", None));
        let guest = SortKey::from_facts(&fact("inv-z", "guest", Some("hyp-1")));
        assert!(guest < hypervisor);
        let other = SortKey::from_facts(&fact("inv-a", "hyp-2", None));
        assert!(hypervisor < other);
    }

    #[tokio::test]
    async fn visits_each_key_once_with_presence_flags() {
        let facts = sorted_stream(
            vec![fact("a", "sm-a", None), fact("b", "sm-b", None)],
            SortKey::from_facts,
        );
        let hosts = sorted_stream(
            vec![host("b", "sm-b", None), host("c", "sm-c", None)],
            SortKey::from_host,
        );
        let mut recorder = Recorder::default();
        let iterations = correlate(facts, hosts, ids(&[]), &mut recorder).await.unwrap();

        assert_eq!(iterations, 3);
        assert_eq!(
            recorder.visits,
            vec![
                (Some("a".into()), None, 0, false),
                (Some("b".into()), Some("b".into()), 0, false),
                (None, Some("c".into()), 0, false),
            ]
        );
    }

    #[tokio::test]
    async fn empty_streams_visit_nothing() {
        let mut recorder = Recorder::default();
        let iterations = correlate(
            sorted_stream(Vec::new(), SortKey::from_facts),
            sorted_stream(Vec::new(), SortKey::from_host),
            ids(&[]),
            &mut recorder,
        )
        .await
        .unwrap();
        assert_eq!(iterations, 0);
        assert!(recorder.visits.is_empty());
    }

    #[tokio::test]
    async fn hypervisor_sees_guest_count_of_its_group() {
        let facts = sorted_stream(
            vec![
                fact("hyp", "hyp-1", None),
                fact("g1", "guest-1", Some("hyp-1")),
                fact("g2", "guest-2", Some("hyp-1")),
                fact("orphan", "guest-3", Some("hyp-missing")),
            ],
            SortKey::from_facts,
        );
        let mut recorder = Recorder::default();
        correlate(
            facts,
            sorted_stream(Vec::new(), SortKey::from_host),
            ids(&["hyp-0", "hyp-1", "hyp-2"]),
            &mut recorder,
        )
        .await
        .unwrap();

        assert_eq!(recorder.guest_counts, vec![2]);
        let hypervisor_visit = recorder
            .visits
            .iter()
            .find(|v| v.0.as_deref() == Some("hyp"))
            .unwrap();
        assert!(hypervisor_visit.3);
    }

    #[tokio::test]
    async fn duplicate_hosts_ride_along_with_the_first() {
        let hosts = sorted_stream(
            vec![host("a", "sm-a", None), host("a", "sm-a", None)],
            SortKey::from_host,
        );
        let facts = sorted_stream(vec![fact("a", "sm-a", None)], SortKey::from_facts);
        let mut recorder = Recorder::default();
        let iterations = correlate(facts, hosts, ids(&[]), &mut recorder).await.unwrap();
        assert_eq!(iterations, 1);
        assert_eq!(recorder.visits, vec![(Some("a".into()), Some("a".into()), 1, false)]);
    }

    #[tokio::test]
    async fn repeated_instance_id_only_releases_its_host() {
        let mut first = fact("a", "sm-a", None);
        first.provider_id = Some("i-1".into());
        let mut second = fact("b", "sm-b", None);
        second.provider_id = Some("i-1".into());
        let facts = sorted_stream(vec![first, second], SortKey::from_facts);
        let hosts = sorted_stream(vec![host("b", "sm-b", None)], SortKey::from_host);

        let mut recorder = Recorder::default();
        correlate(facts, hosts, ids(&[]), &mut recorder).await.unwrap();
        assert_eq!(
            recorder.visits,
            vec![(Some("a".into()), None, 0, false), (None, Some("b".into()), 0, false)]
        );
    }

    #[tokio::test]
    async fn stream_errors_abort_the_pass() {
        let facts: BoxStream<'static, Result<HostFacts, AppError>> =
            stream::iter(vec![Err(AppError::ServiceUnavailable)]).boxed();
        let mut recorder = Recorder::default();
        let result = correlate(
            facts,
            sorted_stream(Vec::new(), SortKey::from_host),
            ids(&[]),
            &mut recorder,
        )
        .await;
        assert!(matches!(result, Err(TallyError::Store(AppError::ServiceUnavailable))));
    }
}
