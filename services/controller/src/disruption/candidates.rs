//! Disruption candidates.
//!
//! A node is a candidate when it is Ready, belongs to a pool whose policy
//! allows disruption, is neither reserved nor nominated, and holds no pod
//! that forbids disruption. Each candidate carries the reason it could be
//! removed and is ordered by how cheap it is to disrupt.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flotilla_id::{NodeId, PodId};
use flotilla_reconcile::{order_for_disruption, DisruptionPriority};
use serde::Serialize;

use crate::catalog::{CapacityType, CatalogSnapshot};
use crate::nodepool::{ConsolidationPolicy, PoolSet, RegisteredPool};
use crate::state::{ClusterSnapshot, NodeLifecycle, PodRecord, StateNode};

/// Where a node stands with the consolidation engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    #[default]
    Active,
    CandidateForDeletion,
    CandidateForReplacement,
    ReservedForTermination,
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateState::Active => "active",
            CandidateState::CandidateForDeletion => "candidate_for_deletion",
            CandidateState::CandidateForReplacement => "candidate_for_replacement",
            CandidateState::ReservedForTermination => "reserved_for_termination",
        };
        f.write_str(s)
    }
}

/// A node that could be disrupted.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: Arc<StateNode>,
    pub pool: Arc<RegisteredPool>,
    /// Pods that would have to move.
    pub pods: Vec<Arc<PodRecord>>,
    pub priority: DisruptionPriority,
    /// Current hourly price, if the catalog still lists the offering.
    pub price: Option<f64>,
}

impl Candidate {
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn is_spot(&self) -> bool {
        self.node.capacity_type == CapacityType::Spot
    }

    pub fn pod_ids(&self) -> BTreeSet<PodId> {
        self.pods.iter().map(|p| p.id()).collect()
    }

    /// Fewer pods first, then older nodes.
    fn disruption_cost(&self, now: DateTime<Utc>) -> f64 {
        let age_hours = (now - self.node.created_at).num_seconds().max(0) as f64 / 3600.0;
        self.pods.len() as f64 + 1.0 / (1.0 + age_hours)
    }
}

fn priority(
    node: &StateNode,
    pool: &RegisteredPool,
    pods: &[Arc<PodRecord>],
    now: DateTime<Utc>,
) -> Option<DisruptionPriority> {
    let policy = &pool.pool.disruption;
    let elapsed = |since: DateTime<Utc>| (now - since).to_std().unwrap_or_default();

    if pods.is_empty() && elapsed(node.pods_changed_at) >= policy.consolidate_after {
        return Some(DisruptionPriority::Empty);
    }
    if policy
        .expire_after
        .is_some_and(|ttl| elapsed(node.created_at) >= ttl)
    {
        return Some(DisruptionPriority::Expired);
    }
    if node
        .pool_fingerprint()
        .is_some_and(|f| f != pool.fingerprint)
    {
        return Some(DisruptionPriority::Drifted);
    }
    if policy.consolidation_policy == ConsolidationPolicy::WhenUnderutilized && !pods.is_empty() {
        return Some(DisruptionPriority::Underutilized);
    }
    None
}

/// Disruption candidates in `snapshot`, cheapest to disrupt first.
pub fn candidates(
    snapshot: &ClusterSnapshot,
    pools: &PoolSet,
    catalog: &CatalogSnapshot,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let found = snapshot
        .nodes()
        .filter(|n| n.lifecycle == NodeLifecycle::Ready)
        .filter(|n| !n.marked_for_deletion && !n.is_nominated(now))
        .filter_map(|node| {
            let pool = pools.get(node.node_pool.as_deref()?)?;
            if pool.pool.disruption.consolidation_policy == ConsolidationPolicy::Never {
                return None;
            }

            let pods: Vec<_> = snapshot
                .pods_on(&node.id)
                .into_iter()
                .filter(|p| !p.pod.terminating)
                .collect();
            if pods.iter().any(|p| p.blocks_disruption()) {
                return None;
            }

            let priority = priority(node, pool, &pods, now)?;
            Some(Candidate {
                price: catalog.find(&node.offering_key()).map(|o| o.price),
                node: Arc::clone(node),
                pool: Arc::clone(pool),
                pods,
                priority,
            })
        })
        .collect();

    order_for_disruption(found, |c| (c.priority, c.disruption_cost(now), c.id()))
}

/// The earliest moment after `now` at which a node's eligibility changes
/// with no event: a nomination lapses, an empty node has waited out
/// `consolidate_after`, or a node reaches `expire_after`.
pub fn next_eligibility_change(
    snapshot: &ClusterSnapshot,
    pools: &PoolSet,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let after = |since: DateTime<Utc>, wait: Duration| {
        chrono::Duration::from_std(wait).ok().and_then(|w| since.checked_add_signed(w))
    };

    snapshot
        .nodes()
        .filter(|n| n.lifecycle == NodeLifecycle::Ready && !n.marked_for_deletion)
        .filter_map(|node| {
            let pool = pools.get(node.node_pool.as_deref()?)?;
            let policy = &pool.pool.disruption;
            if policy.consolidation_policy == ConsolidationPolicy::Never {
                return None;
            }

            let empty = snapshot.pods_on(&node.id).iter().all(|p| p.pod.terminating);
            [
                node.nominated_until,
                empty
                    .then(|| after(node.pods_changed_at, policy.consolidate_after))
                    .flatten(),
                policy.expire_after.and_then(|ttl| after(node.created_at, ttl)),
            ]
            .into_iter()
            .flatten()
            .filter(|at| *at > now)
            .min()
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Offering;
    use crate::constraints::{labels, Labels};
    use crate::nodepool::NodePool;
    use crate::resources::Resources;
    use crate::state::{Cluster, NodeObject, PodObject};
    use flotilla_events::ChangeEvent;
    use flotilla_id::ResourceVersion;
    use std::time::Duration;

    fn node(pool: &str, age: chrono::Duration) -> NodeObject {
        let capacity = Resources::cores_gib(4, 16).with_pods(110);
        NodeObject {
            id: NodeId::new(),
            provider_id: None,
            zone: "zone-a".to_string(),
            shape: "m.large".to_string(),
            capacity_type: CapacityType::OnDemand,
            capacity,
            allocatable: capacity,
            labels: Labels::new(),
            taints: vec![],
            node_pool: Some(pool.to_string()),
            ready: true,
            deleting: false,
            created_at: Utc::now() - age,
        }
    }

    fn catalog() -> CatalogSnapshot {
        let capacity = Resources::cores_gib(4, 16).with_pods(110);
        CatalogSnapshot::new(
            1,
            vec![Offering {
                shape: "m.large".to_string(),
                capacity,
                allocatable: capacity,
                zone: "zone-a".to_string(),
                capacity_type: CapacityType::OnDemand,
                price: 0.2,
                observed_at: Utc::now(),
            }],
        )
    }

    struct Fleet {
        cluster: Cluster,
        version: u64,
    }

    impl Fleet {
        fn new() -> Self {
            Self {
                cluster: Cluster::new(),
                version: 0,
            }
        }

        fn next(&mut self) -> ResourceVersion {
            self.version += 1;
            ResourceVersion::new(self.version)
        }

        fn node(&mut self, node: NodeObject) -> NodeId {
            let id = node.id;
            let rv = self.next();
            self.cluster.apply_node_event(&ChangeEvent::added(node, rv));
            id
        }

        fn pod(&mut self, pod: PodObject) {
            let rv = self.next();
            self.cluster.apply_pod_event(&ChangeEvent::added(pod, rv));
        }
    }

    fn pod_on(node: NodeId) -> PodObject {
        PodObject::pending("default", "web", Resources::cores_gib(1, 1)).bound_to(node)
    }

    fn pools(pool: NodePool) -> PoolSet {
        PoolSet::new(vec![pool]).unwrap()
    }

    #[test]
    fn test_priorities_and_order() {
        let mut fleet = Fleet::new();
        let busy = fleet.node(node("default", chrono::Duration::hours(1)));
        fleet.pod(pod_on(busy));
        let empty = fleet.node(node("default", chrono::Duration::hours(1)));

        let found = candidates(
            &fleet.cluster.snapshot(),
            &pools(NodePool::new("default")),
            &catalog(),
            Utc::now(),
        );
        let ids: Vec<_> = found.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![empty, busy]);
        assert_eq!(found[0].priority, DisruptionPriority::Empty);
        assert_eq!(found[1].priority, DisruptionPriority::Underutilized);
        assert_eq!(found[1].price, Some(0.2));
    }

    #[test]
    fn test_protected_nodes_are_skipped() {
        let mut fleet = Fleet::new();
        let pinned = fleet.node(node("default", chrono::Duration::hours(1)));
        let mut pod = pod_on(pinned);
        pod.do_not_disrupt = true;
        fleet.pod(pod);

        let unowned = fleet.node(node("default", chrono::Duration::hours(1)));
        let mut pod = pod_on(unowned);
        pod.owner = None;
        fleet.pod(pod);

        let nominated = fleet.node(node("default", chrono::Duration::hours(1)));
        fleet
            .cluster
            .nominate(&nominated, Utc::now() + chrono::Duration::minutes(1));

        let marked = fleet.node(node("default", chrono::Duration::hours(1)));
        fleet.cluster.mark_for_deletion(&[marked]);

        fleet.node(node("unknown-pool", chrono::Duration::hours(1)));

        let found = candidates(
            &fleet.cluster.snapshot(),
            &pools(NodePool::new("default")),
            &catalog(),
            Utc::now(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_policy_gates_consolidation() {
        let mut fleet = Fleet::new();
        let busy = fleet.node(node("default", chrono::Duration::hours(1)));
        fleet.pod(pod_on(busy));

        let mut when_empty = NodePool::new("default");
        when_empty.disruption.consolidation_policy = ConsolidationPolicy::WhenEmpty;
        let found = candidates(&fleet.cluster.snapshot(), &pools(when_empty), &catalog(), Utc::now());
        assert!(found.is_empty());

        let mut never = NodePool::new("default");
        never.disruption.consolidation_policy = ConsolidationPolicy::Never;
        fleet.node(node("default", chrono::Duration::hours(1)));
        let found = candidates(&fleet.cluster.snapshot(), &pools(never), &catalog(), Utc::now());
        assert!(found.is_empty());
    }

    #[test]
    fn test_recently_emptied_node_waits() {
        let mut fleet = Fleet::new();
        fleet.node(node("default", chrono::Duration::hours(1)));

        let mut pool = NodePool::new("default");
        pool.disruption.consolidation_policy = ConsolidationPolicy::WhenEmpty;
        pool.disruption.consolidate_after = Duration::from_secs(7200);
        let found = candidates(&fleet.cluster.snapshot(), &pools(pool), &catalog(), Utc::now());
        assert!(found.is_empty());
    }

    #[test]
    fn test_expired_and_drifted() {
        let mut fleet = Fleet::new();
        let old = fleet.node(node("default", chrono::Duration::days(30)));
        fleet.pod(pod_on(old));

        let mut drifted = node("default", chrono::Duration::hours(1));
        drifted
            .labels
            .insert(labels::NODE_POOL_FINGERPRINT.to_string(), "stale".to_string());
        let drifted = fleet.node(drifted);
        fleet.pod(pod_on(drifted));

        let mut pool = NodePool::new("default");
        pool.disruption.expire_after = Some(Duration::from_secs(7 * 24 * 3600));
        let found = candidates(&fleet.cluster.snapshot(), &pools(pool), &catalog(), Utc::now());

        let got: Vec<_> = found.iter().map(|c| (c.id(), c.priority)).collect();
        assert_eq!(
            got,
            vec![
                (old, DisruptionPriority::Expired),
                (drifted, DisruptionPriority::Drifted)
            ]
        );
    }

    #[test]
    fn test_next_eligibility_change() {
        let mut fleet = Fleet::new();
        let now = Utc::now();

        let fresh = fleet.node(node("default", chrono::Duration::minutes(1)));
        let busy = fleet.node(node("default", chrono::Duration::hours(1)));
        fleet.pod(pod_on(busy));
        let nominated = fleet.node(node("default", chrono::Duration::hours(1)));
        fleet.pod(pod_on(nominated));
        let until = now + chrono::Duration::minutes(3);
        fleet.cluster.nominate(&nominated, until);

        let mut pool = NodePool::new("default");
        pool.disruption.consolidate_after = Duration::from_secs(600);
        let snapshot = fleet.cluster.snapshot();
        let fresh_created = snapshot.node(&fresh).unwrap().created_at;

        // The nomination lapses before the fresh node has been empty long
        // enough.
        let next = next_eligibility_change(&snapshot, &pools(pool.clone()), now);
        assert_eq!(next, Some(until));

        let later = until + chrono::Duration::seconds(1);
        let next = next_eligibility_change(&snapshot, &pools(pool.clone()), later);
        assert_eq!(next, Some(fresh_created + chrono::Duration::minutes(10)));

        pool.disruption.expire_after = Some(Duration::from_secs(7200));
        let next = next_eligibility_change(&snapshot, &pools(pool), later);
        assert_eq!(next, Some(fresh_created + chrono::Duration::minutes(10)));

        let mut never = NodePool::new("default");
        never.disruption.consolidation_policy = ConsolidationPolicy::Never;
        never.disruption.consolidate_after = Duration::from_secs(600);
        assert_eq!(next_eligibility_change(&snapshot, &pools(never), now), None);
    }
}
