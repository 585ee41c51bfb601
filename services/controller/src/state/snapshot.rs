//! Immutable cluster snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flotilla_id::{NodeId, PodId};

use super::node::StateNode;
use super::pod::PodRecord;
use crate::resources::Resources;

/// Point-in-time view of nodes and pods.
///
/// Records are shared with the tracker through `Arc`, so taking a snapshot
/// copies two maps of pointers and never blocks writers for long.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub(crate) version: u64,
    pub(crate) nodes: BTreeMap<NodeId, Arc<StateNode>>,
    pub(crate) pods: BTreeMap<PodId, Arc<PodRecord>>,
}

impl ClusterSnapshot {
    /// Bumped on every tracker mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<StateNode>> {
        self.nodes.values()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<StateNode>> {
        self.nodes.get(id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Arc<PodRecord>> {
        self.pods.values()
    }

    pub fn pod(&self, id: &PodId) -> Option<&Arc<PodRecord>> {
        self.pods.get(id)
    }

    /// Pods bound to `node`, in id order.
    pub fn pods_on(&self, node: &NodeId) -> Vec<Arc<PodRecord>> {
        self.nodes
            .get(node)
            .map(|n| {
                n.pods
                    .iter()
                    .filter_map(|id| self.pods.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pods waiting for capacity, in id order.
    pub fn unschedulable_pods(&self) -> Vec<Arc<PodRecord>> {
        self.pods
            .values()
            .filter(|p| p.is_unschedulable())
            .cloned()
            .collect()
    }

    /// The snapshot as it would look with `removed` gone.
    ///
    /// Pods bound to removed nodes become unbound.
    pub fn without_nodes(&self, removed: &BTreeSet<NodeId>) -> ClusterSnapshot {
        let nodes = self
            .nodes
            .iter()
            .filter(|(id, _)| !removed.contains(id))
            .map(|(id, n)| (*id, Arc::clone(n)))
            .collect();

        let pods = self
            .pods
            .iter()
            .map(|(id, p)| match p.bound_to {
                Some(node) if removed.contains(&node) => {
                    let mut unbound = PodRecord::clone(p);
                    unbound.bound_to = None;
                    (*id, Arc::new(unbound))
                }
                _ => (*id, Arc::clone(p)),
            })
            .collect();

        ClusterSnapshot {
            version: self.version,
            nodes,
            pods,
        }
    }

    /// The snapshot as it would look with each claimed pod bound to the
    /// node it points at.
    ///
    /// Claims for bound pods or unknown nodes are ignored.
    pub fn with_claims(&self, claims: &BTreeMap<PodId, NodeId>) -> ClusterSnapshot {
        let mut snapshot = self.clone();

        for (pod_id, node_id) in claims {
            let (Some(pod), Some(node)) = (snapshot.pods.get(pod_id), snapshot.nodes.get(node_id)) else {
                continue;
            };
            if pod.bound_to.is_some() {
                continue;
            }

            let mut bound = PodRecord::clone(pod);
            bound.bound_to = Some(*node_id);
            bound.pod.node = Some(*node_id);

            let mut host = StateNode::clone(node);
            host.pods.insert(*pod_id);
            host.requested = host.requested.saturating_add(&bound.requests());

            snapshot.pods.insert(*pod_id, Arc::new(bound));
            snapshot.nodes.insert(*node_id, Arc::new(host));
        }

        snapshot
    }

    /// Summed capacity of the nodes owned by `pool`.
    pub fn pool_usage(&self, pool: &str) -> Resources {
        self.nodes
            .values()
            .filter(|n| n.node_pool.as_deref() == Some(pool))
            .map(|n| n.capacity)
            .sum()
    }

    pub fn zones(&self) -> BTreeSet<String> {
        self.nodes.values().map(|n| n.zone.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use flotilla_events::ChangeEvent;
    use flotilla_id::ResourceVersion;

    use super::*;
    use crate::catalog::CapacityType;
    use crate::constraints::Labels;
    use crate::state::{Cluster, NodeObject, PodObject};

    fn node() -> NodeObject {
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
            node_pool: Some("default".to_string()),
            ready: true,
            deleting: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_claims_take_room_without_touching_tracker() {
        let cluster = Cluster::new();
        let host = node();
        cluster.apply_node_event(&ChangeEvent::added(host.clone(), ResourceVersion::new(1)));
        let pending = PodObject::pending("default", "web", Resources::cores_gib(3, 4));
        cluster.apply_pod_event(&ChangeEvent::added(pending.clone(), ResourceVersion::new(2)));

        let snapshot = cluster.snapshot();
        let claimed = snapshot.with_claims(&BTreeMap::from([(pending.id, host.id)]));

        let before = snapshot.node(&host.id).unwrap();
        let after = claimed.node(&host.id).unwrap();
        assert_eq!(after.requested, before.requested + pending.requests.with_pods(1));
        assert!(after.pods.contains(&pending.id));
        assert_eq!(claimed.pod(&pending.id).unwrap().bound_to, Some(host.id));
        assert!(claimed.unschedulable_pods().is_empty());

        assert_eq!(snapshot.unschedulable_pods().len(), 1);
        assert!(cluster.snapshot().node(&host.id).unwrap().pods.is_empty());
    }

    #[test]
    fn test_claims_on_unknown_nodes_are_ignored() {
        let cluster = Cluster::new();
        let pending = PodObject::pending("default", "web", Resources::cores_gib(1, 1));
        cluster.apply_pod_event(&ChangeEvent::added(pending.clone(), ResourceVersion::new(1)));

        let snapshot = cluster.snapshot();
        let claimed = snapshot.with_claims(&BTreeMap::from([(pending.id, NodeId::new())]));
        assert_eq!(claimed.unschedulable_pods().len(), 1);
    }
}
