//! Fleet state tracker.
//!
//! The tracker is the single source of truth for what capacity exists and
//! what is using it. Writers are serialized through one mutex; every
//! mutation republishes an immutable [`ClusterSnapshot`] through an
//! `ArcSwap`, so readers never take the lock.
//!
//! # Invariants
//!
//! - A node's `requested` is recomputed from its bound pods, never
//!   accumulated, so replayed events cannot drift it
//! - Every bound pod's node exists; pods naming an unknown node are held as
//!   orphans and bound when the node arrives
//! - Events older than the last applied version of the same object are
//!   dropped; deletions leave a tombstone so replays cannot resurrect
//! - A node only becomes `Deleting` while it has no bound pods

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use flotilla_events::{ChangeEvent, ObjectKind};
use flotilla_id::{NodeId, PodId, ResourceVersion};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::node::{NodeLifecycle, StateNode};
use super::objects::{NodeObject, PodObject};
use super::pod::PodRecord;
use super::snapshot::ClusterSnapshot;
use crate::catalog::Offering;
use crate::cloudprovider::{LaunchRequest, NodeHandle};
use crate::error::StateError;
use crate::resources::Resources;

/// How many inconsistencies are kept for inspection.
pub const MAX_INCONSISTENCIES: usize = 256;

/// Something in the event stream that did not add up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    /// A pod is bound to a node the tracker has not seen.
    PodOnUnknownNode { pod: PodId, node: NodeId },

    /// Bound pods request more than the node can hold.
    Overcommitted {
        node: NodeId,
        requested: Resources,
        allocatable: Resources,
    },

    /// An event older than what was already applied.
    StaleEvent {
        object: ObjectKind,
        id: String,
        version: ResourceVersion,
        applied: ResourceVersion,
    },
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event matched the current state.
    Unchanged,
    /// The event was older than the applied version and was dropped.
    Stale,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, Arc<StateNode>>,
    pods: BTreeMap<PodId, Arc<PodRecord>>,
    node_tombstones: HashMap<NodeId, Tombstone>,
    pod_tombstones: HashMap<PodId, Tombstone>,
    orphans: BTreeMap<NodeId, BTreeSet<PodId>>,
    inconsistencies: VecDeque<Inconsistency>,
    version: u64,
}

/// Last deleted version of an object, kept for a while to reject replays.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: ResourceVersion,
    deleted_at: DateTime<Utc>,
}

impl Tombstone {
    fn after(previous: Option<ResourceVersion>, version: ResourceVersion) -> Self {
        Self {
            version: previous.map_or(version, |t| t.max(version)),
            deleted_at: Utc::now(),
        }
    }
}

/// Returns the version `version` is stale against, if any.
fn stale_against(
    applied: Option<ResourceVersion>,
    tombstone: Option<ResourceVersion>,
    version: ResourceVersion,
    upsert: bool,
) -> Option<ResourceVersion> {
    match (applied, tombstone) {
        (Some(applied), _) if version.is_stale_against(applied) => Some(applied),
        (None, Some(deleted)) if upsert && version <= deleted => Some(deleted),
        _ => None,
    }
}

impl ClusterState {
    fn record(&mut self, inconsistency: Inconsistency) {
        warn!(?inconsistency, "Fleet state inconsistency");
        if self.inconsistencies.len() == MAX_INCONSISTENCIES {
            self.inconsistencies.pop_front();
        }
        self.inconsistencies.push_back(inconsistency);
    }

    fn record_stale(
        &mut self,
        object: ObjectKind,
        id: String,
        version: ResourceVersion,
        applied: ResourceVersion,
    ) {
        debug!(%object, %id, %version, %applied, "Dropping stale event");
        self.record(Inconsistency::StaleEvent {
            object,
            id,
            version,
            applied,
        });
    }

    /// Sum of the requests of `pods` that are present.
    fn requested(&self, pods: &BTreeSet<PodId>) -> Resources {
        pods.iter()
            .filter_map(|id| self.pods.get(id))
            .map(|p| p.requests())
            .sum()
    }

    /// Recompute a node's usage from its pods.
    fn recompute(&mut self, node_id: &NodeId) {
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };
        let requested = self.requested(&node.pods);
        if requested == node.requested {
            return;
        }

        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        let node = Arc::make_mut(node);
        node.requested = requested;

        if node.is_overcommitted() {
            let inconsistency = Inconsistency::Overcommitted {
                node: node.id,
                requested: node.requested,
                allocatable: node.allocatable,
            };
            self.record(inconsistency);
        }
    }

    fn attach(&mut self, pod: PodId, node_id: &NodeId, at: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            let node = Arc::make_mut(node);
            if node.pods.insert(pod) {
                node.pods_changed_at = at;
            }
        }
    }

    fn detach(&mut self, pod: PodId, node_id: &NodeId, at: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            let node = Arc::make_mut(node);
            if node.pods.remove(&pod) {
                node.pods_changed_at = at;
            }
        }
    }

    fn forget_orphan(&mut self, pod: PodId, node_id: &NodeId) {
        if let Some(waiting) = self.orphans.get_mut(node_id) {
            waiting.remove(&pod);
            if waiting.is_empty() {
                self.orphans.remove(node_id);
            }
        }
    }

    fn apply_node(&mut self, event: &ChangeEvent<NodeObject>) -> ApplyOutcome {
        let id = event.payload.id;
        let version = event.resource_version;
        let applied = self.nodes.get(&id).map(|n| n.resource_version);
        let tombstone = self.node_tombstones.get(&id).map(|t| t.version);

        if let Some(against) = stale_against(applied, tombstone, version, event.change.is_upsert()) {
            self.record_stale(ObjectKind::Node, id.to_string(), version, against);
            return ApplyOutcome::Stale;
        }

        if !event.change.is_upsert() {
            self.node_tombstones.insert(id, Tombstone::after(tombstone, version));

            let Some(node) = self.nodes.remove(&id) else {
                return ApplyOutcome::Unchanged;
            };

            // Pods still bound wait for the node to come back or for their own deletion.
            for pod_id in &node.pods {
                if let Some(pod) = self.pods.get_mut(pod_id) {
                    Arc::make_mut(pod).bound_to = None;
                    self.orphans.entry(id).or_default().insert(*pod_id);
                }
            }
            info!(node_id = %id, pods = node.pods.len(), "Node removed");
            return ApplyOutcome::Applied;
        }

        let previous = self.nodes.get(&id).cloned();
        let mut node = StateNode::from_object(&event.payload, version, previous.as_deref());

        let waiting = self.orphans.remove(&id).unwrap_or_default();
        for pod_id in waiting {
            if let Some(pod) = self.pods.get_mut(&pod_id) {
                if pod.pod.node == Some(id) && pod.bound_to.is_none() {
                    Arc::make_mut(pod).bound_to = Some(id);
                    if node.pods.insert(pod_id) {
                        node.pods_changed_at = event.observed_at;
                    }
                }
            }
        }
        node.requested = self.requested(&node.pods);

        if previous.as_deref() == Some(&node) {
            return ApplyOutcome::Unchanged;
        }

        match previous.as_deref() {
            Some(p) if p.is_provisional() => {
                info!(node_id = %id, lifecycle = ?node.lifecycle, "Provisional node confirmed");
            }
            None => info!(node_id = %id, zone = %node.zone, shape = %node.shape, "Node added"),
            _ => {}
        }

        if node.is_overcommitted() {
            self.record(Inconsistency::Overcommitted {
                node: id,
                requested: node.requested,
                allocatable: node.allocatable,
            });
        }

        self.nodes.insert(id, Arc::new(node));
        ApplyOutcome::Applied
    }

    fn apply_pod(&mut self, event: &ChangeEvent<PodObject>) -> ApplyOutcome {
        let id = event.payload.id;
        let version = event.resource_version;
        let at = event.observed_at;
        let applied = self.pods.get(&id).map(|p| p.resource_version);
        let tombstone = self.pod_tombstones.get(&id).map(|t| t.version);

        if let Some(against) = stale_against(applied, tombstone, version, event.change.is_upsert()) {
            self.record_stale(ObjectKind::Pod, id.to_string(), version, against);
            return ApplyOutcome::Stale;
        }

        if !event.change.is_upsert() {
            self.pod_tombstones.insert(id, Tombstone::after(tombstone, version));

            let Some(previous) = self.pods.remove(&id) else {
                return ApplyOutcome::Unchanged;
            };
            if let Some(node) = previous.bound_to {
                self.detach(id, &node, at);
                self.recompute(&node);
            } else if let Some(node) = previous.pod.node {
                self.forget_orphan(id, &node);
            }
            return ApplyOutcome::Applied;
        }

        let target = event.payload.node;
        let bound_to = target.filter(|n| self.nodes.contains_key(n));
        let record = PodRecord {
            pod: event.payload.clone(),
            bound_to,
            resource_version: version,
        };

        let previous = self.pods.get(&id).cloned();
        if previous.as_deref() == Some(&record) {
            return ApplyOutcome::Unchanged;
        }

        let was_orphaned_on = previous
            .as_ref()
            .filter(|p| p.bound_to.is_none())
            .and_then(|p| p.pod.node);
        if let Some(prev) = &previous {
            if let Some(node) = prev.bound_to {
                if bound_to != Some(node) {
                    self.detach(id, &node, at);
                }
            }
            if let Some(node) = was_orphaned_on {
                self.forget_orphan(id, &node);
            }
        }

        self.pods.insert(id, Arc::new(record));

        match (bound_to, target) {
            (Some(node), _) => self.attach(id, &node, at),
            (None, Some(node)) => {
                self.orphans.entry(node).or_default().insert(id);
                if was_orphaned_on != Some(node) {
                    self.record(Inconsistency::PodOnUnknownNode { pod: id, node });
                }
            }
            (None, None) => {}
        }

        let touched: BTreeSet<NodeId> = previous
            .and_then(|p| p.bound_to)
            .into_iter()
            .chain(bound_to)
            .collect();
        for node in touched {
            self.recompute(&node);
        }

        ApplyOutcome::Applied
    }
}

/// The fleet state tracker.
pub struct Cluster {
    state: Mutex<ClusterState>,
    published: ArcSwap<ClusterSnapshot>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            published: ArcSwap::from_pointee(ClusterSnapshot::default()),
        }
    }

    /// Run a mutation under the writer lock, republishing if it changed
    /// anything.
    fn write<R>(&self, mutate: impl FnOnce(&mut ClusterState) -> (R, bool)) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (result, changed) = mutate(&mut state);
        if changed {
            state.version += 1;
            self.published.store(Arc::new(ClusterSnapshot {
                version: state.version,
                nodes: state.nodes.clone(),
                pods: state.pods.clone(),
            }));
        }
        result
    }

    /// Apply a node change event.
    pub fn apply_node_event(&self, event: &ChangeEvent<NodeObject>) -> ApplyOutcome {
        self.write(|state| {
            let outcome = state.apply_node(event);
            (outcome, outcome == ApplyOutcome::Applied)
        })
    }

    /// Apply a pod change event.
    pub fn apply_pod_event(&self, event: &ChangeEvent<PodObject>) -> ApplyOutcome {
        self.write(|state| {
            let outcome = state.apply_pod(event);
            (outcome, outcome == ApplyOutcome::Applied)
        })
    }

    /// Current snapshot. Never blocks on writers.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.published.load_full()
    }

    /// Recorded inconsistencies, oldest first.
    pub fn inconsistencies(&self) -> Vec<Inconsistency> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inconsistencies.iter().cloned().collect()
    }

    /// Record a launched node before its own event arrives.
    ///
    /// Returns false if the node is already known, which happens when the
    /// event won the race.
    pub fn reserve_launch(
        &self,
        request: &LaunchRequest,
        handle: &NodeHandle,
        offering: &Offering,
    ) -> bool {
        self.write(|state| {
            let id = request.node_id;
            if state.nodes.contains_key(&id) || state.node_tombstones.contains_key(&id) {
                return (false, false);
            }

            let node = StateNode::provisional(
                request,
                handle,
                offering.capacity,
                offering.allocatable,
                Utc::now(),
            );
            debug!(node_id = %id, shape = %node.shape, zone = %node.zone, "Reserved launched node");
            state.nodes.insert(id, Arc::new(node));
            (true, true)
        })
    }

    /// Drop a provisional record that was never confirmed.
    pub fn rollback_launch(&self, id: &NodeId) -> bool {
        self.write(|state| {
            let provisional = state.nodes.get(id).is_some_and(|n| n.is_provisional());
            if provisional {
                state.nodes.remove(id);
                info!(node_id = %id, "Rolled back provisional node");
            }
            (provisional, provisional)
        })
    }

    /// Roll back provisional records reserved more than `ttl` ago.
    pub fn expire_provisional(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Arc<StateNode>> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.write(|state| {
            let expired: Vec<NodeId> = state
                .nodes
                .values()
                .filter(|n| match n.lifecycle {
                    NodeLifecycle::PendingLocal { reserved_at, .. } => {
                        reserved_at.checked_add_signed(ttl).is_some_and(|end| end < now)
                    }
                    _ => false,
                })
                .map(|n| n.id)
                .collect();

            let removed: Vec<_> = expired
                .iter()
                .filter_map(|id| state.nodes.remove(id))
                .collect();
            for node in &removed {
                warn!(node_id = %node.id, "Launched node never registered, rolling back");
            }

            let changed = !removed.is_empty();
            (removed, changed)
        })
    }

    /// Reserve nodes for termination. Returns how many changed.
    pub fn mark_for_deletion(&self, ids: &[NodeId]) -> usize {
        self.set_marked(ids, true)
    }

    /// Release nodes reserved for termination. Returns how many changed.
    pub fn unmark_for_deletion(&self, ids: &[NodeId]) -> usize {
        self.set_marked(ids, false)
    }

    fn set_marked(&self, ids: &[NodeId], marked: bool) -> usize {
        self.write(|state| {
            let mut count = 0;
            for id in ids {
                if let Some(node) = state.nodes.get_mut(id) {
                    if node.marked_for_deletion != marked {
                        Arc::make_mut(node).marked_for_deletion = marked;
                        count += 1;
                    }
                }
            }
            (count, count > 0)
        })
    }

    /// Transition a node to `Deleting`.
    ///
    /// Refuses while any pod is bound to it.
    pub fn mark_deleting(&self, id: &NodeId) -> Result<Arc<StateNode>, StateError> {
        self.write(|state| {
            let Some(node) = state.nodes.get_mut(id) else {
                return (Err(StateError::NodeNotFound(*id)), false);
            };
            if !node.pods.is_empty() {
                let err = StateError::NodeNotEmpty {
                    node: *id,
                    pods: node.pods.len(),
                };
                return (Err(err), false);
            }
            if node.lifecycle == NodeLifecycle::Deleting {
                return (Ok(Arc::clone(node)), false);
            }

            Arc::make_mut(node).lifecycle = NodeLifecycle::Deleting;
            (Ok(Arc::clone(node)), true)
        })
    }

    /// Forget deletions older than `ttl`. Returns how many were dropped.
    ///
    /// A replayed event for a forgotten object is applied again, so `ttl`
    /// must outlast any redelivery window.
    pub fn prune_tombstones(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.write(|state| {
            let live = |t: &Tombstone| t.deleted_at.checked_add_signed(ttl).is_none_or(|end| end >= now);
            let before = state.node_tombstones.len() + state.pod_tombstones.len();
            state.node_tombstones.retain(|_, t| live(t));
            state.pod_tombstones.retain(|_, t| live(t));
            let pruned = before - state.node_tombstones.len() - state.pod_tombstones.len();
            if pruned > 0 {
                debug!(pruned, "Pruned tombstones");
            }
            (pruned, false)
        })
    }

    /// Deletions currently remembered, nodes and pods together.
    pub fn tombstones(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.node_tombstones.len() + state.pod_tombstones.len()
    }

    /// Protect a node from consolidation until `until`.
    pub fn nominate(&self, id: &NodeId, until: DateTime<Utc>) -> bool {
        self.write(|state| match state.nodes.get_mut(id) {
            Some(node) if node.nominated_until.is_none_or(|u| u < until) => {
                Arc::make_mut(node).nominated_until = Some(until);
                (true, true)
            }
            _ => (false, false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CapacityType;
    use crate::constraints::Labels;
    use crate::state::{NodePhase, PodPhase};
    use flotilla_id::LaunchId;

    fn node_object() -> NodeObject {
        NodeObject {
            id: NodeId::new(),
            provider_id: Some("fake://a".to_string()),
            zone: "zone-a".to_string(),
            shape: "m.large".to_string(),
            capacity_type: CapacityType::OnDemand,
            capacity: Resources::cores_gib(4, 16).with_pods(110),
            allocatable: Resources::cores_gib(4, 16).with_pods(110),
            labels: Labels::new(),
            taints: vec![],
            node_pool: Some("default".to_string()),
            ready: true,
            deleting: false,
            created_at: Utc::now(),
        }
    }

    fn pod_on(node: NodeId, cores: u64) -> PodObject {
        PodObject::pending("default", "web", Resources::cores_gib(cores, 1)).bound_to(node)
    }

    fn rv(v: u64) -> ResourceVersion {
        ResourceVersion::new(v)
    }

    #[test]
    fn test_replayed_events_are_idempotent() {
        let cluster = Cluster::new();
        let node = node_object();
        let pod = pod_on(node.id, 1);

        let node_event = ChangeEvent::added(node.clone(), rv(1));
        let pod_event = ChangeEvent::added(pod.clone(), rv(1));

        assert_eq!(cluster.apply_node_event(&node_event), ApplyOutcome::Applied);
        assert_eq!(cluster.apply_pod_event(&pod_event), ApplyOutcome::Applied);
        let once = cluster.snapshot();

        assert_eq!(cluster.apply_pod_event(&pod_event), ApplyOutcome::Unchanged);
        assert_eq!(cluster.apply_node_event(&node_event), ApplyOutcome::Unchanged);
        let twice = cluster.snapshot();

        assert_eq!(once.version(), twice.version());
        let state = twice.node(&node.id).unwrap();
        assert_eq!(state.requested, Resources::cores_gib(1, 1).with_pods(1));
        assert_eq!(state.pods.len(), 1);
    }

    #[test]
    fn test_pod_before_node_reconciles() {
        let node = node_object();
        let pod = pod_on(node.id, 2);

        let in_order = Cluster::new();
        in_order.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        in_order.apply_pod_event(&ChangeEvent::added(pod.clone(), rv(1)));

        let reversed = Cluster::new();
        reversed.apply_pod_event(&ChangeEvent::added(pod.clone(), rv(1)));

        let early = reversed.snapshot();
        assert_eq!(early.pod(&pod.id).unwrap().phase(), PodPhase::Pending);
        assert!(matches!(
            reversed.inconsistencies().as_slice(),
            [Inconsistency::PodOnUnknownNode { .. }]
        ));

        reversed.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));

        let a = in_order.snapshot();
        let b = reversed.snapshot();
        assert_eq!(a.node(&node.id).unwrap().pods, b.node(&node.id).unwrap().pods);
        assert_eq!(
            a.node(&node.id).unwrap().requested,
            b.node(&node.id).unwrap().requested
        );
        assert_eq!(b.pod(&pod.id).unwrap().phase(), PodPhase::Bound);
    }

    #[test]
    fn test_stale_event_dropped() {
        let cluster = Cluster::new();
        let mut node = node_object();
        cluster.apply_node_event(&ChangeEvent::updated(node.clone(), rv(5)));

        node.ready = false;
        assert_eq!(
            cluster.apply_node_event(&ChangeEvent::updated(node.clone(), rv(4))),
            ApplyOutcome::Stale
        );
        assert_eq!(
            cluster.snapshot().node(&node.id).unwrap().phase(),
            NodePhase::Ready
        );
    }

    #[test]
    fn test_deleted_node_not_resurrected_by_replay() {
        let cluster = Cluster::new();
        let node = node_object();
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        cluster.apply_node_event(&ChangeEvent::deleted(node.clone(), rv(2)));
        assert_eq!(
            cluster.apply_node_event(&ChangeEvent::updated(node.clone(), rv(2))),
            ApplyOutcome::Stale
        );
        assert!(cluster.snapshot().node(&node.id).is_none());
    }

    #[test]
    fn test_pod_moves_between_nodes() {
        let cluster = Cluster::new();
        let a = node_object();
        let b = node_object();
        cluster.apply_node_event(&ChangeEvent::added(a.clone(), rv(1)));
        cluster.apply_node_event(&ChangeEvent::added(b.clone(), rv(1)));

        let pod = pod_on(a.id, 1);
        cluster.apply_pod_event(&ChangeEvent::added(pod.clone(), rv(1)));
        cluster.apply_pod_event(&ChangeEvent::updated(pod.clone().bound_to(b.id), rv(2)));

        let snapshot = cluster.snapshot();
        assert!(snapshot.node(&a.id).unwrap().pods.is_empty());
        assert_eq!(snapshot.node(&a.id).unwrap().requested, Resources::ZERO);
        assert_eq!(snapshot.node(&b.id).unwrap().pods.len(), 1);
    }

    #[test]
    fn test_overcommit_recorded_and_saturated() {
        let cluster = Cluster::new();
        let node = node_object();
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        let pod = PodObject::pending("default", "a", Resources::cores_gib(3, 1)).bound_to(node.id);
        cluster.apply_pod_event(&ChangeEvent::added(pod, rv(1)));
        let pod = PodObject::pending("default", "b", Resources::cores_gib(3, 1)).bound_to(node.id);
        cluster.apply_pod_event(&ChangeEvent::added(pod, rv(1)));

        let state = Arc::clone(cluster.snapshot().node(&node.id).unwrap());
        assert_eq!(state.available().cpu_millis, 0);
        assert!(cluster
            .inconsistencies()
            .iter()
            .any(|i| matches!(i, Inconsistency::Overcommitted { .. })));
    }

    fn launch(node_id: NodeId) -> (LaunchRequest, NodeHandle, Offering) {
        let request = LaunchRequest {
            node_id,
            launch_id: LaunchId::new(),
            shape: "m.large".to_string(),
            zone: "zone-a".to_string(),
            capacity_type: CapacityType::OnDemand,
            labels: Labels::new(),
            taints: vec![],
        };
        let handle = NodeHandle {
            node_id,
            provider_id: "fake://a".to_string(),
        };
        let offering = Offering {
            shape: "m.large".to_string(),
            capacity: Resources::cores_gib(4, 16),
            allocatable: Resources::cores_gib(4, 16),
            zone: "zone-a".to_string(),
            capacity_type: CapacityType::OnDemand,
            price: 0.2,
            observed_at: Utc::now(),
        };
        (request, handle, offering)
    }

    #[test]
    fn test_provisional_confirmed_by_event() {
        let cluster = Cluster::new();
        let node = node_object();
        let (request, handle, offering) = launch(node.id);

        assert!(cluster.reserve_launch(&request, &handle, &offering));
        assert!(cluster.snapshot().node(&node.id).unwrap().is_provisional());

        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        let confirmed = Arc::clone(cluster.snapshot().node(&node.id).unwrap());
        assert_eq!(confirmed.lifecycle, NodeLifecycle::Ready);
        assert!(!cluster.rollback_launch(&node.id));
    }

    #[test]
    fn test_reserve_after_event_is_noop() {
        let cluster = Cluster::new();
        let node = node_object();
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));

        let (request, handle, offering) = launch(node.id);
        assert!(!cluster.reserve_launch(&request, &handle, &offering));
        assert_eq!(
            cluster.snapshot().node(&node.id).unwrap().lifecycle,
            NodeLifecycle::Ready
        );
    }

    #[test]
    fn test_expire_provisional() {
        let cluster = Cluster::new();
        let (request, handle, offering) = launch(NodeId::new());
        cluster.reserve_launch(&request, &handle, &offering);

        let now = Utc::now();
        assert!(cluster
            .expire_provisional(now, Duration::from_secs(900))
            .is_empty());

        let later = now + chrono::Duration::seconds(901);
        let expired = cluster.expire_provisional(later, Duration::from_secs(900));
        assert_eq!(expired.len(), 1);
        assert!(cluster.snapshot().node(&request.node_id).is_none());
    }

    #[test]
    fn test_mark_deleting_requires_empty_node() {
        let cluster = Cluster::new();
        let node = node_object();
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        let pod = pod_on(node.id, 1);
        cluster.apply_pod_event(&ChangeEvent::added(pod.clone(), rv(1)));

        assert_eq!(cluster.mark_for_deletion(&[node.id]), 1);
        assert!(matches!(
            cluster.mark_deleting(&node.id),
            Err(StateError::NodeNotEmpty { pods: 1, .. })
        ));

        cluster.apply_pod_event(&ChangeEvent::deleted(pod, rv(2)));
        let deleting = cluster.mark_deleting(&node.id).unwrap();
        assert_eq!(deleting.phase(), NodePhase::Deleting);
        assert!(matches!(
            cluster.mark_deleting(&NodeId::new()),
            Err(StateError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_node_deletion_orphans_pods() {
        let cluster = Cluster::new();
        let node = node_object();
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        let pod = pod_on(node.id, 1);
        cluster.apply_pod_event(&ChangeEvent::added(pod.clone(), rv(1)));

        cluster.apply_node_event(&ChangeEvent::deleted(node.clone(), rv(2)));
        let snapshot = cluster.snapshot();
        assert!(snapshot.pod(&pod.id).unwrap().bound_to.is_none());
    }

    #[test]
    fn test_nominate_extends_only() {
        let cluster = Cluster::new();
        let node = node_object();
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));

        let now = Utc::now();
        assert!(cluster.nominate(&node.id, now + chrono::Duration::seconds(20)));
        assert!(!cluster.nominate(&node.id, now + chrono::Duration::seconds(10)));
        assert!(cluster.snapshot().node(&node.id).unwrap().is_nominated(now));
    }

    #[test]
    fn test_old_tombstones_are_pruned() {
        let cluster = Cluster::new();
        let node = node_object();
        let pod = pod_on(node.id, 1);
        cluster.apply_node_event(&ChangeEvent::added(node.clone(), rv(1)));
        cluster.apply_pod_event(&ChangeEvent::added(pod.clone(), rv(1)));
        cluster.apply_pod_event(&ChangeEvent::deleted(pod.clone(), rv(2)));
        cluster.apply_node_event(&ChangeEvent::deleted(node.clone(), rv(2)));
        assert_eq!(cluster.tombstones(), 2);

        let ttl = Duration::from_secs(600);
        assert_eq!(cluster.prune_tombstones(Utc::now(), ttl), 0);
        assert_eq!(cluster.tombstones(), 2);

        let later = Utc::now() + chrono::Duration::seconds(601);
        assert_eq!(cluster.prune_tombstones(later, ttl), 2);
        assert_eq!(cluster.tombstones(), 0);

        // Past the window a redelivered object is known again.
        assert_eq!(
            cluster.apply_node_event(&ChangeEvent::updated(node.clone(), rv(2))),
            ApplyOutcome::Applied
        );
    }
}
