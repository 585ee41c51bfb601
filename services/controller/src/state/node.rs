//! Node records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use flotilla_id::{LaunchId, NodeId, PodId, ResourceVersion};
use flotilla_reconcile::Fingerprint;
use serde::Serialize;

use super::objects::NodeObject;
use crate::catalog::{CapacityType, OfferingKey};
use crate::cloudprovider::{LaunchRequest, NodeHandle};
use crate::constraints::{labels, Labels, Taint};
use crate::resources::Resources;

/// Where a node is in its life.
///
/// `PendingLocal` is the optimistic reservation made right after a launch
/// succeeds; it becomes `PendingConfirmed` or `Ready` when the node's own
/// event arrives, or is rolled back if it never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeLifecycle {
    PendingLocal {
        launch_id: LaunchId,
        reserved_at: DateTime<Utc>,
    },
    PendingConfirmed,
    Ready,
    Deleting,
}

/// Coarse phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Pending,
    Ready,
    Deleting,
}

impl NodeLifecycle {
    pub fn phase(&self) -> NodePhase {
        match self {
            NodeLifecycle::PendingLocal { .. } | NodeLifecycle::PendingConfirmed => NodePhase::Pending,
            NodeLifecycle::Ready => NodePhase::Ready,
            NodeLifecycle::Deleting => NodePhase::Deleting,
        }
    }
}

/// A node as the tracker sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateNode {
    pub id: NodeId,
    pub provider_id: Option<String>,
    pub zone: String,
    pub shape: String,
    pub capacity_type: CapacityType,
    pub capacity: Resources,
    pub allocatable: Resources,
    pub labels: Labels,
    pub taints: Vec<Taint>,
    pub node_pool: Option<String>,
    pub created_at: DateTime<Utc>,
    pub lifecycle: NodeLifecycle,
    pub resource_version: ResourceVersion,

    /// Reserved for termination.
    pub marked_for_deletion: bool,

    /// Pods are expected to land here until then.
    pub nominated_until: Option<DateTime<Utc>>,

    /// Bound pods.
    pub pods: BTreeSet<PodId>,

    /// Sum of the bound pods' requests, recomputed on every change.
    pub requested: Resources,

    /// When the bound pod set last changed.
    pub pods_changed_at: DateTime<Utc>,
}

impl StateNode {
    /// Build from an authoritative event, keeping tracker-owned state of
    /// the record it replaces.
    pub(crate) fn from_object(
        object: &NodeObject,
        version: ResourceVersion,
        previous: Option<&StateNode>,
    ) -> Self {
        let lifecycle = if object.deleting
            || previous.is_some_and(|p| p.lifecycle == NodeLifecycle::Deleting)
        {
            NodeLifecycle::Deleting
        } else if object.ready {
            NodeLifecycle::Ready
        } else {
            NodeLifecycle::PendingConfirmed
        };

        let mut node_labels = object.labels.clone();
        node_labels
            .entry(labels::HOSTNAME.to_string())
            .or_insert_with(|| object.id.to_string());
        node_labels
            .entry(labels::ZONE.to_string())
            .or_insert_with(|| object.zone.clone());

        Self {
            id: object.id,
            provider_id: object.provider_id.clone(),
            zone: object.zone.clone(),
            shape: object.shape.clone(),
            capacity_type: object.capacity_type,
            capacity: object.capacity,
            allocatable: object.allocatable,
            labels: node_labels,
            taints: object.taints.clone(),
            node_pool: object.node_pool.clone(),
            created_at: object.created_at,
            lifecycle,
            resource_version: version,
            marked_for_deletion: previous.is_some_and(|p| p.marked_for_deletion),
            nominated_until: previous.and_then(|p| p.nominated_until),
            pods: previous.map(|p| p.pods.clone()).unwrap_or_default(),
            requested: previous.map(|p| p.requested).unwrap_or_default(),
            pods_changed_at: previous
                .map(|p| p.pods_changed_at)
                .unwrap_or(object.created_at),
        }
    }

    /// Build the optimistic record for a successful launch.
    pub(crate) fn provisional(
        request: &LaunchRequest,
        handle: &NodeHandle,
        capacity: Resources,
        allocatable: Resources,
        now: DateTime<Utc>,
    ) -> Self {
        let mut node_labels = request.labels.clone();
        node_labels.insert(labels::HOSTNAME.to_string(), request.node_id.to_string());

        Self {
            id: request.node_id,
            provider_id: Some(handle.provider_id.clone()),
            zone: request.zone.clone(),
            shape: request.shape.clone(),
            capacity_type: request.capacity_type,
            capacity,
            allocatable,
            node_pool: request.labels.get(labels::NODE_POOL).cloned(),
            labels: node_labels,
            taints: request.taints.clone(),
            created_at: now,
            lifecycle: NodeLifecycle::PendingLocal {
                launch_id: request.launch_id,
                reserved_at: now,
            },
            resource_version: ResourceVersion::LOCAL,
            marked_for_deletion: false,
            nominated_until: None,
            pods: BTreeSet::new(),
            requested: Resources::ZERO,
            pods_changed_at: now,
        }
    }

    pub fn phase(&self) -> NodePhase {
        self.lifecycle.phase()
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.lifecycle, NodeLifecycle::PendingLocal { .. })
    }

    /// Allocatable minus requested; never negative.
    pub fn available(&self) -> Resources {
        self.allocatable.saturating_sub(&self.requested)
    }

    pub fn is_overcommitted(&self) -> bool {
        !self.requested.fits(&self.allocatable)
    }

    /// Whether new pods may be placed here.
    pub fn is_schedulable(&self) -> bool {
        !self.marked_for_deletion && self.phase() != NodePhase::Deleting
    }

    pub fn is_nominated(&self, now: DateTime<Utc>) -> bool {
        self.nominated_until.is_some_and(|until| until > now)
    }

    /// Pool template fingerprint the node was launched with.
    pub fn pool_fingerprint(&self) -> Option<Fingerprint> {
        self.labels
            .get(labels::NODE_POOL_FINGERPRINT)
            .map(|raw| Fingerprint::from_raw(raw.clone()))
    }

    pub fn offering_key(&self) -> OfferingKey {
        OfferingKey {
            shape: self.shape.clone(),
            zone: self.zone.clone(),
            capacity_type: self.capacity_type,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            node_id: self.id,
            provider_id: self
                .provider_id
                .clone()
                .unwrap_or_else(|| self.id.to_string()),
        }
    }
}
