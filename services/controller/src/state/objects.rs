//! Watched object payloads.
//!
//! These are the shapes the change-event collaborator delivers. They carry
//! only what the engine needs, not the platform's wire format.

use chrono::{DateTime, Utc};
use flotilla_events::{ObjectKind, WatchedObject};
use flotilla_id::{NodeId, PodId};
use serde::{Deserialize, Serialize};

use crate::catalog::CapacityType;
use crate::constraints::{Labels, SchedulingConstraints, Taint};
use crate::resources::Resources;

/// A node as reported by the node watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeObject {
    pub id: NodeId,
    pub provider_id: Option<String>,
    pub zone: String,
    pub shape: String,
    pub capacity_type: CapacityType,
    pub capacity: Resources,
    pub allocatable: Resources,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub node_pool: Option<String>,
    /// The node reports ready.
    pub ready: bool,
    /// The node has a deletion timestamp.
    #[serde(default)]
    pub deleting: bool,
    pub created_at: DateTime<Utc>,
}

impl WatchedObject for NodeObject {
    type Id = NodeId;
    const KIND: ObjectKind = ObjectKind::Node;

    fn id(&self) -> NodeId {
        self.id
    }
}

/// The controller that owns a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

/// A pod as reported by the pod watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodObject {
    pub id: PodId,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub requests: Resources,
    #[serde(default)]
    pub limits: Resources,
    #[serde(default)]
    pub constraints: SchedulingConstraints,
    pub owner: Option<OwnerReference>,
    /// Node the pod is bound to, if any.
    pub node: Option<NodeId>,
    /// The scheduler reported that it could not place the pod.
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default)]
    pub terminating: bool,
    /// Opted out of voluntary disruption.
    #[serde(default)]
    pub do_not_disrupt: bool,
    pub created_at: DateTime<Utc>,
}

impl WatchedObject for PodObject {
    type Id = PodId;
    const KIND: ObjectKind = ObjectKind::Pod;

    fn id(&self) -> PodId {
        self.id
    }
}

impl PodObject {
    /// A pending pod with the given requests and nothing else.
    pub fn pending(namespace: &str, name: &str, requests: Resources) -> Self {
        Self {
            id: PodId::new(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: Labels::new(),
            requests,
            limits: Resources::ZERO,
            constraints: SchedulingConstraints::default(),
            owner: Some(OwnerReference {
                kind: "ReplicaSet".to_string(),
                name: name.to_string(),
            }),
            node: None,
            unschedulable: true,
            terminating: false,
            do_not_disrupt: false,
            created_at: Utc::now(),
        }
    }

    /// The same pod bound to `node`.
    pub fn bound_to(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self.unschedulable = false;
        self
    }
}
