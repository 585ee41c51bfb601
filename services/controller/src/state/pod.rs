//! Pod records.

use flotilla_id::{NodeId, PodId, ResourceVersion};
use serde::Serialize;

use super::objects::PodObject;
use crate::resources::Resources;

/// Coarse pod phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Bound,
    Terminating,
}

/// A pod as the tracker sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodRecord {
    pub pod: PodObject,

    /// The node the pod is bound to, only once that node is known.
    ///
    /// A pod whose event names a node the tracker has not seen yet keeps
    /// `pod.node` but stays unbound here until the node arrives.
    pub bound_to: Option<NodeId>,

    pub resource_version: ResourceVersion,
}

impl PodRecord {
    pub fn id(&self) -> PodId {
        self.pod.id
    }

    pub fn phase(&self) -> PodPhase {
        if self.pod.terminating {
            PodPhase::Terminating
        } else if self.bound_to.is_some() {
            PodPhase::Bound
        } else {
            PodPhase::Pending
        }
    }

    /// Requests including the pod slot.
    pub fn requests(&self) -> Resources {
        self.pod.requests.with_pods(1)
    }

    /// Waiting for capacity: unbound, not terminating, and rejected by the
    /// scheduler.
    pub fn is_unschedulable(&self) -> bool {
        self.pod.node.is_none() && self.pod.unschedulable && !self.pod.terminating
    }

    /// Can be moved by evicting it.
    pub fn is_reschedulable(&self) -> bool {
        self.pod.owner.is_some() && !self.pod.terminating
    }

    /// Blocks voluntary disruption of its node.
    pub fn blocks_disruption(&self) -> bool {
        self.pod.do_not_disrupt || self.pod.owner.is_none()
    }

    /// Namespace-qualified name for logs.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.pod.namespace, self.pod.name)
    }
}
