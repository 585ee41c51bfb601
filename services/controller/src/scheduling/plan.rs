//! Placement plans.

use std::collections::BTreeMap;

use flotilla_id::{NodeId, PodId};
use flotilla_reconcile::{Fingerprint, ReconcileError};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::{Offering, OfferingKey};
use crate::constraints::Incompatibility;
use crate::resources::Resources;

/// Why a pod could not be placed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnschedulableReason {
    /// Even the largest compatible offering is too small.
    #[error("no offering satisfies requested resources")]
    NoOfferingSatisfiesResources,

    #[error("constraint conflict: {detail}")]
    ConstraintConflict { detail: Incompatibility },

    #[error("catalog empty for zone {}", zone.as_deref().unwrap_or("any"))]
    CatalogEmptyForZone { zone: Option<String> },

    #[error("no compatible node pool")]
    NoCompatibleNodePool,

    #[error("node pool {pool} limits exceeded")]
    NodePoolLimitExceeded { pool: String },

    /// Every fitting offering recently failed to launch.
    #[error("matching offerings temporarily unavailable")]
    OfferingsUnavailable,

    #[error("launch failed: {reason}")]
    LaunchFailed { reason: String },
}

impl UnschedulableReason {
    pub fn conflict(detail: Incompatibility) -> Self {
        UnschedulableReason::ConstraintConflict { detail }
    }

    /// Pods with this reason are not re-simulated until the catalog changes.
    pub fn waits_for_catalog_change(&self) -> bool {
        matches!(self, UnschedulableReason::NoOfferingSatisfiesResources)
    }
}

/// A node the plan would launch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeProposal {
    pub pool: String,
    pub offering: Offering,
    /// Pods the new node would host.
    pub pods: Vec<PodId>,
    /// Their summed requests.
    pub requests: Resources,
}

/// Simulator output: where every pending pod goes, or why it cannot go
/// anywhere. Consumed once, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlacementPlan {
    /// Pods placed on nodes that already exist (including in-flight ones).
    pub assignments: BTreeMap<PodId, NodeId>,
    pub proposals: Vec<NodeProposal>,
    pub unschedulable: BTreeMap<PodId, UnschedulableReason>,
}

#[derive(Serialize)]
struct PlanDigest<'a> {
    assignments: &'a BTreeMap<PodId, NodeId>,
    proposals: Vec<(&'a str, OfferingKey, &'a [PodId])>,
    unschedulable: &'a BTreeMap<PodId, UnschedulableReason>,
}

impl PlacementPlan {
    /// Every pod has a place.
    pub fn is_complete(&self) -> bool {
        self.unschedulable.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.proposals.len()
    }

    /// Hourly price of the proposed nodes.
    pub fn total_price(&self) -> f64 {
        self.proposals.iter().map(|p| p.offering.price).sum()
    }

    /// Number of pods the plan places.
    pub fn placed(&self) -> usize {
        self.assignments.len() + self.proposals.iter().map(|p| p.pods.len()).sum::<usize>()
    }

    /// Stable hash of the decisions, independent of offering freshness.
    pub fn fingerprint(&self) -> Result<Fingerprint, ReconcileError> {
        Fingerprint::of(&PlanDigest {
            assignments: &self.assignments,
            proposals: self
                .proposals
                .iter()
                .map(|p| (p.pool.as_str(), p.offering.key(), p.pods.as_slice()))
                .collect(),
            unschedulable: &self.unschedulable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CapacityType;
    use chrono::Utc;

    fn proposal(price: f64) -> NodeProposal {
        NodeProposal {
            pool: "default".to_string(),
            offering: Offering {
                shape: "m.large".to_string(),
                capacity: Resources::cores_gib(4, 16),
                allocatable: Resources::cores_gib(4, 16),
                zone: "zone-a".to_string(),
                capacity_type: CapacityType::OnDemand,
                price,
                observed_at: Utc::now(),
            },
            pods: vec![PodId::new()],
            requests: Resources::cores_gib(1, 1),
        }
    }

    #[test]
    fn test_totals() {
        let plan = PlacementPlan {
            proposals: vec![proposal(0.2), proposal(0.35)],
            ..Default::default()
        };
        assert_eq!(plan.node_count(), 2);
        assert!((plan.total_price() - 0.55).abs() < 1e-9);
        assert_eq!(plan.placed(), 2);
        assert!(plan.is_complete());
    }

    #[test]
    fn test_fingerprint_ignores_observation_time() {
        let a = PlacementPlan {
            proposals: vec![proposal(0.2)],
            ..Default::default()
        };
        let mut b = a.clone();
        b.proposals[0].offering.observed_at = Utc::now() + chrono::Duration::hours(1);

        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_reason_messages() {
        assert_eq!(
            UnschedulableReason::NoOfferingSatisfiesResources.to_string(),
            "no offering satisfies requested resources"
        );
        assert_eq!(
            UnschedulableReason::CatalogEmptyForZone { zone: None }.to_string(),
            "catalog empty for zone any"
        );
        assert!(UnschedulableReason::NoOfferingSatisfiesResources.waits_for_catalog_change());
        assert!(!UnschedulableReason::OfferingsUnavailable.waits_for_catalog_change());
    }

    #[test]
    fn test_reasons_serialize_with_kind_tag() {
        let reasons = [
            (UnschedulableReason::NoOfferingSatisfiesResources, "no_offering_satisfies_resources"),
            (
                UnschedulableReason::conflict(Incompatibility::Resources(vec!["cpu"])),
                "constraint_conflict",
            ),
            (
                UnschedulableReason::CatalogEmptyForZone { zone: Some("zone-a".to_string()) },
                "catalog_empty_for_zone",
            ),
            (UnschedulableReason::NoCompatibleNodePool, "no_compatible_node_pool"),
            (
                UnschedulableReason::NodePoolLimitExceeded { pool: "default".to_string() },
                "node_pool_limit_exceeded",
            ),
            (UnschedulableReason::OfferingsUnavailable, "offerings_unavailable"),
            (
                UnschedulableReason::LaunchFailed { reason: "quota".to_string() },
                "launch_failed",
            ),
        ];

        for (reason, kind) in reasons {
            let json = serde_json::to_value(&reason).unwrap();
            assert_eq!(json["kind"], kind);
        }

        let json = serde_json::to_value(UnschedulableReason::LaunchFailed {
            reason: "quota".to_string(),
        })
        .unwrap();
        assert_eq!(json["reason"], "quota");
    }

    #[test]
    fn test_plan_with_unschedulable_pods_fingerprints() {
        let mut plan = PlacementPlan::default();
        plan.unschedulable.insert(
            PodId::new(),
            UnschedulableReason::LaunchFailed { reason: "throttled".to_string() },
        );
        assert!(plan.fingerprint().is_ok());
        assert!(serde_json::to_string(&plan).is_ok());
    }
}
