//! Scheduling constraint engine.
//!
//! A closed set of rule variants evaluated against node and pod labels:
//! label [`Requirement`]s, [`Taint`]/[`Toleration`] matching, required pod
//! affinity and anti-affinity, and topology spread. Every rejection is a
//! typed [`Incompatibility`] so callers can report why a pod did not fit.

mod affinity;
pub mod labels;
mod requirements;
mod taints;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use affinity::{
    LabelSelector, PodAffinityTerm, TopologyKey, TopologySpreadConstraint, WhenUnsatisfiable,
};
pub use requirements::{Labels, Operator, Requirement, Requirements};
pub use taints::{check_taints, Taint, TaintEffect, Toleration, TolerationOperator};

/// Why a pod cannot be placed somewhere.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Incompatibility {
    #[error("requirement {0} not satisfied")]
    Requirement(Requirement),

    #[error("taint {0} not tolerated")]
    Taint(Taint),

    #[error("insufficient {}", .0.join(", "))]
    Resources(Vec<&'static str>),

    #[error("topology spread on {key} would exceed max skew {max_skew}")]
    TopologySpread { key: TopologyKey, max_skew: u32 },

    #[error("anti-affinity conflict on {0}")]
    AntiAffinity(TopologyKey),

    #[error("no pod matching affinity on {0}")]
    Affinity(TopologyKey),
}

/// A pod's placement constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedulingConstraints {
    /// Node selector and required node affinity, merged.
    #[serde(default)]
    pub node_requirements: Requirements,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub affinity: Vec<PodAffinityTerm>,

    #[serde(default)]
    pub anti_affinity: Vec<PodAffinityTerm>,

    #[serde(default)]
    pub topology_spread: Vec<TopologySpreadConstraint>,
}

impl SchedulingConstraints {
    /// Returns true if placement depends on where other pods are.
    pub fn has_pod_constraints(&self) -> bool {
        !self.affinity.is_empty()
            || !self.anti_affinity.is_empty()
            || self.topology_spread.iter().any(|c| c.is_required())
    }

    /// Selectors of every inter-pod constraint.
    pub fn pod_selectors(&self) -> impl Iterator<Item = &LabelSelector> {
        self.affinity
            .iter()
            .chain(&self.anti_affinity)
            .map(|t| &t.selector)
            .chain(
                self.topology_spread
                    .iter()
                    .filter(|c| c.is_required())
                    .map(|c| &c.selector),
            )
    }

    /// Checks node-level constraints against a node's labels and taints.
    pub fn check_node(&self, labels: &Labels, taints: &[Taint]) -> Result<(), Incompatibility> {
        self.node_requirements.matches(labels)?;
        check_taints(taints, &self.tolerations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_node() {
        let constraints = SchedulingConstraints {
            node_requirements: Requirements::new(vec![Requirement::in_values(
                labels::ZONE,
                ["zone-a"],
            )]),
            ..Default::default()
        };

        let node = Labels::from([(labels::ZONE.to_string(), "zone-a".to_string())]);
        assert!(constraints.check_node(&node, &[]).is_ok());

        let tainted = [Taint::new("dedicated", Some("db"), TaintEffect::NoSchedule)];
        assert!(matches!(
            constraints.check_node(&node, &tainted),
            Err(Incompatibility::Taint(_))
        ));
    }

    #[test]
    fn test_soft_spread_is_not_a_pod_constraint() {
        let mut spread = TopologySpreadConstraint::new(
            TopologyKey::Zone,
            1,
            LabelSelector::labels([("app", "web")]),
        );
        spread.when_unsatisfiable = WhenUnsatisfiable::ScheduleAnyway;

        let constraints = SchedulingConstraints {
            topology_spread: vec![spread],
            ..Default::default()
        };
        assert!(!constraints.has_pod_constraints());
        assert_eq!(constraints.pod_selectors().count(), 0);
    }

    #[test]
    fn test_incompatibility_messages() {
        let err = Incompatibility::Resources(vec!["cpu", "memory"]);
        assert_eq!(err.to_string(), "insufficient cpu, memory");

        let err = Incompatibility::TopologySpread {
            key: TopologyKey::Zone,
            max_skew: 1,
        };
        assert_eq!(err.to_string(), "topology spread on zone would exceed max skew 1");
    }
}
