//! Inter-pod affinity, anti-affinity and topology spread.

use serde::{Deserialize, Serialize};

use super::labels::{HOSTNAME, ZONE};
use super::requirements::{Labels, Requirement};

/// Selects pods by label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: Labels,
    #[serde(default)]
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    pub fn labels<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// An empty selector matches nothing.
    pub fn matches(&self, labels: &Labels) -> bool {
        if self.match_labels.is_empty() && self.match_expressions.is_empty() {
            return false;
        }

        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }
}

/// The topology domains the scheduler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKey {
    Zone,
    Hostname,
}

impl TopologyKey {
    /// The node label carrying this domain.
    pub fn label(&self) -> &'static str {
        match self {
            TopologyKey::Zone => ZONE,
            TopologyKey::Hostname => HOSTNAME,
        }
    }
}

impl std::fmt::Display for TopologyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyKey::Zone => write!(f, "zone"),
            TopologyKey::Hostname => write!(f, "hostname"),
        }
    }
}

/// A required (anti-)affinity term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    pub selector: LabelSelector,
    pub topology_key: TopologyKey,
}

impl PodAffinityTerm {
    pub fn new(selector: LabelSelector, topology_key: TopologyKey) -> Self {
        Self {
            selector,
            topology_key,
        }
    }
}

/// What to do when a spread constraint cannot be met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhenUnsatisfiable {
    DoNotSchedule,
    ScheduleAnyway,
}

/// Limits how unevenly matching pods may be spread across domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    pub topology_key: TopologyKey,
    pub max_skew: u32,
    pub when_unsatisfiable: WhenUnsatisfiable,
    pub selector: LabelSelector,
}

impl TopologySpreadConstraint {
    pub fn new(topology_key: TopologyKey, max_skew: u32, selector: LabelSelector) -> Self {
        Self {
            topology_key,
            max_skew,
            when_unsatisfiable: WhenUnsatisfiable::DoNotSchedule,
            selector,
        }
    }

    /// Soft constraints never block placement.
    pub fn is_required(&self) -> bool {
        self.when_unsatisfiable == WhenUnsatisfiable::DoNotSchedule
    }
}
