//! Node pools.
//!
//! A node pool constrains what the controller may launch (requirements,
//! allowed shapes, resource limits), what it stamps on launched nodes
//! (labels, taints) and how its nodes may be disrupted. Pools are supplied
//! by an external source and replaced wholesale through
//! [`NodePoolRegistry::replace`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use flotilla_reconcile::{Fingerprint, ReconcileError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::Offering;
use crate::constraints::{check_taints, Incompatibility, Labels, SchedulingConstraints, Requirements, Taint};
use crate::resources::Resources;

/// When a pool's nodes may be consolidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationPolicy {
    /// Only nodes without reschedulable pods.
    WhenEmpty,
    /// Empty and underutilized nodes.
    WhenUnderutilized,
    Never,
}

/// Disruption settings of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionPolicy {
    pub consolidation_policy: ConsolidationPolicy,

    /// How long a node must stay empty before emptiness removes it.
    pub consolidate_after: Duration,

    /// Nodes older than this are replaced.
    pub expire_after: Option<Duration>,
}

impl Default for DisruptionPolicy {
    fn default() -> Self {
        Self {
            consolidation_policy: ConsolidationPolicy::WhenUnderutilized,
            consolidate_after: Duration::ZERO,
            expire_after: None,
        }
    }
}

/// A node pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,

    /// Higher weights are tried first.
    #[serde(default)]
    pub weight: u32,

    /// Restricts which offerings may be launched.
    #[serde(default)]
    pub requirements: Requirements,

    /// Applied to every node launched from the pool.
    #[serde(default)]
    pub labels: Labels,

    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Shape names the pool may launch; empty allows all.
    #[serde(default)]
    pub allowed_shapes: BTreeSet<String>,

    /// Upper bound on the summed capacity of the pool's nodes.
    #[serde(default)]
    pub limits: Option<Resources>,

    #[serde(default)]
    pub disruption: DisruptionPolicy,
}

/// The part of a pool that shapes launched nodes. Changing it drifts them.
#[derive(Serialize)]
struct NodeTemplate<'a> {
    requirements: &'a Requirements,
    labels: &'a Labels,
    taints: &'a [Taint],
    allowed_shapes: &'a BTreeSet<String>,
}

impl NodePool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 0,
            requirements: Requirements::default(),
            labels: Labels::new(),
            taints: Vec::new(),
            allowed_shapes: BTreeSet::new(),
            limits: None,
            disruption: DisruptionPolicy::default(),
        }
    }

    /// Fingerprint of the node template.
    pub fn fingerprint(&self) -> Result<Fingerprint, ReconcileError> {
        Fingerprint::of(&NodeTemplate {
            requirements: &self.requirements,
            labels: &self.labels,
            taints: &self.taints,
            allowed_shapes: &self.allowed_shapes,
        })
    }

    /// Whether the pool may launch this offering at all.
    pub fn allows_offering(&self, offering: &Offering) -> bool {
        (self.allowed_shapes.is_empty() || self.allowed_shapes.contains(&offering.shape))
            && self.requirements.matches(&offering.labels()).is_ok()
    }

    /// Labels of a node launched from `offering`.
    pub fn node_labels(&self, offering: &Offering) -> Labels {
        let mut labels = self.labels.clone();
        labels.extend(offering.labels());
        labels.insert(crate::constraints::labels::NODE_POOL.to_string(), self.name.clone());
        labels
    }

    /// Pod-level compatibility, before looking at offerings.
    pub fn admits(&self, constraints: &SchedulingConstraints) -> Result<(), Incompatibility> {
        check_taints(&self.taints, &constraints.tolerations)?;
        self.requirements.compatible(&constraints.node_requirements)?;
        constraints
            .node_requirements
            .compatible(&Requirements::from_labels(&self.labels))
    }
}

/// A pool together with its precomputed fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredPool {
    pub pool: NodePool,
    pub fingerprint: Fingerprint,
}

/// The current set of pools, ordered by descending weight then name.
#[derive(Debug, Clone, Default)]
pub struct PoolSet {
    pools: Vec<Arc<RegisteredPool>>,
}

impl PoolSet {
    pub fn new(pools: Vec<NodePool>) -> Result<Self, ReconcileError> {
        let mut registered = pools
            .into_iter()
            .map(|pool| {
                Ok(Arc::new(RegisteredPool {
                    fingerprint: pool.fingerprint()?,
                    pool,
                }))
            })
            .collect::<Result<Vec<_>, ReconcileError>>()?;

        registered.sort_by(|a, b| {
            b.pool
                .weight
                .cmp(&a.pool.weight)
                .then_with(|| a.pool.name.cmp(&b.pool.name))
        });

        Ok(Self { pools: registered })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredPool>> {
        self.pools.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredPool>> {
        self.pools.iter().find(|p| p.pool.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }
}

/// Holds the current pool set for lock-free reads.
pub struct NodePoolRegistry {
    current: ArcSwap<PoolSet>,
}

impl NodePoolRegistry {
    pub fn new(pools: Vec<NodePool>) -> Result<Self, ReconcileError> {
        Ok(Self {
            current: ArcSwap::from_pointee(PoolSet::new(pools)?),
        })
    }

    /// Replace every pool.
    pub fn replace(&self, pools: Vec<NodePool>) -> Result<(), ReconcileError> {
        let set = PoolSet::new(pools)?;
        info!(pools = set.len(), "Node pools updated");
        self.current.store(Arc::new(set));
        Ok(())
    }

    pub fn current(&self) -> Arc<PoolSet> {
        self.current.load_full()
    }
}
