//! The scheduling simulator.
//!
//! Pure and deterministic: given a cluster snapshot, pending pods, the
//! catalog and the node pools, decide where each pod goes. Pods first try
//! nodes that already exist (including in-flight ones and nodes proposed
//! earlier in the same run), tightest fit first; the rest are packed into
//! new nodes pool by pool in weight order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flotilla_id::{NodeId, PodId};
use tracing::debug;

use super::groups::{group_sizes, partition, SchedulingGroup};
use super::ordering::ProposalOrdering;
use super::packing::{keep_furthest, largest_first, ClosedBin, PoolPacker, Rejection};
use super::plan::{NodeProposal, PlacementPlan, UnschedulableReason};
use super::topology::{Host, Topology};
use crate::catalog::{CatalogSnapshot, OfferingKey};
use crate::constraints::{Labels, Taint};
use crate::nodepool::{PoolSet, RegisteredPool};
use crate::resources::Resources;
use crate::state::{ClusterSnapshot, PodRecord};

/// Everything a simulation reads.
#[derive(Debug, Clone)]
pub struct SchedulingInput<'a> {
    pub snapshot: &'a ClusterSnapshot,
    /// Pods to place.
    pub pods: Vec<Arc<PodRecord>>,
    /// Offerings new nodes may use.
    pub catalog: &'a CatalogSnapshot,
    pub pools: &'a PoolSet,
    /// Offerings that recently failed to launch.
    pub unavailable: &'a BTreeSet<OfferingKey>,
}

/// Computes placement plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct Simulator {
    ordering: ProposalOrdering,
}

impl Simulator {
    pub fn new(ordering: ProposalOrdering) -> Self {
        Self { ordering }
    }

    pub fn ordering(&self) -> ProposalOrdering {
        self.ordering
    }

    /// Place every pod in `input`, or explain why it cannot be placed.
    pub fn simulate(&self, input: &SchedulingInput<'_>) -> PlacementPlan {
        let groups = partition(&input.pods);
        debug!(
            pods = input.pods.len(),
            groups = ?group_sizes(&groups),
            nodes = input.snapshot.nodes().count(),
            offerings = input.catalog.offerings().len(),
            "Simulating placement"
        );

        let mut simulation = Simulation::new(input, self.ordering);
        for group in &groups {
            simulation.schedule(group);
        }
        simulation.plan
    }
}

/// Somewhere a pod can go without launching anything new.
#[derive(Debug)]
struct Target {
    host: Host,
    zone: String,
    labels: Labels,
    taints: Vec<Taint>,
    available: Resources,
}

struct Simulation<'a> {
    input: &'a SchedulingInput<'a>,
    ordering: ProposalOrdering,
    topology: Topology,
    targets: Vec<Target>,
    /// Bin id to index in `plan.proposals`.
    proposal_index: BTreeMap<usize, usize>,
    pool_usage: BTreeMap<String, Resources>,
    next_bin: usize,
    /// Scale for ordering pods by size.
    reference: Resources,
    plan: PlacementPlan,
}

impl<'a> Simulation<'a> {
    fn new(input: &'a SchedulingInput<'a>, ordering: ProposalOrdering) -> Self {
        let snapshot = input.snapshot;

        let targets = snapshot
            .nodes()
            .filter(|n| n.is_schedulable())
            .map(|n| Target {
                host: Host::Node(n.id),
                zone: n.zone.clone(),
                labels: n.labels.clone(),
                taints: n.taints.clone(),
                available: n.available(),
            })
            .collect();

        let pool_usage = input
            .pools
            .iter()
            .map(|p| (p.pool.name.clone(), snapshot.pool_usage(&p.pool.name)))
            .collect();

        let reference = input
            .catalog
            .offerings()
            .iter()
            .map(|o| o.allocatable)
            .chain(snapshot.nodes().map(|n| n.allocatable))
            .fold(Resources::ZERO, |acc, r| acc.max(&r));

        Self {
            input,
            ordering,
            topology: Topology::new(snapshot, input.catalog.zones()),
            targets,
            proposal_index: BTreeMap::new(),
            pool_usage,
            next_bin: 0,
            reference,
            plan: PlacementPlan::default(),
        }
    }

    fn schedule(&mut self, group: &SchedulingGroup) {
        let mut remaining: Vec<Arc<PodRecord>> = largest_first(&group.pods, &self.reference)
            .into_iter()
            .filter(|pod| !self.place_on_target(pod))
            .collect();

        let mut rejections: BTreeMap<PodId, Rejection> = BTreeMap::new();
        let pools = self.input.pools;
        for pool in pools.iter() {
            if remaining.is_empty() {
                break;
            }
            let placed = self.schedule_in_pool(pool, &remaining, &mut rejections);
            remaining.retain(|p| !placed.contains(&p.id()));
        }

        for pod in remaining {
            let reason = rejections
                .remove(&pod.id())
                .map(|r| r.reason)
                .unwrap_or(UnschedulableReason::NoCompatibleNodePool);
            self.plan.unschedulable.insert(pod.id(), reason);
        }
    }

    /// Put `pod` on the target it leaves the least room on.
    fn place_on_target(&mut self, pod: &Arc<PodRecord>) -> bool {
        let requests = pod.requests();
        let constraints = &pod.pod.constraints;

        let mut best: Option<(f64, usize)> = None;
        for (i, target) in self.targets.iter().enumerate() {
            if !requests.fits(&target.available)
                || constraints.check_node(&target.labels, &target.taints).is_err()
                || self
                    .topology
                    .check(pod, Some(target.zone.as_str()), target.host)
                    .is_err()
            {
                continue;
            }
            let waste = target.available.waste_after(&requests);
            if best.is_none_or(|(w, _)| waste < w) {
                best = Some((waste, i));
            }
        }

        let Some((_, i)) = best else {
            return false;
        };

        let target = &mut self.targets[i];
        target.available = target.available.saturating_sub(&requests);
        self.topology.place(pod, Some(target.zone.as_str()), target.host);

        match target.host {
            Host::Node(node) => {
                self.plan.assignments.insert(pod.id(), node);
            }
            Host::Proposed(bin) => {
                if let Some(proposal) = self
                    .proposal_index
                    .get(&bin)
                    .and_then(|idx| self.plan.proposals.get_mut(*idx))
                {
                    proposal.pods.push(pod.id());
                    proposal.requests = proposal.requests.saturating_add(&requests);
                }
            }
        }
        true
    }

    /// Pack what `pool` can take. Returns the pods it placed.
    fn schedule_in_pool(
        &mut self,
        pool: &RegisteredPool,
        pods: &[Arc<PodRecord>],
        rejections: &mut BTreeMap<PodId, Rejection>,
    ) -> BTreeSet<PodId> {
        let usage = self
            .pool_usage
            .get(&pool.pool.name)
            .copied()
            .unwrap_or_default();
        let packer = PoolPacker::new(
            pool,
            self.input.catalog,
            self.input.unavailable,
            usage,
            self.ordering,
        );

        let mut admitted = Vec::new();
        for pod in pods {
            match packer.precheck(pod) {
                Ok(()) => admitted.push(Arc::clone(pod)),
                Err(rejection) => keep_furthest(rejections, pod.id(), rejection),
            }
        }
        if admitted.is_empty() {
            return BTreeSet::new();
        }

        let packing = packer.pack(&admitted, &self.topology, self.next_bin, &self.reference);
        self.topology = packing.topology;
        self.next_bin = packing.next_bin;
        for (pod, rejection) in packing.failed {
            keep_furthest(rejections, pod, rejection);
        }

        let mut placed = BTreeSet::new();
        for bin in packing.bins {
            placed.extend(bin.pods.iter().map(|p| p.id()));
            self.commit(pool, bin);
        }

        debug!(
            pool = %pool.pool.name,
            admitted = admitted.len(),
            placed = placed.len(),
            "Packed pods into new nodes"
        );
        placed
    }

    fn commit(&mut self, pool: &RegisteredPool, bin: ClosedBin) {
        let usage = self.pool_usage.entry(pool.pool.name.clone()).or_default();
        *usage = usage.saturating_add(&bin.offering.capacity);

        self.targets.push(Target {
            host: Host::Proposed(bin.id),
            zone: bin.offering.zone.clone(),
            labels: bin.labels,
            taints: pool.pool.taints.clone(),
            available: bin.offering.allocatable.saturating_sub(&bin.requests),
        });

        self.proposal_index.insert(bin.id, self.plan.proposals.len());
        self.plan.proposals.push(NodeProposal {
            pool: pool.pool.name.clone(),
            offering: bin.offering,
            pods: bin.pods.iter().map(|p| p.id()).collect(),
            requests: bin.requests,
        });
    }
}

/// Nodes the plan places pods on, existing or not.
pub fn touched_nodes(plan: &PlacementPlan) -> BTreeSet<NodeId> {
    plan.assignments.values().copied().collect()
}
