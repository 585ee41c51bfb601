//! New-node packing for one node pool.
//!
//! Shapes are ranked by price per unit of the pods' total demand. For every
//! prefix of that ranking, pods are packed first-fit-decreasing into bins:
//! a bin starts with every offering the first pod fits and narrows as pods
//! join, and at close takes the cheapest offering still feasible within
//! the pool's limits. The prefix packings are ranked by pods placed, then
//! by the configured [`ProposalOrdering`], then by shorter prefix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flotilla_id::PodId;

use super::ordering::ProposalOrdering;
use super::plan::UnschedulableReason;
use super::topology::{Host, Topology};
use crate::catalog::{CatalogSnapshot, Offering, OfferingKey};
use crate::constraints::{labels, Incompatibility, Labels, Operator, SchedulingConstraints};
use crate::nodepool::RegisteredPool;
use crate::resources::Resources;
use crate::state::PodRecord;

/// How far a pod got before it was rejected. When pools disagree, the
/// reason from the furthest stage is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Pool,
    Offerings,
    Availability,
    Packing,
    Limits,
}

#[derive(Debug, Clone)]
pub(crate) struct Rejection {
    pub(crate) stage: Stage,
    pub(crate) reason: UnschedulableReason,
}

impl Rejection {
    fn new(stage: Stage, reason: UnschedulableReason) -> Self {
        Self { stage, reason }
    }
}

/// Keep the rejection from the furthest stage; the first one wins ties.
pub(crate) fn keep_furthest(
    rejections: &mut BTreeMap<PodId, Rejection>,
    pod: PodId,
    rejection: Rejection,
) {
    match rejections.get(&pod) {
        Some(existing) if existing.stage >= rejection.stage => {}
        _ => {
            rejections.insert(pod, rejection);
        }
    }
}

/// Order pods largest first relative to `reference`, then by id.
pub(crate) fn largest_first(pods: &[Arc<PodRecord>], reference: &Resources) -> Vec<Arc<PodRecord>> {
    let mut keyed: Vec<(f64, Arc<PodRecord>)> = pods
        .iter()
        .map(|p| (p.requests().footprint(reference), Arc::clone(p)))
        .collect();
    keyed.sort_by(|(fa, a), (fb, b)| fb.total_cmp(fa).then_with(|| a.id().cmp(&b.id())));
    keyed.into_iter().map(|(_, p)| p).collect()
}

/// An offering the pool may launch.
#[derive(Debug, Clone)]
struct Candidate {
    offering: Offering,
    /// Labels the launched node would carry.
    labels: Labels,
    unavailable: bool,
}

#[derive(Debug)]
struct OpenBin {
    id: usize,
    /// Indices of candidates still able to host every pod in the bin.
    feasible: Vec<usize>,
    zone: Option<String>,
    pods: Vec<Arc<PodRecord>>,
    requests: Resources,
}

/// A packed bin with its offering chosen.
#[derive(Debug, Clone)]
pub(crate) struct ClosedBin {
    pub(crate) id: usize,
    pub(crate) offering: Offering,
    pub(crate) labels: Labels,
    pub(crate) pods: Vec<Arc<PodRecord>>,
    pub(crate) requests: Resources,
}

/// Result of packing one pool.
#[derive(Debug, Clone)]
pub(crate) struct Packing {
    pub(crate) bins: Vec<ClosedBin>,
    pub(crate) failed: BTreeMap<PodId, Rejection>,
    pub(crate) topology: Topology,
    pub(crate) next_bin: usize,
}

impl Packing {
    fn placed(&self) -> usize {
        self.bins.iter().map(|b| b.pods.len()).sum()
    }

    fn price(&self) -> f64 {
        self.bins.iter().map(|b| b.offering.price).sum()
    }
}

fn required_zone(constraints: &SchedulingConstraints) -> Option<String> {
    constraints
        .node_requirements
        .iter()
        .filter(|r| r.key == labels::ZONE)
        .find_map(|r| match &r.operator {
            Operator::In(values) if values.len() == 1 => values.iter().next().cloned(),
            _ => None,
        })
}

/// Packs pods into new nodes of one pool.
pub(crate) struct PoolPacker<'a> {
    pool: &'a RegisteredPool,
    candidates: Vec<Candidate>,
    /// Capacity the pool already owns, existing and proposed.
    usage: Resources,
    ordering: ProposalOrdering,
}

impl<'a> PoolPacker<'a> {
    pub(crate) fn new(
        pool: &'a RegisteredPool,
        catalog: &CatalogSnapshot,
        unavailable: &BTreeSet<OfferingKey>,
        usage: Resources,
        ordering: ProposalOrdering,
    ) -> Self {
        let candidates = catalog
            .offerings()
            .iter()
            .filter(|o| pool.pool.allows_offering(o))
            .map(|o| Candidate {
                labels: pool.pool.node_labels(o),
                unavailable: unavailable.contains(&o.key()),
                offering: o.clone(),
            })
            .collect();

        Self {
            pool,
            candidates,
            usage,
            ordering,
        }
    }

    /// Pod-level checks against the pool and its offerings.
    pub(crate) fn precheck(&self, pod: &PodRecord) -> Result<(), Rejection> {
        let constraints = &pod.pod.constraints;
        let pool = &self.pool.pool;

        pool.admits(constraints)
            .map_err(|e| Rejection::new(Stage::Pool, UnschedulableReason::conflict(e)))?;

        if self.candidates.is_empty() {
            return Err(Rejection::new(
                Stage::Offerings,
                UnschedulableReason::CatalogEmptyForZone { zone: None },
            ));
        }

        let mut conflict = None;
        let compatible: Vec<&Candidate> = self
            .candidates
            .iter()
            .filter(|c| match constraints.check_node(&c.labels, &pool.taints) {
                Ok(()) => true,
                Err(e) => {
                    conflict.get_or_insert(e);
                    false
                }
            })
            .collect();

        if compatible.is_empty() {
            let zone_offered = self.candidates.iter().any(|c| {
                constraints
                    .node_requirements
                    .allows(labels::ZONE, Some(c.offering.zone.as_str()))
            });
            let reason = match conflict {
                Some(e) if zone_offered => UnschedulableReason::conflict(e),
                _ => UnschedulableReason::CatalogEmptyForZone {
                    zone: required_zone(constraints),
                },
            };
            return Err(Rejection::new(Stage::Offerings, reason));
        }

        let requests = pod.requests();
        let fitting: Vec<&Candidate> = compatible
            .into_iter()
            .filter(|c| requests.fits(&c.offering.allocatable))
            .collect();

        if fitting.is_empty() {
            return Err(Rejection::new(
                Stage::Offerings,
                UnschedulableReason::NoOfferingSatisfiesResources,
            ));
        }
        if fitting.iter().all(|c| c.unavailable) {
            return Err(Rejection::new(
                Stage::Availability,
                UnschedulableReason::OfferingsUnavailable,
            ));
        }

        Ok(())
    }

    fn accepts(&self, candidate: &Candidate, pod: &PodRecord, total: &Resources) -> bool {
        !candidate.unavailable
            && total.fits(&candidate.offering.allocatable)
            && pod
                .pod
                .constraints
                .check_node(&candidate.labels, &self.pool.pool.taints)
                .is_ok()
    }

    /// Shape names by ascending price per unit of `demand`, then name.
    fn shape_order(&self, demand: &Resources) -> Vec<String> {
        let mut per_shape: BTreeMap<&str, (f64, Resources)> = BTreeMap::new();
        for c in self.candidates.iter().filter(|c| !c.unavailable) {
            let entry = per_shape
                .entry(c.offering.shape.as_str())
                .or_insert((f64::INFINITY, Resources::ZERO));
            entry.0 = entry.0.min(c.offering.price);
            entry.1 = entry.1.max(&c.offering.allocatable);
        }

        let mut ranked: Vec<(f64, &str)> = per_shape
            .into_iter()
            .map(|(shape, (price, allocatable))| {
                let coverage = allocatable.coverage_of(demand);
                let per_unit = if coverage > 0.0 { price / coverage } else { f64::INFINITY };
                (per_unit, shape)
            })
            .collect();
        ranked.sort_by(|(pa, a), (pb, b)| pa.total_cmp(pb).then_with(|| a.cmp(b)));
        ranked.into_iter().map(|(_, shape)| shape.to_string()).collect()
    }

    /// Pack `pods` into new nodes. Bin ids start at `next_bin`.
    pub(crate) fn pack(
        &self,
        pods: &[Arc<PodRecord>],
        topology: &Topology,
        next_bin: usize,
        reference: &Resources,
    ) -> Packing {
        let pods = largest_first(pods, reference);
        let demand: Resources = pods.iter().map(|p| p.requests()).sum();
        let shapes = self.shape_order(&demand);

        let mut best: Option<Packing> = None;
        for len in 1..=shapes.len() {
            let prefix: BTreeSet<&str> = shapes[..len].iter().map(String::as_str).collect();
            let run = self.run(&pods, &prefix, topology.clone(), next_bin);
            if best.as_ref().is_none_or(|b| self.better(&run, b)) {
                best = Some(run);
            }
        }

        best.unwrap_or_else(|| Packing {
            bins: Vec::new(),
            failed: pods
                .iter()
                .map(|p| {
                    let reason = UnschedulableReason::NoOfferingSatisfiesResources;
                    (p.id(), Rejection::new(Stage::Offerings, reason))
                })
                .collect(),
            topology: topology.clone(),
            next_bin,
        })
    }

    fn better(&self, run: &Packing, best: &Packing) -> bool {
        match run.placed().cmp(&best.placed()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                self.ordering.compare(
                    (run.bins.len(), run.price()),
                    (best.bins.len(), best.price()),
                ) == std::cmp::Ordering::Less
            }
        }
    }

    fn run(
        &self,
        pods: &[Arc<PodRecord>],
        shapes: &BTreeSet<&str>,
        mut topology: Topology,
        mut next_bin: usize,
    ) -> Packing {
        let mut open: Vec<OpenBin> = Vec::new();
        let mut failed = BTreeMap::new();

        'pods: for pod in pods {
            for bin in open.iter_mut() {
                if self.try_add(bin, pod, &mut topology).is_ok() {
                    continue 'pods;
                }
            }

            let requests = pod.requests();
            let feasible: Vec<usize> = self
                .candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| shapes.contains(c.offering.shape.as_str()))
                .filter(|(_, c)| self.accepts(c, pod, &requests))
                .map(|(i, _)| i)
                .collect();

            if feasible.is_empty() {
                let reason = UnschedulableReason::NoOfferingSatisfiesResources;
                keep_furthest(&mut failed, pod.id(), Rejection::new(Stage::Packing, reason));
                continue;
            }

            let mut bin = OpenBin {
                id: next_bin,
                feasible,
                zone: None,
                pods: Vec::new(),
                requests: Resources::ZERO,
            };
            next_bin += 1;

            match self.try_add(&mut bin, pod, &mut topology) {
                Ok(()) => open.push(bin),
                Err(e) => {
                    let reason = UnschedulableReason::conflict(e);
                    keep_furthest(&mut failed, pod.id(), Rejection::new(Stage::Packing, reason));
                }
            }
        }

        let limits = self.pool.pool.limits;
        let mut usage = self.usage;
        let mut bins = Vec::with_capacity(open.len());

        for bin in open {
            let host = Host::Proposed(bin.id);
            let chosen = bin
                .feasible
                .iter()
                .map(|i| &self.candidates[*i])
                .filter(|c| {
                    limits.is_none_or(|l| usage.saturating_add(&c.offering.capacity).within(&l))
                })
                .min_by(|a, b| a.offering.cheaper_than(&b.offering));

            match chosen {
                Some(c) => {
                    usage = usage.saturating_add(&c.offering.capacity);
                    topology.pin(host, &c.offering.zone);
                    bins.push(ClosedBin {
                        id: bin.id,
                        offering: c.offering.clone(),
                        labels: c.labels.clone(),
                        pods: bin.pods,
                        requests: bin.requests,
                    });
                }
                None => {
                    topology.remove_host(host);
                    for pod in &bin.pods {
                        let reason = UnschedulableReason::NodePoolLimitExceeded {
                            pool: self.pool.pool.name.clone(),
                        };
                        keep_furthest(&mut failed, pod.id(), Rejection::new(Stage::Limits, reason));
                    }
                }
            }
        }

        Packing {
            bins,
            failed,
            topology,
            next_bin,
        }
    }

    fn try_add(
        &self,
        bin: &mut OpenBin,
        pod: &Arc<PodRecord>,
        topology: &mut Topology,
    ) -> Result<(), Incompatibility> {
        let total = bin.requests.saturating_add(&pod.requests());
        let mut feasible: Vec<usize> = bin
            .feasible
            .iter()
            .copied()
            .filter(|i| self.accepts(&self.candidates[*i], pod, &total))
            .collect();

        if feasible.is_empty() {
            let largest = bin.feasible.iter().fold(Resources::ZERO, |acc, i| {
                acc.max(&self.candidates[*i].offering.allocatable)
            });
            return Err(Incompatibility::Resources(total.exceeded(&largest)));
        }

        let host = Host::Proposed(bin.id);
        let zone = match bin.zone.clone() {
            Some(zone) => {
                topology.check(pod, Some(zone.as_str()), host)?;
                Some(zone)
            }
            None if topology.zone_sensitive(pod) => {
                let zones: BTreeSet<&str> = feasible
                    .iter()
                    .map(|i| self.candidates[*i].offering.zone.as_str())
                    .collect();
                let zone = topology.choose_zone(pod, zones, host)?;
                topology.pin(host, &zone);
                Some(zone)
            }
            None => {
                topology.check(pod, None, host)?;
                None
            }
        };

        if let Some(zone) = &zone {
            feasible.retain(|i| self.candidates[*i].offering.zone == *zone);
        }

        topology.place(pod, zone.as_deref(), host);
        bin.zone = zone;
        bin.feasible = feasible;
        bin.requests = total;
        bin.pods.push(Arc::clone(pod));
        Ok(())
    }
}
