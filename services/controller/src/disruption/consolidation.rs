//! The consolidation engine.
//!
//! Each pass picks at most one disruption command, trying methods in
//! order: emptiness, expiration, drift, multi-node consolidation and
//! single-node consolidation. A command is decided against one snapshot,
//! held for the validation window, re-checked against a fresh snapshot and
//! only then executed: replacements are launched first, then the
//! candidates are reserved for termination.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flotilla_id::{NodeId, PodId};
use flotilla_reconcile::DisruptionPriority;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::candidates::{candidates, next_eligibility_change, Candidate, CandidateState};
use crate::catalog::{CapacityCatalog, CapacityType, CatalogSnapshot, OfferingKey};
use crate::config::ConsolidationConfig;
use crate::nodepool::{NodePoolRegistry, PoolSet};
use crate::provisioning::Launcher;
use crate::scheduling::{NodeProposal, SchedulingInput, Simulator};
use crate::state::{Cluster, ClusterSnapshot, PodRecord};

/// Passes with no change in fleet or catalog are skipped, up to this long.
const REEVALUATE_AFTER: Duration = Duration::from_secs(300);

/// How a command disrupts its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisruptionMethod {
    Emptiness,
    Expiration,
    Drift,
    MultiNodeConsolidation,
    SingleNodeConsolidation,
}

impl DisruptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisruptionMethod::Emptiness => "emptiness",
            DisruptionMethod::Expiration => "expiration",
            DisruptionMethod::Drift => "drift",
            DisruptionMethod::MultiNodeConsolidation => "multi_node_consolidation",
            DisruptionMethod::SingleNodeConsolidation => "single_node_consolidation",
        }
    }

    /// Expired and drifted nodes are replaced whatever it costs.
    fn replaces_at_any_price(&self) -> bool {
        matches!(self, DisruptionMethod::Expiration | DisruptionMethod::Drift)
    }
}

impl fmt::Display for DisruptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decided disruption.
#[derive(Debug, Clone)]
pub struct Command {
    pub method: DisruptionMethod,
    pub candidates: Vec<NodeId>,
    pub replacements: Vec<NodeProposal>,
    /// Pods bound to each candidate when the command was decided.
    pods: BTreeMap<NodeId, BTreeSet<PodId>>,
    decided_at: Instant,
}

impl Command {
    fn new(method: DisruptionMethod, chosen: &[Candidate], replacements: Vec<NodeProposal>) -> Self {
        Self {
            method,
            candidates: chosen.iter().map(|c| c.id()).collect(),
            replacements,
            pods: chosen.iter().map(|c| (c.id(), c.pod_ids())).collect(),
            decided_at: Instant::now(),
        }
    }

    fn target_state(&self) -> CandidateState {
        if self.replacements.is_empty() {
            CandidateState::CandidateForDeletion
        } else {
            CandidateState::CandidateForReplacement
        }
    }
}

/// Statistics from one consolidation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsolidationStats {
    pub candidates: usize,
    /// Nothing changed since the last pass found nothing to do.
    pub skipped: bool,
    pub method: Option<DisruptionMethod>,
    pub decided: bool,
    /// A command is waiting out its validation window.
    pub pending: bool,
    pub executed: bool,
    pub aborted: bool,
}

/// Inputs shared by every evaluation in a pass.
struct Pass {
    snapshot: Arc<ClusterSnapshot>,
    pools: Arc<PoolSet>,
    /// Current prices, however old.
    listed: Arc<CatalogSnapshot>,
    /// Offerings usable for moving pods.
    usable: CatalogSnapshot,
    /// Offerings fresh enough for cost-driven replacements.
    fresh: CatalogSnapshot,
    unavailable: BTreeSet<OfferingKey>,
    /// Existing nodes pending pods would land on.
    claims: BTreeMap<PodId, NodeId>,
    now: DateTime<Utc>,
}

/// Finds nodes to remove or replace and reserves them for termination.
pub struct Consolidator {
    cluster: Arc<Cluster>,
    catalog: Arc<CapacityCatalog>,
    pools: Arc<NodePoolRegistry>,
    launcher: Arc<Launcher>,
    simulator: Simulator,
    config: ConsolidationConfig,
    pending: Mutex<Option<Command>>,
    states: Mutex<BTreeMap<NodeId, CandidateState>>,
    idle: Mutex<Option<IdlePass>>,
}

/// What the last pass that found nothing to do looked at.
struct IdlePass {
    version: u64,
    generation: u64,
    pools: Arc<PoolSet>,
    at: Instant,
    /// A node becomes eligible with time alone at this point.
    wake_at: Option<DateTime<Utc>>,
}

impl IdlePass {
    fn of(pass: &Pass) -> Self {
        Self {
            version: pass.snapshot.version(),
            generation: pass.listed.generation(),
            pools: Arc::clone(&pass.pools),
            at: Instant::now(),
            wake_at: next_eligibility_change(&pass.snapshot, &pass.pools, pass.now),
        }
    }

    fn covers(&self, pass: &Pass) -> bool {
        self.version == pass.snapshot.version()
            && self.generation == pass.listed.generation()
            && Arc::ptr_eq(&self.pools, &pass.pools)
            && self.at.elapsed() < REEVALUATE_AFTER
            && self.wake_at.is_none_or(|at| pass.now < at)
    }
}

impl Consolidator {
    pub fn new(
        cluster: Arc<Cluster>,
        catalog: Arc<CapacityCatalog>,
        pools: Arc<NodePoolRegistry>,
        launcher: Arc<Launcher>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            simulator: Simulator::new(config.ordering),
            cluster,
            catalog,
            pools,
            launcher,
            config,
            pending: Mutex::new(None),
            states: Mutex::new(BTreeMap::new()),
            idle: Mutex::new(None),
        }
    }

    /// The engine's view of `node`.
    pub fn state(&self, node: &NodeId) -> CandidateState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(node).copied().unwrap_or_default()
    }

    /// The command waiting out its validation window, if any.
    pub fn pending(&self) -> Option<Command> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Evaluate on an interval until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            validation_secs = self.config.validation_period.as_secs(),
            "Starting consolidation engine"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Consolidation engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One consolidation pass.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> ConsolidationStats {
        let pass = self.pass();
        self.prune_states(&pass.snapshot);

        let mut stats = ConsolidationStats::default();
        let taken = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();

        let command = match taken {
            Some(command) => command,
            None => {
                let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).take();
                if idle.as_ref().is_some_and(|i| i.covers(&pass)) {
                    *self.idle.lock().unwrap_or_else(|e| e.into_inner()) = idle;
                    stats.skipped = true;
                    return stats;
                }

                let found = candidates(&pass.snapshot, &pass.pools, &pass.listed, pass.now);
                stats.candidates = found.len();
                let Some(command) = self.decide(&pass, found) else {
                    *self.idle.lock().unwrap_or_else(|e| e.into_inner()) = Some(IdlePass::of(&pass));
                    return stats;
                };

                info!(
                    method = %command.method,
                    nodes = ?command.candidates,
                    replacements = command.replacements.len(),
                    "Disruption decided"
                );
                stats.decided = true;
                self.set_states(&command.candidates, command.target_state());
                command
            }
        };
        stats.method = Some(command.method);

        if command.decided_at.elapsed() < self.config.validation_period {
            stats.pending = true;
            *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(command);
            return stats;
        }

        let Some(replacements) = self.validate(&pass, &command) else {
            info!(method = %command.method, nodes = ?command.candidates, "Disruption no longer valid, aborting");
            self.clear_states(&command.candidates);
            stats.aborted = true;
            return stats;
        };

        if self.execute(&pass, &command, &replacements).await {
            self.set_states(&command.candidates, CandidateState::ReservedForTermination);
            stats.executed = true;
        } else {
            self.clear_states(&command.candidates);
            stats.aborted = true;
        }
        stats
    }

    fn pass(&self) -> Pass {
        let now = Utc::now();
        let snapshot = self.cluster.snapshot();
        let pools = self.pools.current();
        let usable = self.catalog.usable(now);
        let unavailable = self.catalog.unavailable().active();

        // Room the provisioner would hand to pending pods is not free.
        let pending = snapshot.unschedulable_pods();
        let claims = if pending.is_empty() {
            BTreeMap::new()
        } else {
            self.simulator
                .simulate(&SchedulingInput {
                    snapshot: &snapshot,
                    pods: pending,
                    catalog: &usable,
                    pools: &pools,
                    unavailable: &unavailable,
                })
                .assignments
        };

        Pass {
            snapshot,
            pools,
            listed: self.catalog.snapshot(),
            usable,
            fresh: self.catalog.fresh(now),
            unavailable,
            claims,
            now,
        }
    }

    fn decide(&self, pass: &Pass, found: Vec<Candidate>) -> Option<Command> {
        let with = |priority: DisruptionPriority| -> Vec<Candidate> {
            found.iter().filter(|c| c.priority == priority).cloned().collect()
        };

        let claimed: BTreeSet<NodeId> = pass.claims.values().copied().collect();
        let empty: Vec<Candidate> = with(DisruptionPriority::Empty)
            .into_iter()
            .filter(|c| !claimed.contains(&c.id()))
            .collect();
        if !empty.is_empty() {
            return Some(Command::new(DisruptionMethod::Emptiness, &empty, Vec::new()));
        }

        for (priority, method) in [
            (DisruptionPriority::Expired, DisruptionMethod::Expiration),
            (DisruptionPriority::Drifted, DisruptionMethod::Drift),
        ] {
            for candidate in with(priority) {
                let chosen = [candidate];
                if let Some(replacements) = self.evaluate(pass, &chosen, method) {
                    return Some(Command::new(method, &chosen, replacements));
                }
            }
        }

        let mut underutilized = with(DisruptionPriority::Underutilized);
        underutilized.truncate(self.config.max_multi_node_candidates);

        if let Some(command) = self.multi_node(pass, &underutilized) {
            return Some(command);
        }

        underutilized.iter().find_map(|candidate| {
            let chosen = std::slice::from_ref(candidate);
            self.evaluate(pass, chosen, DisruptionMethod::SingleNodeConsolidation)
                .map(|r| Command::new(DisruptionMethod::SingleNodeConsolidation, chosen, r))
        })
    }

    /// Largest prefix of `ordered` (at least two nodes) that consolidates,
    /// found by binary search.
    fn multi_node(&self, pass: &Pass, ordered: &[Candidate]) -> Option<Command> {
        let method = DisruptionMethod::MultiNodeConsolidation;
        let (mut lo, mut hi) = (2, ordered.len());
        let mut best = None;

        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            match self.evaluate(pass, &ordered[..mid], method) {
                Some(replacements) => {
                    best = Some(Command::new(method, &ordered[..mid], replacements));
                    lo = mid + 1;
                }
                None => hi = mid - 1,
            }
        }

        best
    }

    /// Whether `chosen` can go, and what has to be launched first.
    fn evaluate(
        &self,
        pass: &Pass,
        chosen: &[Candidate],
        method: DisruptionMethod,
    ) -> Option<Vec<NodeProposal>> {
        let removed: BTreeSet<NodeId> = chosen.iter().map(|c| c.id()).collect();
        let (displaced, kept): (BTreeMap<PodId, NodeId>, BTreeMap<PodId, NodeId>) = pass
            .claims
            .iter()
            .map(|(pod, node)| (*pod, *node))
            .partition(|(_, node)| removed.contains(node));
        let view = pass.snapshot.without_nodes(&removed).with_claims(&kept);

        // Pending pods that would have used the removed nodes must fit too.
        let pods: Vec<Arc<PodRecord>> = chosen
            .iter()
            .flat_map(|c| &c.pods)
            .map(|p| p.id())
            .chain(displaced.into_keys())
            .filter_map(|id| view.pod(&id).cloned())
            .collect();
        if pods.is_empty() {
            return Some(Vec::new());
        }

        let catalog = if method.replaces_at_any_price() {
            pass.usable.clone()
        } else {
            replacement_catalog(&pass.fresh, chosen)
        };

        let plan = self.simulator.simulate(&SchedulingInput {
            snapshot: &view,
            pods,
            catalog: &catalog,
            pools: &pass.pools,
            unavailable: &pass.unavailable,
        });

        if !plan.is_complete() {
            debug!(method = %method, nodes = chosen.len(), unschedulable = plan.unschedulable.len(), "Pods cannot move");
            return None;
        }
        if !method.replaces_at_any_price() && plan.proposals.len() > 1 {
            return None;
        }
        Some(plan.proposals)
    }

    /// Re-check a command against the current fleet. Returns the
    /// replacements to launch.
    fn validate(&self, pass: &Pass, command: &Command) -> Option<Vec<NodeProposal>> {
        let current = candidates(&pass.snapshot, &pass.pools, &pass.listed, pass.now);

        let mut chosen = Vec::with_capacity(command.candidates.len());
        for id in &command.candidates {
            let Some(candidate) = current.iter().find(|c| c.id() == *id) else {
                debug!(node_id = %id, "Node is no longer a candidate");
                return None;
            };
            let recorded = command.pods.get(id)?;
            if !candidate.pod_ids().is_subset(recorded) {
                info!(node_id = %id, "Pod bound to candidate during validation");
                return None;
            }
            chosen.push(candidate.clone());
        }

        self.evaluate(pass, &chosen, command.method)
    }

    /// Launch replacements, then reserve the candidates.
    async fn execute(&self, pass: &Pass, command: &Command, replacements: &[NodeProposal]) -> bool {
        let nominate_until = Utc::now()
            + chrono::Duration::from_std(self.config.nomination_ttl).unwrap_or(chrono::Duration::zero());

        let mut launched = Vec::with_capacity(replacements.len());
        let mut failed = false;
        for result in self.launcher.launch_all(replacements, &pass.pools).await {
            match result {
                Ok(node) => launched.push(node),
                Err(e) => {
                    warn!(method = %command.method, error = %e, "Replacement launch failed");
                    failed = true;
                }
            }
        }
        if failed {
            for node in &launched {
                if let Err(e) = self.launcher.abandon(node).await {
                    warn!(node_id = %node, error = %e, "Failed to terminate unused replacement");
                }
            }
            return false;
        }
        for node in &launched {
            self.cluster.nominate(node, nominate_until);
        }

        let marked = self.cluster.mark_for_deletion(&command.candidates);
        let removed: f64 = command
            .candidates
            .iter()
            .filter_map(|id| pass.snapshot.node(id))
            .filter_map(|n| pass.listed.find(&n.offering_key()))
            .map(|o| o.price)
            .sum();
        let added: f64 = replacements.iter().map(|p| p.offering.price).sum();

        info!(
            method = %command.method,
            nodes = ?command.candidates,
            marked,
            replacements = replacements.len(),
            hourly_savings = removed - added,
            "Reserved nodes for termination"
        );
        true
    }

    fn set_states(&self, nodes: &[NodeId], state: CandidateState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        for node in nodes {
            states.insert(*node, state);
        }
    }

    fn clear_states(&self, nodes: &[NodeId]) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        for node in nodes {
            states.remove(node);
        }
    }

    fn prune_states(&self, snapshot: &ClusterSnapshot) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.retain(|id, _| snapshot.node(id).is_some());
    }
}

/// Fresh offerings strictly cheaper than what `chosen` costs together. A
/// spot node is never replaced by another spot node.
fn replacement_catalog(fresh: &CatalogSnapshot, chosen: &[Candidate]) -> CatalogSnapshot {
    let total: Option<f64> = chosen.iter().map(|c| c.price).sum();
    let spot = chosen.iter().any(|c| c.is_spot());

    match total {
        Some(total) => fresh.filtered(|o| {
            o.price < total && !(spot && o.capacity_type == CapacityType::Spot)
        }),
        None => fresh.filtered(|_| false),
    }
}
