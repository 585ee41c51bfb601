//! The provisioning loop.
//!
//! Each pass gathers the pods that need capacity, simulates their
//! placement against the current fleet and catalog, nominates the
//! existing nodes pods are expected to land on and launches the proposed
//! ones. Pods that cannot be placed keep a reason in a per-pod registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flotilla_id::{NodeId, PodId};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::batcher::Batcher;
use super::launcher::Launcher;
use crate::catalog::CapacityCatalog;
use crate::config::ProvisionerConfig;
use crate::nodepool::NodePoolRegistry;
use crate::scheduling::{touched_nodes, PlacementPlan, SchedulingInput, Simulator, UnschedulableReason};
use crate::state::{Cluster, ClusterSnapshot, PodRecord};

/// Why a pod is waiting, and against which catalog generation.
#[derive(Debug, Clone, PartialEq)]
struct ReasonEntry {
    reason: UnschedulableReason,
    generation: u64,
}

/// Statistics from one provisioning pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisioningStats {
    /// Pods simulated.
    pub pods: usize,
    /// Pods skipped until the catalog changes.
    pub deferred: usize,
    /// Pods placed on existing or in-flight nodes.
    pub assigned: usize,
    pub launched: usize,
    pub launch_failures: usize,
    pub unschedulable: usize,
}

/// Runs provisioning passes.
pub struct Provisioner {
    cluster: Arc<Cluster>,
    catalog: Arc<CapacityCatalog>,
    pools: Arc<NodePoolRegistry>,
    launcher: Arc<Launcher>,
    simulator: Simulator,
    config: ProvisionerConfig,
    reasons: Mutex<BTreeMap<PodId, ReasonEntry>>,
}

impl Provisioner {
    pub fn new(
        cluster: Arc<Cluster>,
        catalog: Arc<CapacityCatalog>,
        pools: Arc<NodePoolRegistry>,
        launcher: Arc<Launcher>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            simulator: Simulator::new(config.ordering),
            cluster,
            catalog,
            pools,
            launcher,
            config,
            reasons: Mutex::new(BTreeMap::new()),
        }
    }

    /// Why `pod` is waiting, if it is.
    pub fn reason(&self, pod: &PodId) -> Option<UnschedulableReason> {
        let reasons = self.reasons.lock().unwrap_or_else(|e| e.into_inner());
        reasons.get(pod).map(|e| e.reason.clone())
    }

    /// Every waiting pod and its reason.
    pub fn reasons(&self) -> BTreeMap<PodId, UnschedulableReason> {
        let reasons = self.reasons.lock().unwrap_or_else(|e| e.into_inner());
        reasons
            .iter()
            .map(|(id, e)| (*id, e.reason.clone()))
            .collect()
    }

    /// Run provisioning on every closed batch and on the resync interval
    /// until shutdown.
    #[instrument(skip(self, batcher, shutdown))]
    pub async fn run(&self, mut batcher: Batcher, mut shutdown: watch::Receiver<bool>) {
        info!(
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting provisioner"
        );

        let mut resync = tokio::time::interval(self.config.resync_interval);
        let mut triggers_open = true;

        loop {
            tokio::select! {
                batch = batcher.wait(), if triggers_open => match batch {
                    Some(triggers) => {
                        debug!(triggers, "Batch closed");
                        if self.provision_until(&mut shutdown).await {
                            break;
                        }
                    }
                    None => {
                        warn!("Batch triggers closed, provisioning on resync only");
                        triggers_open = false;
                    }
                },
                _ = resync.tick() => {
                    if self.provision_until(&mut shutdown).await {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Provisioner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one pass unless shutdown arrives first. Returns whether it did.
    /// An abandoned pass leaves launches already reserved to the
    /// registration timeout.
    async fn provision_until(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.provision() => false,
            _ = shutdown_signalled(shutdown) => {
                info!("Provisioner shutting down, abandoning pass");
                true
            }
        }
    }

    /// One provisioning pass.
    #[instrument(skip(self))]
    pub async fn provision(&self) -> ProvisioningStats {
        let now = Utc::now();
        let snapshot = self.cluster.snapshot();
        let catalog = self.catalog.usable(now);
        let generation = catalog.generation();
        let pools = self.pools.current();
        let unavailable = self.catalog.unavailable().active();

        let marked: BTreeSet<NodeId> = snapshot
            .nodes()
            .filter(|n| n.marked_for_deletion)
            .map(|n| n.id)
            .collect();
        let view = snapshot.without_nodes(&marked);

        let (pods, deferred) = self.batch(&snapshot, &view, &marked, generation);
        let mut stats = ProvisioningStats {
            pods: pods.len(),
            deferred,
            ..Default::default()
        };
        if pods.is_empty() {
            return stats;
        }

        let plan = self.simulator.simulate(&SchedulingInput {
            snapshot: &view,
            pods,
            catalog: &catalog,
            pools: &pools,
            unavailable: &unavailable,
        });

        let nominate_until = nomination_deadline(now, &self.config);
        for node in touched_nodes(&plan) {
            self.cluster.nominate(&node, nominate_until);
        }
        stats.assigned = plan.assignments.len();

        let mut failed: BTreeMap<PodId, UnschedulableReason> = BTreeMap::new();
        let results = self.launcher.launch_all(&plan.proposals, &pools).await;
        for (proposal, result) in plan.proposals.iter().zip(results) {
            match result {
                Ok(node) => {
                    stats.launched += 1;
                    self.cluster.nominate(&node, nominate_until);
                }
                Err(e) => {
                    stats.launch_failures += 1;
                    let reason = UnschedulableReason::LaunchFailed {
                        reason: e.to_string(),
                    };
                    failed.extend(proposal.pods.iter().map(|p| (*p, reason.clone())));
                }
            }
        }

        stats.unschedulable = plan.unschedulable.len() + failed.len();
        self.record(&plan, failed, generation, &snapshot);

        info!(
            pods = stats.pods,
            deferred = stats.deferred,
            assigned = stats.assigned,
            launched = stats.launched,
            launch_failures = stats.launch_failures,
            unschedulable = stats.unschedulable,
            catalog_generation = generation,
            "Provisioning pass complete"
        );

        stats
    }

    /// Pods to simulate: unschedulable pods plus the reschedulable pods of
    /// nodes reserved for deletion, minus those waiting for the catalog.
    fn batch(
        &self,
        snapshot: &ClusterSnapshot,
        view: &ClusterSnapshot,
        marked: &BTreeSet<NodeId>,
        generation: u64,
    ) -> (Vec<Arc<PodRecord>>, usize) {
        let displaced = marked
            .iter()
            .flat_map(|node| snapshot.pods_on(node))
            .filter(|p| p.is_reschedulable())
            .filter_map(|p| view.pod(&p.id()).cloned());

        let candidates: Vec<Arc<PodRecord>> = view.unschedulable_pods().into_iter().chain(displaced).collect();
        let wanted: BTreeSet<PodId> = candidates.iter().map(|p| p.id()).collect();

        let mut reasons = self.reasons.lock().unwrap_or_else(|e| e.into_inner());
        reasons.retain(|id, _| wanted.contains(id));

        let before = candidates.len();
        let pods: Vec<_> = candidates
            .into_iter()
            .filter(|p| {
                !reasons.get(&p.id()).is_some_and(|e| {
                    e.reason.waits_for_catalog_change() && e.generation == generation
                })
            })
            .collect();

        let deferred = before - pods.len();
        (pods, deferred)
    }

    fn record(
        &self,
        plan: &PlacementPlan,
        failed: BTreeMap<PodId, UnschedulableReason>,
        generation: u64,
        snapshot: &ClusterSnapshot,
    ) {
        let mut reasons = self.reasons.lock().unwrap_or_else(|e| e.into_inner());

        for pod in plan.assignments.keys() {
            reasons.remove(pod);
        }
        for pod in plan.proposals.iter().flat_map(|p| &p.pods) {
            reasons.remove(pod);
        }

        let unplaced = plan
            .unschedulable
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .chain(failed);

        for (id, reason) in unplaced {
            let entry = ReasonEntry { reason, generation };
            if reasons.get(&id).map(|e| &e.reason) != Some(&entry.reason) {
                let name = snapshot
                    .pod(&id)
                    .map(|p| p.qualified_name())
                    .unwrap_or_else(|| id.to_string());
                info!(pod = %name, pod_id = %id, reason = %entry.reason, "Pod unschedulable");
            }
            reasons.insert(id, entry);
        }
    }
}

/// Resolves once shutdown is set. A dropped sender never signals.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// When a nomination made at `now` lapses.
fn nomination_deadline(now: DateTime<Utc>, config: &ProvisionerConfig) -> DateTime<Utc> {
    now + chrono::Duration::from_std(config.nomination_ttl).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::catalog::{CapacityType, Offering};
    use crate::cloudprovider::{CloudProviderError, FakeCloudProvider};
    use crate::config::{BatcherConfig, CatalogConfig};
    use crate::nodepool::NodePool;
    use crate::resources::Resources;
    use crate::state::{NodeObject, PodObject};
    use flotilla_events::ChangeEvent;
    use flotilla_id::ResourceVersion;
    use flotilla_reconcile::BackoffPolicy;

    fn offering(shape: &str, cores: u64, gib: u64, price: f64) -> Offering {
        let capacity = Resources::cores_gib(cores, gib).with_pods(110);
        Offering {
            shape: shape.to_string(),
            capacity,
            allocatable: capacity,
            zone: "zone-a".to_string(),
            capacity_type: CapacityType::OnDemand,
            price,
            observed_at: Utc::now(),
        }
    }

    struct Harness {
        provider: Arc<FakeCloudProvider>,
        cluster: Arc<Cluster>,
        catalog: Arc<CapacityCatalog>,
        provisioner: Provisioner,
        versions: u64,
    }

    impl Harness {
        async fn new(offerings: Vec<Offering>) -> Self {
            Self::with_retries(offerings, 1, BackoffPolicy::default()).await
        }

        async fn with_retries(offerings: Vec<Offering>, attempts: u32, backoff: BackoffPolicy) -> Self {
            let provider = Arc::new(FakeCloudProvider::new(offerings));
            let cluster = Arc::new(Cluster::new());
            let catalog = Arc::new(CapacityCatalog::new(provider.clone(), CatalogConfig::default()));
            catalog.refresh().await.unwrap();

            let pools = Arc::new(NodePoolRegistry::new(vec![NodePool::new("default")]).unwrap());
            let launcher = Arc::new(Launcher::new(
                provider.clone(),
                cluster.clone(),
                catalog.clone(),
                attempts,
                backoff,
            ));
            let provisioner = Provisioner::new(
                cluster.clone(),
                catalog.clone(),
                pools,
                launcher,
                ProvisionerConfig::default(),
            );

            Self {
                provider,
                cluster,
                catalog,
                provisioner,
                versions: 0,
            }
        }

        fn add_pod(&mut self, pod: PodObject) -> PodId {
            self.versions += 1;
            let id = pod.id;
            self.cluster
                .apply_pod_event(&ChangeEvent::added(pod, ResourceVersion::new(self.versions)));
            id
        }

        fn add_node(&mut self, node: NodeObject) {
            self.versions += 1;
            self.cluster
                .apply_node_event(&ChangeEvent::added(node, ResourceVersion::new(self.versions)));
        }
    }

    fn ready_node(cores: u64) -> NodeObject {
        let capacity = Resources::cores_gib(cores, 4 * cores).with_pods(110);
        NodeObject {
            id: NodeId::new(),
            provider_id: None,
            zone: "zone-a".to_string(),
            shape: "m.large".to_string(),
            capacity_type: CapacityType::OnDemand,
            capacity,
            allocatable: capacity,
            labels: Default::default(),
            taints: vec![],
            node_pool: Some("default".to_string()),
            ready: true,
            deleting: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_launch_backoff() {
        let backoff = BackoffPolicy {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
            jitter: 0.0,
        };
        let mut h = Harness::with_retries(vec![offering("m.large", 4, 16, 0.2)], 10, backoff).await;
        for _ in 0..10 {
            h.provider.fail_next_launch(CloudProviderError::Throttled);
        }
        h.add_pod(PodObject::pending("default", "web", Resources::cores_gib(1, 1)));

        let (_trigger, batches) = crate::provisioning::batcher(BatcherConfig::default());
        let (stop, shutdown) = watch::channel(false);
        let provider = h.provider.clone();
        tokio::spawn(async move {
            while provider.launch_requests().is_empty() {
                tokio::task::yield_now().await;
            }
            let _ = stop.send(true);
        });

        let run = tokio::time::timeout(Duration::from_secs(5), h.provisioner.run(batches, shutdown)).await;
        assert!(run.is_ok());
        assert_eq!(h.provider.launch_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_pods_get_nodes() {
        let mut h = Harness::new(vec![offering("m.large", 4, 16, 0.2)]).await;
        h.add_pod(PodObject::pending("default", "web", Resources::cores_gib(1, 1)));

        let stats = h.provisioner.provision().await;
        assert_eq!(stats.launched, 1);
        assert_eq!(h.provider.launch_requests().len(), 1);

        // The provisional node absorbs the pod on the next pass.
        let stats = h.provisioner.provision().await;
        assert_eq!(stats.launched, 0);
        assert_eq!(stats.assigned, 1);
        assert_eq!(h.provider.launch_requests().len(), 1);

        let node = h.cluster.snapshot().nodes().next().cloned().unwrap();
        assert!(node.is_nominated(Utc::now()));
    }

    #[tokio::test]
    async fn test_oversized_pod_waits_for_catalog_change() {
        let mut h = Harness::new(vec![offering("m.4xlarge", 16, 64, 1.0)]).await;
        let pod = h.add_pod(PodObject::pending("default", "huge", Resources::cores_gib(32, 8)));

        let stats = h.provisioner.provision().await;
        assert_eq!(stats.unschedulable, 1);
        assert_eq!(
            h.provisioner.reason(&pod),
            Some(UnschedulableReason::NoOfferingSatisfiesResources)
        );

        let stats = h.provisioner.provision().await;
        assert_eq!(stats.pods, 0);
        assert_eq!(stats.deferred, 1);

        h.provider.set_offerings(vec![offering("m.8xlarge", 32, 128, 2.0)]);
        h.catalog.refresh().await.unwrap();

        let stats = h.provisioner.provision().await;
        assert_eq!(stats.launched, 1);
        assert_eq!(h.provisioner.reason(&pod), None);
    }

    #[tokio::test]
    async fn test_launch_failure_recorded_and_resimulated() {
        let mut h = Harness::new(vec![
            offering("m.large", 4, 16, 0.2),
            offering("c.large", 4, 8, 0.25),
        ])
        .await;
        let pod = h.add_pod(PodObject::pending("default", "web", Resources::cores_gib(1, 1)));
        h.provider
            .fail_next_launch(CloudProviderError::InvalidShape("m.large".into()));

        let stats = h.provisioner.provision().await;
        assert_eq!(stats.launch_failures, 1);
        assert!(matches!(
            h.provisioner.reason(&pod),
            Some(UnschedulableReason::LaunchFailed { .. })
        ));

        let stats = h.provisioner.provision().await;
        assert_eq!(stats.launched, 1);
        let requests = h.provider.launch_requests();
        assert_eq!(requests[1].shape, "c.large");
    }

    #[tokio::test]
    async fn test_pods_on_marked_nodes_get_replacements() {
        let mut h = Harness::new(vec![offering("m.large", 4, 16, 0.2)]).await;
        let node = ready_node(4);
        let node_id = node.id;
        h.add_node(node);
        h.add_pod(PodObject::pending("default", "web", Resources::cores_gib(1, 1)).bound_to(node_id));

        assert_eq!(h.provisioner.provision().await.pods, 0);

        h.cluster.mark_for_deletion(&[node_id]);
        let stats = h.provisioner.provision().await;
        assert_eq!(stats.pods, 1);
        assert_eq!(stats.launched, 1);
    }

    #[test]
    fn test_nomination_deadline() {
        let now = Utc::now();
        let config = ProvisionerConfig::default();
        assert_eq!(
            nomination_deadline(now, &config),
            now + chrono::Duration::seconds(20)
        );
    }
}
