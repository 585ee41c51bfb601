//! Node termination.
//!
//! Drains nodes reserved for termination through a [`PodEvictor`] and asks
//! the cloud provider to terminate them once no pod is bound. Also rolls
//! back launches that never registered a node.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use flotilla_events::ChangeEvent;
use flotilla_id::{NodeId, PodId, ResourceVersion};
use flotilla_reconcile::RetryTracker;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::cloudprovider::{CloudProvider, CloudProviderError};
use crate::config::TerminationConfig;
use crate::error::StateError;
use crate::state::{Cluster, NodeLifecycle, PodObject, PodRecord, StateNode};

/// Eviction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvictionError {
    /// A disruption budget or similar guard refused the eviction.
    #[error("eviction of {0} refused")]
    Refused(String),

    #[error("eviction failed: {0}")]
    Other(String),
}

/// Requests pod eviction from the orchestration platform.
#[async_trait]
pub trait PodEvictor: Send + Sync {
    async fn evict(&self, pod: &PodRecord) -> Result<(), EvictionError>;
}

/// Evictor for development and tests.
///
/// With a pod event sink attached, every eviction is reported as a
/// `Deleted` event, and optionally followed by an unschedulable copy of the
/// pod the way its owning controller would recreate it.
#[derive(Default)]
pub struct FakeEvictor {
    evicted: Mutex<Vec<PodId>>,
    failures: Mutex<VecDeque<EvictionError>>,
    pod_events: Option<mpsc::Sender<ChangeEvent<PodObject>>>,
    recreate: bool,
}

impl FakeEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report evictions on `sink`, recreating owned pods if `recreate`.
    pub fn with_pod_events(mut self, sink: mpsc::Sender<ChangeEvent<PodObject>>, recreate: bool) -> Self {
        self.pod_events = Some(sink);
        self.recreate = recreate;
        self
    }

    pub fn fail_next(&self, error: EvictionError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn evicted(&self) -> Vec<PodId> {
        self.evicted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PodEvictor for FakeEvictor {
    async fn evict(&self, pod: &PodRecord) -> Result<(), EvictionError> {
        let scripted = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        self.evicted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pod.id());
        debug!(pod = %pod.qualified_name(), "[FAKE] Evicting pod");

        let Some(sink) = &self.pod_events else {
            return Ok(());
        };
        let deleted = ChangeEvent::deleted(pod.pod.clone(), pod.resource_version.next());
        if sink.send(deleted).await.is_err() {
            debug!("[FAKE] Pod event sink closed");
            return Ok(());
        }

        if self.recreate && pod.pod.owner.is_some() {
            let mut copy = PodObject::pending(&pod.pod.namespace, &pod.pod.name, pod.pod.requests);
            copy.labels = pod.pod.labels.clone();
            copy.limits = pod.pod.limits;
            copy.constraints = pod.pod.constraints.clone();
            copy.owner = pod.pod.owner.clone();
            copy.do_not_disrupt = pod.pod.do_not_disrupt;
            if sink.send(ChangeEvent::added(copy, ResourceVersion::new(1))).await.is_err() {
                debug!("[FAKE] Pod event sink closed");
            }
        }
        Ok(())
    }
}

/// Statistics from one termination pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationStats {
    pub rolled_back: usize,
    pub draining: usize,
    pub evicted: usize,
    pub eviction_failures: usize,
    pub released: usize,
    pub terminated: usize,
}

/// Drains and terminates reserved nodes.
pub struct Terminator {
    cluster: Arc<Cluster>,
    provider: Arc<dyn CloudProvider>,
    evictor: Arc<dyn PodEvictor>,
    config: TerminationConfig,
    retries: Mutex<RetryTracker<NodeId>>,
    /// Nodes the provider was asked to terminate, until their deletion
    /// event arrives.
    requested: Mutex<BTreeSet<NodeId>>,
}

impl Terminator {
    pub fn new(
        cluster: Arc<Cluster>,
        provider: Arc<dyn CloudProvider>,
        evictor: Arc<dyn PodEvictor>,
        config: TerminationConfig,
    ) -> Self {
        Self {
            retries: Mutex::new(RetryTracker::new(config.max_retries, config.retry_window)),
            requested: Mutex::new(BTreeSet::new()),
            cluster,
            provider,
            evictor,
            config,
        }
    }

    /// Terminate requests awaiting confirmation.
    pub fn requested(&self) -> BTreeSet<NodeId> {
        self.requested.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain and terminate on an interval until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting termination worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Termination worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One termination pass.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> TerminationStats {
        let mut stats = TerminationStats::default();

        for node in self
            .cluster
            .expire_provisional(Utc::now(), self.config.registration_ttl)
        {
            self.terminate(&node).await;
            stats.rolled_back += 1;
        }

        let snapshot = self.cluster.snapshot();
        {
            let mut requested = self.requested.lock().unwrap_or_else(|e| e.into_inner());
            requested.retain(|id| snapshot.node(id).is_some());
        }
        self.retries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .prune();
        self.cluster.prune_tombstones(Utc::now(), self.config.tombstone_ttl);

        let requested = self.requested();
        let targets: Vec<_> = snapshot
            .nodes()
            .filter(|n| n.marked_for_deletion || n.lifecycle == NodeLifecycle::Deleting)
            .filter(|n| !requested.contains(&n.id))
            .cloned()
            .collect();

        for node in targets {
            let pods = snapshot.pods_on(&node.id);
            if pods.is_empty() {
                // Re-check against the newest state before committing.
                match self.cluster.mark_deleting(&node.id) {
                    Ok(node) => {
                        if self.terminate(&node).await {
                            self.requested
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(node.id);
                            stats.terminated += 1;
                        }
                    }
                    Err(StateError::NodeNotEmpty { node, pods }) => {
                        debug!(node_id = %node, pods, "Pod bound since snapshot, waiting");
                    }
                    Err(StateError::NodeNotFound(node)) => {
                        debug!(node_id = %node, "Node already gone");
                    }
                }
                continue;
            }

            stats.draining += 1;
            let mut failed = false;
            for pod in pods.iter().filter(|p| !p.pod.terminating) {
                match self.evictor.evict(pod).await {
                    Ok(()) => stats.evicted += 1,
                    Err(e) => {
                        warn!(node_id = %node.id, pod = %pod.qualified_name(), error = %e, "Eviction failed");
                        stats.eviction_failures += 1;
                        failed = true;
                    }
                }
            }

            if failed && self.record_failure(&node.id) {
                self.cluster.unmark_for_deletion(&[node.id]);
                self.retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear(&node.id);
                warn!(node_id = %node.id, "Drain keeps failing, releasing node");
                stats.released += 1;
            }
        }

        if stats != TerminationStats::default() {
            info!(
                rolled_back = stats.rolled_back,
                draining = stats.draining,
                evicted = stats.evicted,
                eviction_failures = stats.eviction_failures,
                released = stats.released,
                terminated = stats.terminated,
                "Termination pass complete"
            );
        }
        stats
    }

    /// Returns true once the retry budget is spent.
    fn record_failure(&self, node: &NodeId) -> bool {
        self.retries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_failure(node)
    }

    async fn terminate(&self, node: &StateNode) -> bool {
        match self.provider.terminate(&node.handle()).await {
            Ok(()) => {
                info!(node_id = %node.id, shape = %node.shape, zone = %node.zone, "Requested node termination");
                true
            }
            Err(CloudProviderError::NotFound(_)) => {
                debug!(node_id = %node.id, "Node already terminated");
                true
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Termination failed, will retry");
                false
            }
        }
    }
}
