//! Node launches.
//!
//! Turns a [`NodeProposal`] into a cloud-provider launch, retrying
//! transient failures with backoff. A successful launch is reserved in the
//! fleet state right away so the next simulation already sees the node.

use std::sync::Arc;

use flotilla_id::{LaunchId, NodeId};
use flotilla_reconcile::BackoffPolicy;
use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{CapacityCatalog, Offering};
use crate::cloudprovider::{CloudProvider, CloudProviderError, LaunchRequest};
use crate::constraints::labels;
use crate::error::LaunchError;
use crate::nodepool::{PoolSet, RegisteredPool};
use crate::scheduling::NodeProposal;
use crate::state::Cluster;

/// Launches nodes and reserves them in the fleet state.
pub struct Launcher {
    provider: Arc<dyn CloudProvider>,
    cluster: Arc<Cluster>,
    catalog: Arc<CapacityCatalog>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl Launcher {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        cluster: Arc<Cluster>,
        catalog: Arc<CapacityCatalog>,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            provider,
            cluster,
            catalog,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// The request for a node of `offering` owned by `pool`.
    pub fn request_for(pool: &RegisteredPool, offering: &Offering) -> LaunchRequest {
        let mut node_labels = pool.pool.node_labels(offering);
        node_labels.insert(
            labels::NODE_POOL_FINGERPRINT.to_string(),
            pool.fingerprint.as_str().to_string(),
        );

        LaunchRequest {
            node_id: NodeId::new(),
            launch_id: LaunchId::new(),
            shape: offering.shape.clone(),
            zone: offering.zone.clone(),
            capacity_type: offering.capacity_type,
            labels: node_labels,
            taints: pool.pool.taints.clone(),
        }
    }

    /// Launch one proposed node. Returns the id it will register with.
    #[instrument(skip(self, proposal, pools), fields(pool = %proposal.pool, offering = %proposal.offering.key()))]
    pub async fn launch(&self, proposal: &NodeProposal, pools: &PoolSet) -> Result<NodeId, LaunchError> {
        let pool = pools
            .get(&proposal.pool)
            .ok_or_else(|| LaunchError::UnknownPool(proposal.pool.clone()))?;
        let request = Self::request_for(pool, &proposal.offering);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.launch(&request).await {
                Ok(handle) => {
                    if !self.cluster.reserve_launch(&request, &handle, &proposal.offering) {
                        debug!(node_id = %request.node_id, "Node already known, skipping reservation");
                    }
                    info!(
                        node_id = %request.node_id,
                        launch_id = %request.launch_id,
                        provider_id = %handle.provider_id,
                        pods = proposal.pods.len(),
                        attempt,
                        "Launched node"
                    );
                    return Ok(request.node_id);
                }
                Err(e) if e.is_permanent() => {
                    warn!(node_id = %request.node_id, error = %e, "Launch rejected");
                    self.park(&request, &e);
                    return Err(LaunchError::Permanent(e));
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        node_id = %request.node_id,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Launch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(node_id = %request.node_id, error = %e, attempt, "Launch failed");
                    self.park(&request, &e);
                    return Err(LaunchError::RetriesExhausted { attempts: attempt, last: e });
                }
            }
        }
    }

    /// Launch every proposal concurrently. Results are in proposal order.
    pub async fn launch_all(
        &self,
        proposals: &[NodeProposal],
        pools: &PoolSet,
    ) -> Vec<Result<NodeId, LaunchError>> {
        join_all(proposals.iter().map(|p| self.launch(p, pools))).await
    }

    /// Terminate a launched node nothing will use and drop its reservation.
    /// A node that already registered is left to its deletion event.
    pub async fn abandon(&self, id: &NodeId) -> Result<(), CloudProviderError> {
        let Some(node) = self.cluster.snapshot().node(id).cloned() else {
            return Ok(());
        };
        match self.provider.terminate(&node.handle()).await {
            Ok(()) | Err(CloudProviderError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.cluster.rollback_launch(id);
        info!(node_id = %id, "Abandoned launched node");
        Ok(())
    }

    fn park(&self, request: &LaunchRequest, error: &CloudProviderError) {
        if error.marks_offering_unavailable() {
            self.catalog.unavailable().mark(request.offering_key());
        }
    }
}
