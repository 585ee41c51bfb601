//! In-process cloud provider for development and tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use flotilla_events::ChangeEvent;
use flotilla_id::{NodeId, ResourceVersion};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{CloudProvider, CloudProviderError, LaunchRequest, NodeHandle};
use crate::catalog::Offering;
use crate::constraints::{labels, Requirements};
use crate::state::NodeObject;

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    ListOfferings,
    Launch(LaunchRequest),
    Terminate(NodeId),
}

/// Fake cloud provider.
///
/// Launches succeed unless a failure has been scripted. When an event sink
/// is attached, every launch is followed by a ready node `Added` event and
/// every termination by a `Deleted` event, the way a real node watch would
/// report them.
pub struct FakeCloudProvider {
    offerings: Mutex<Vec<Offering>>,
    restamp: AtomicBool,
    launched: Mutex<BTreeMap<NodeId, NodeObject>>,
    calls: Mutex<Vec<ProviderCall>>,
    launch_failures: Mutex<VecDeque<Option<CloudProviderError>>>,
    terminate_failures: Mutex<VecDeque<CloudProviderError>>,
    node_events: Mutex<Option<mpsc::Sender<ChangeEvent<NodeObject>>>>,
    versions: AtomicU64,
}

impl FakeCloudProvider {
    /// Create a provider selling `offerings`.
    ///
    /// Listings are stamped with the current time.
    pub fn new(offerings: Vec<Offering>) -> Self {
        Self {
            offerings: Mutex::new(offerings),
            restamp: AtomicBool::new(true),
            launched: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            launch_failures: Mutex::new(VecDeque::new()),
            terminate_failures: Mutex::new(VecDeque::new()),
            node_events: Mutex::new(None),
            versions: AtomicU64::new(1),
        }
    }

    /// Keep the offerings' own timestamps instead of stamping listings.
    pub fn preserve_timestamps(self) -> Self {
        self.restamp.store(false, Ordering::SeqCst);
        self
    }

    /// Report node lifecycle on `sink`.
    pub fn with_node_events(self, sink: mpsc::Sender<ChangeEvent<NodeObject>>) -> Self {
        *self.node_events.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
        self
    }

    pub fn set_offerings(&self, offerings: Vec<Offering>) {
        *self.offerings.lock().unwrap_or_else(|e| e.into_inner()) = offerings;
    }

    /// Fail the next launch with `error`.
    pub fn fail_next_launch(&self, error: CloudProviderError) {
        self.launch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Some(error));
    }

    /// Let the next launch through ahead of any scripted failures.
    pub fn allow_next_launch(&self) {
        self.launch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(None);
    }

    /// Fail the next termination with `error`.
    pub fn fail_next_terminate(&self, error: CloudProviderError) {
        self.terminate_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn launch_requests(&self) -> Vec<LaunchRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::Launch(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn terminated(&self) -> Vec<NodeId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::Terminate(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Nodes launched and not yet terminated.
    pub fn running(&self) -> Vec<NodeObject> {
        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn record(&self, call: ProviderCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn next_version(&self) -> ResourceVersion {
        ResourceVersion::new(self.versions.fetch_add(1, Ordering::SeqCst))
    }

    async fn emit(&self, event: ChangeEvent<NodeObject>) {
        let sink = self
            .node_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sink) = sink {
            if sink.send(event).await.is_err() {
                debug!("[FAKE] Node event sink closed");
            }
        }
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn list_offerings(
        &self,
        requirements: &Requirements,
    ) -> Result<Vec<Offering>, CloudProviderError> {
        self.record(ProviderCall::ListOfferings);

        let restamp = self.restamp.load(Ordering::SeqCst);
        let now = Utc::now();
        let offerings = self
            .offerings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|o| requirements.matches(&o.labels()).is_ok())
            .cloned()
            .map(|mut o| {
                if restamp {
                    o.observed_at = now;
                }
                o
            })
            .collect();

        Ok(offerings)
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<NodeHandle, CloudProviderError> {
        self.record(ProviderCall::Launch(request.clone()));

        let scripted = self
            .launch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .flatten();
        if let Some(error) = scripted {
            return Err(error);
        }

        let offering = self
            .offerings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|o| o.key() == request.offering_key())
            .cloned()
            .ok_or_else(|| CloudProviderError::InvalidShape(request.shape.clone()))?;

        let provider_id = format!("fake://{}/{}", request.zone, request.node_id);
        info!(
            node_id = %request.node_id,
            shape = %request.shape,
            zone = %request.zone,
            "[FAKE] Launching node"
        );

        let mut node_labels = request.labels.clone();
        node_labels.insert(labels::HOSTNAME.to_string(), request.node_id.to_string());

        let node = NodeObject {
            id: request.node_id,
            provider_id: Some(provider_id.clone()),
            zone: request.zone.clone(),
            shape: request.shape.clone(),
            capacity_type: request.capacity_type,
            capacity: offering.capacity,
            allocatable: offering.allocatable,
            labels: node_labels,
            taints: request.taints.clone(),
            node_pool: request.labels.get(labels::NODE_POOL).cloned(),
            ready: true,
            deleting: false,
            created_at: Utc::now(),
        };

        self.launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.node_id, node.clone());
        self.emit(ChangeEvent::added(node, self.next_version())).await;

        Ok(NodeHandle {
            node_id: request.node_id,
            provider_id,
        })
    }

    async fn terminate(&self, handle: &NodeHandle) -> Result<(), CloudProviderError> {
        self.record(ProviderCall::Terminate(handle.node_id));

        let scripted = self
            .terminate_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        let removed = self
            .launched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.node_id);

        match removed {
            Some(node) => {
                info!(node_id = %handle.node_id, "[FAKE] Terminating node");
                self.emit(ChangeEvent::deleted(node, self.next_version())).await;
                Ok(())
            }
            None => Err(CloudProviderError::NotFound(handle.provider_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CapacityType;
    use crate::resources::Resources;
    use flotilla_events::ChangeKind;
    use flotilla_id::LaunchId;

    fn offering() -> Offering {
        Offering {
            shape: "m.large".to_string(),
            capacity: Resources::cores_gib(4, 16).with_pods(110),
            allocatable: Resources::cores_gib(4, 16).with_pods(110),
            zone: "zone-a".to_string(),
            capacity_type: CapacityType::OnDemand,
            price: 0.2,
            observed_at: Utc::now(),
        }
    }

    fn request(shape: &str) -> LaunchRequest {
        LaunchRequest {
            node_id: NodeId::new(),
            launch_id: LaunchId::new(),
            shape: shape.to_string(),
            zone: "zone-a".to_string(),
            capacity_type: CapacityType::OnDemand,
            labels: Default::default(),
            taints: vec![],
        }
    }

    #[tokio::test]
    async fn test_launch_emits_ready_node() {
        let (tx, mut rx) = mpsc::channel(8);
        let provider = FakeCloudProvider::new(vec![offering()]).with_node_events(tx);

        let request = request("m.large");
        let handle = provider.launch(&request).await.unwrap();
        assert_eq!(handle.node_id, request.node_id);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.change, ChangeKind::Added);
        assert!(event.payload.ready);
        assert_eq!(event.payload.allocatable, offering().allocatable);
        assert_eq!(provider.running().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_shape_is_invalid() {
        let provider = FakeCloudProvider::new(vec![offering()]);
        let err = provider.launch(&request("x.huge")).await.unwrap_err();
        assert!(matches!(err, CloudProviderError::InvalidShape(_)));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = FakeCloudProvider::new(vec![offering()]);
        provider.fail_next_launch(CloudProviderError::Throttled);

        assert_eq!(
            provider.launch(&request("m.large")).await.unwrap_err(),
            CloudProviderError::Throttled
        );
        assert!(provider.launch(&request("m.large")).await.is_ok());
        assert_eq!(provider.launch_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_terminate_unknown_node() {
        let provider = FakeCloudProvider::new(vec![offering()]);
        let handle = NodeHandle {
            node_id: NodeId::new(),
            provider_id: "fake://gone".to_string(),
        };
        let err = provider.terminate(&handle).await.unwrap_err();
        assert!(matches!(err, CloudProviderError::NotFound(_)));
        assert_eq!(provider.terminated(), vec![handle.node_id]);
    }
}
