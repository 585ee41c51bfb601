//! Cloud provider interface.
//!
//! The provider enumerates purchasable offerings, launches nodes and
//! terminates them. Calls block on external I/O and are only made from the
//! provisioning, catalog and termination tasks, never while holding fleet
//! state locks.
//!
//! An in-process [`FakeCloudProvider`] backs the development binary and the
//! tests.

mod fake;

use async_trait::async_trait;
use flotilla_id::{LaunchId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{CapacityType, Offering, OfferingKey};
use crate::constraints::{Labels, Requirements, Taint};

pub use fake::{FakeCloudProvider, ProviderCall};

/// A request to launch one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Identity the node will register with.
    pub node_id: NodeId,
    pub launch_id: LaunchId,
    pub shape: String,
    pub zone: String,
    pub capacity_type: CapacityType,
    pub labels: Labels,
    pub taints: Vec<Taint>,
}

impl LaunchRequest {
    pub fn offering_key(&self) -> OfferingKey {
        OfferingKey {
            shape: self.shape.clone(),
            zone: self.zone.clone(),
            capacity_type: self.capacity_type,
        }
    }
}

/// Provider-side handle for a launched node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHandle {
    pub node_id: NodeId,
    pub provider_id: String,
}

/// Cloud provider errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CloudProviderError {
    #[error("request throttled")]
    Throttled,

    #[error("insufficient capacity for {0}")]
    InsufficientCapacity(OfferingKey),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node in use: {0}")]
    InUse(String),

    #[error("provider error: {0}")]
    Other(String),
}

impl CloudProviderError {
    /// Transient errors are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudProviderError::Throttled
                | CloudProviderError::InsufficientCapacity(_)
                | CloudProviderError::InUse(_)
        )
    }

    /// Permanent errors are not retried against the same offering.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CloudProviderError::QuotaExceeded(_) | CloudProviderError::InvalidShape(_)
        )
    }

    /// Errors after which the offering is excluded from simulation for a while.
    pub fn marks_offering_unavailable(&self) -> bool {
        self.is_permanent() || matches!(self, CloudProviderError::InsufficientCapacity(_))
    }
}

/// Cloud provider interface.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// List offerings whose labels satisfy `requirements`.
    async fn list_offerings(
        &self,
        requirements: &Requirements,
    ) -> Result<Vec<Offering>, CloudProviderError>;

    /// Launch a node.
    async fn launch(&self, request: &LaunchRequest) -> Result<NodeHandle, CloudProviderError>;

    /// Terminate a node.
    async fn terminate(&self, handle: &NodeHandle) -> Result<(), CloudProviderError>;
}
