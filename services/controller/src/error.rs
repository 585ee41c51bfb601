//! Controller error types.

use flotilla_events::ObjectKind;
use flotilla_id::NodeId;
use thiserror::Error;

use crate::cloudprovider::CloudProviderError;

/// Fatal controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A change-event stream ended; the fleet state can no longer be trusted.
    #[error("{0} event stream closed")]
    EventStreamClosed(ObjectKind),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),
}

/// Tracker operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {node} still has {pods} bound pods")]
    NodeNotEmpty { node: NodeId, pods: usize },
}

/// Launch errors, after retries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LaunchError {
    /// The provider rejected the offering outright.
    #[error("launch rejected: {0}")]
    Permanent(CloudProviderError),

    #[error("launch failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: CloudProviderError,
    },

    #[error("node pool {0} no longer exists")]
    UnknownPool(String),
}

impl LaunchError {
    /// The provider error behind this failure, if any.
    pub fn provider_error(&self) -> Option<&CloudProviderError> {
        match self {
            LaunchError::Permanent(e) => Some(e),
            LaunchError::RetriesExhausted { last, .. } => Some(last),
            LaunchError::UnknownPool(_) => None,
        }
    }
}
