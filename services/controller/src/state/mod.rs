//! Fleet state.
//!
//! Watched objects arrive as change events and are folded into node and pod
//! records by the [`Cluster`] tracker. Everything downstream reads
//! [`ClusterSnapshot`]s.

mod cluster;
mod node;
mod objects;
mod pod;
mod snapshot;

pub use cluster::{ApplyOutcome, Cluster, Inconsistency, MAX_INCONSISTENCIES};
pub use node::{NodeLifecycle, NodePhase, StateNode};
pub use objects::{NodeObject, OwnerReference, PodObject};
pub use pod::{PodPhase, PodRecord};
pub use snapshot::ClusterSnapshot;
