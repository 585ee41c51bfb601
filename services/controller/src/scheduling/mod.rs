//! Scheduling simulation.
//!
//! Answers "where would these pods go" without touching anything. The
//! provisioner uses it to decide which nodes to launch, and the
//! consolidator uses it to check that a node's pods can move elsewhere
//! before removing it.

mod groups;
mod ordering;
mod packing;
mod plan;
mod simulator;
mod topology;

pub use groups::{group_sizes, partition, SchedulingGroup};
pub use ordering::{ProposalOrdering, UnknownOrdering};
pub use plan::{NodeProposal, PlacementPlan, UnschedulableReason};
pub use simulator::{touched_nodes, SchedulingInput, Simulator};
