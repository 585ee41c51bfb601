//! Disruption: choosing nodes to remove and removing them safely.

mod candidates;
mod consolidation;
mod termination;

pub use candidates::{candidates, Candidate, CandidateState};
pub use consolidation::{Command, ConsolidationStats, Consolidator, DisruptionMethod};
pub use termination::{EvictionError, FakeEvictor, PodEvictor, TerminationStats, Terminator};
