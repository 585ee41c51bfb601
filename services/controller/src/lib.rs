//! Flotilla node-lifecycle controller library.
//!
//! This crate primarily ships a `controller` binary, but we expose the
//! engine as a library to enable integration testing and reuse: the fleet
//! state tracker, the scheduling simulator, provisioning, and the
//! consolidation and termination workers.

pub mod catalog;
pub mod cloudprovider;
pub mod config;
pub mod constraints;
pub mod controller;
pub mod disruption;
pub mod error;
pub mod nodepool;
pub mod provisioning;
pub mod resources;
pub mod scheduling;
pub mod state;

pub use controller::{Controller, EventStreams};
pub use error::ControllerError;
