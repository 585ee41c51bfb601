//! Provisioning: from unschedulable pods to launched nodes.

mod batcher;
mod launcher;
mod provisioner;

pub use batcher::{batcher, BatchTrigger, Batcher};
pub use launcher::Launcher;
pub use provisioner::{Provisioner, ProvisioningStats};
