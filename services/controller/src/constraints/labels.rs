//! Well-known node label keys.

pub const ZONE: &str = "topology.flotilla.dev/zone";
pub const HOSTNAME: &str = "flotilla.dev/hostname";
pub const INSTANCE_SHAPE: &str = "flotilla.dev/instance-shape";
pub const CAPACITY_TYPE: &str = "flotilla.dev/capacity-type";
pub const NODE_POOL: &str = "flotilla.dev/nodepool";
pub const NODE_POOL_FINGERPRINT: &str = "flotilla.dev/nodepool-fingerprint";

