//! Typed ID definitions for the objects the orchestrator tracks.

use crate::define_id;

// =============================================================================
// Fleet objects
// =============================================================================

define_id!(NodeId, "node");
define_id!(PodId, "pod");

// =============================================================================
// Provisioning
// =============================================================================

define_id!(LaunchId, "lnch");

// =============================================================================
// Resource Version
// =============================================================================

/// Monotonic per-object version carried by change notifications.
///
/// Versions are only comparable for the same object identity; there is no
/// global order across objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version assigned to objects synthesized locally, before any
    /// authoritative notification has been seen.
    pub const LOCAL: Self = Self(0);

    /// Creates a version from its raw value.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if `self` must be discarded because `applied` is newer.
    #[must_use]
    pub fn is_stale_against(&self, applied: ResourceVersion) -> bool {
        *self < applied
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Tests
// =============================================================================
