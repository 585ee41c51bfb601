//! Object and change kinds.

use serde::{Deserialize, Serialize};

/// Kind of watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Node,
    Pod,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Node => write!(f, "node"),
            ObjectKind::Pod => write!(f, "pod"),
        }
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Returns true for `Added` and `Updated`, which both upsert.
    pub fn is_upsert(&self) -> bool {
        matches!(self, ChangeKind::Added | ChangeKind::Updated)
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// An object that can be delivered through a change notification.
pub trait WatchedObject: Clone + Send + Sync + 'static {
    /// Identity type for the object.
    type Id: Copy + Ord + std::hash::Hash + std::fmt::Display + Send + Sync + 'static;

    /// The kind this object belongs to.
    const KIND: ObjectKind;

    /// Returns the object's identity.
    fn id(&self) -> Self::Id;
}
