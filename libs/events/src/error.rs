//! Error types for change-event construction.

use thiserror::Error;

/// Errors that can occur when building change events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A required envelope field was not set.
    #[error("missing change event field: {0}")]
    MissingField(&'static str),
}
