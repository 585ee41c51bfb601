//! # flotilla-id
//!
//! Typed identifiers for the objects the orchestrator tracks.
//!
//! ## ID Format
//!
//! Every identifier is `{prefix}_{ulid}`:
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `pod_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `lnch_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a pod identifier from ever being used where a node
//! identifier is expected, and the ULID body gives a total order that the
//! scheduling simulator relies on for deterministic tie-breaking.
//!
//! [`ResourceVersion`] is the per-object monotonic counter carried by every
//! change notification.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
