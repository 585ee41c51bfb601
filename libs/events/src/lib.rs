//! # flotilla-events
//!
//! Change notifications delivered to the fleet state tracker.
//!
//! ## Delivery Contract
//!
//! - Delivery is at-least-once: the same notification may arrive twice
//! - Ordering holds per object identity only, never across objects
//! - A notification carries the full object, including on deletion
//!   (the last state observed before the object disappeared)
//! - Every notification carries a per-object [`ResourceVersion`]
//!
//! [`ResourceVersion`]: flotilla_id::ResourceVersion

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
