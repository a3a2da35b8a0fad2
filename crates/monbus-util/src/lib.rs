//! Shared utilities for monbus
//!
//! This crate provides:
//! - Client identifiers (monotonic, process-unique)
//! - Socket path construction shared by services and their peers
//! - Timeout semantics for event-loop waits
//! - Buffer and message size limits

mod ids;
mod limits;
mod paths;
mod time;

pub use ids::*;
pub use limits::*;
pub use paths::*;
pub use time::*;
