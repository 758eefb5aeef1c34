//! Admission policies
//!
//! Two parallel policies: a source allowlist and a destination denylist.
//! Each keeps an immutable, decision-optimized runtime snapshot behind an
//! atomic pointer; the pollers rebuild and swap it when the store version
//! moves.

mod dest;
mod source;

pub use dest::{DenyMatch, DestPolicy, DestRuntime};
pub use source::{SourcePolicy, SourceRuntime};

use std::time::Duration;

/// Poll cadence for the store version counters. Mutations become visible
/// within one tick.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
