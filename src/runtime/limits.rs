//! Runtime limits and constants.
//!
//! Collected in one place so they're easy to find and reference from both
//! runtime code and provider validators.

/// Upper bound on polls of a workflow future within one segment. A workflow
/// that keeps waking itself without waiting on history is cut off here.
pub const MAX_POLLS_PER_SEGMENT: usize = 10_000;

/// Attempts to record an input event when the instance keeps moving under the
/// writer (each attempt re-reads history after a `Conflict`).
pub const MAX_DELIVERY_ATTEMPTS: u32 = 64;

/// Lease key prefix for node membership.
pub const NODE_LEASE_PREFIX: &str = "node/";
