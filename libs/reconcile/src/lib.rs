//! Reconciliation loop primitives.
//!
//! Every mutation the fleet controller makes goes to a shared, versioned
//! record store that other processes write to concurrently. This library
//! provides the pieces that make those writes safe:
//!
//! - **Optimistic retry**: read a record, change a copy, write it back
//!   conditioned on the version that was read; on a conflict or a transient
//!   store failure, re-read and retry a bounded number of times
//!   ([`with_optimistic_retry`]).
//! - **Backoff**: exponential delays with jitter between attempts
//!   ([`BackoffPolicy`]).
//!
//! # Invariants
//!
//! - A mutation closure that reports "no change" never causes a write
//! - Only errors classified as transient are retried; anything else is
//!   returned to the caller on the first occurrence
//! - Attempts are bounded by [`RetryPolicy::steps`]

use std::time::Duration;

mod backoff;
mod retry;

pub use backoff::BackoffPolicy;
pub use retry::{
    retry_transient, with_optimistic_retry, Mutation, RetryPolicy, RetryableError,
};

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of attempts for a failed write.
pub const DEFAULT_RETRY_STEPS: u32 = 5;
