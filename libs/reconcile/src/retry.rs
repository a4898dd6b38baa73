//! Bounded retry combinators for versioned-store writes.

use std::future::Future;

use tracing::debug;

use crate::backoff::BackoffPolicy;
use crate::DEFAULT_RETRY_STEPS;

/// Classifies errors for the retry combinators.
pub trait RetryableError {
    /// Returns true if the failed write lost an optimistic-concurrency race.
    fn is_conflict(&self) -> bool;

    /// Returns true if the same call may succeed if repeated.
    ///
    /// Conflicts are always transient; implementors add their own
    /// temporary failures, such as an unreachable store.
    fn is_transient(&self) -> bool {
        self.is_conflict()
    }
}

/// Bounded retry policy for conditional writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub steps: u32,

    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: DEFAULT_RETRY_STEPS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy with `steps` attempts and no delay between them.
    pub fn immediate(steps: u32) -> Self {
        Self {
            steps,
            backoff: BackoffPolicy::immediate(),
        }
    }

    fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.steps.max(1)
    }
}

/// Outcome of [`with_optimistic_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T> {
    /// The mutation changed the record and the write was accepted.
    Updated(T),

    /// The mutation found nothing to change; no write was issued.
    Unchanged(T),
}

impl<T> Mutation<T> {
    /// Returns true if a write was issued and accepted.
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }

    /// Returns the record as last read or written.
    pub fn into_inner(self) -> T {
        match self {
            Self::Updated(t) | Self::Unchanged(t) => t,
        }
    }
}

/// Runs `op` until it succeeds, fails with a permanent error, or the
/// policy's attempts are exhausted.
pub async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.backoff.delay(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store call failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read-modify-write with bounded retry.
///
/// Each attempt calls `get` for a fresh copy of the record, applies `mutate`
/// to it and, if `mutate` reports a change, hands the copy to `put`. `put`
/// must write conditionally on the version carried by the copy and return the
/// stored record. A `mutate` returning `false` ends the call without writing,
/// which is how callers abandon a write once the re-read record shows the
/// change is no longer wanted.
///
/// A transient failure of either the read or the write starts a new attempt
/// from a fresh read.
pub async fn with_optimistic_retry<T, E, G, GFut, M, P, PFut>(
    policy: &RetryPolicy,
    mut get: G,
    mut mutate: M,
    mut put: P,
) -> Result<Mutation<T>, E>
where
    E: RetryableError + std::fmt::Display,
    G: FnMut() -> GFut,
    GFut: Future<Output = Result<T, E>>,
    M: FnMut(&mut T) -> bool,
    P: FnMut(T) -> PFut,
    PFut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match get().await {
            Ok(mut record) => {
                if !mutate(&mut record) {
                    return Ok(Mutation::Unchanged(record));
                }
                put(record).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(stored) => return Ok(Mutation::Updated(stored)),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.backoff.delay(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    conflict = e.is_conflict(),
                    error = %e,
                    "Optimistic write failed, re-reading"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
