//! Controller error types.

use fleet_id::ResourceVersion;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors surfaced by the sweeper, balancer and registration.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Operational store failure (outage, exhausted conflict retries, missing
    /// record). Retried on the next cycle.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store broke a guarantee the controller depends on. This is a bug
    /// in the store or the controller, not an operational condition.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl ControllerError {
    /// Returns true for bugs, as opposed to operational errors.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Returns true if the underlying record no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

/// Checks that an accepted write returned the record it was asked to write,
/// at a version newer than the one it was read at.
pub fn ensure_write_advanced(
    kind: &str,
    expected_key: &str,
    stored_key: &str,
    before: ResourceVersion,
    after: ResourceVersion,
) -> ControllerResult<()> {
    if expected_key != stored_key {
        return Err(ControllerError::InvariantViolation(format!(
            "{kind} write for '{expected_key}' returned '{stored_key}'"
        )));
    }
    if after <= before {
        return Err(ControllerError::InvariantViolation(format!(
            "{kind} '{expected_key}' version did not advance on write ({before} -> {after})"
        )));
    }
    Ok(())
}
