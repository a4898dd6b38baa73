//! Identifier definitions for fleet records.

use rand::Rng;

use crate::{define_id, IdError};

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(ClusterId, "cls");
define_id!(WorkerUid, "wrk");

// =============================================================================
// Worker Name
// =============================================================================

/// Maximum worker name length (DNS subdomain limit).
pub const MAX_WORKER_NAME_LEN: usize = 253;

/// Length of generated fallback names.
pub const RANDOM_WORKER_NAME_LEN: usize = 4;

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// The identity a worker registers under.
///
/// Opaque to the controller apart from uniqueness. Restricted to lowercase
/// alphanumerics, `-` and `.` so it can double as a record key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerName(String);

impl WorkerName {
    /// Validates and wraps a worker name.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdError::Empty);
        }
        if name.len() > MAX_WORKER_NAME_LEN {
            return Err(IdError::InvalidName {
                name,
                reason: "longer than 253 characters",
            });
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        {
            return Err(IdError::InvalidName {
                name,
                reason: "only lowercase alphanumerics, '-' and '.' are allowed",
            });
        }
        if name.starts_with(['-', '.']) || name.ends_with(['-', '.']) {
            return Err(IdError::InvalidName {
                name,
                reason: "must start and end with an alphanumeric character",
            });
        }
        Ok(Self(name))
    }

    /// Generates a random lowercase name of [`RANDOM_WORKER_NAME_LEN`] letters.
    ///
    /// Used when the process was not given a stable identity.
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let name = (0..RANDOM_WORKER_NAME_LEN)
            .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
            .collect();
        Self(name)
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WorkerName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkerName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkerName> for String {
    fn from(name: WorkerName) -> Self {
        name.0
    }
}

impl AsRef<str> for WorkerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Resource Version
// =============================================================================

/// Monotonic per-record version used for conditional writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version a record receives when it is first created.
    pub const INITIAL: Self = Self(1);

    /// Creates a version from a raw counter value.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the underlying counter.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the version following this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
