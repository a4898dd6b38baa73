//! Record store interfaces consumed by the controller.
//!
//! The transport behind these traits (HTTP, CRDs, a database) is not part of
//! the controller. What the controller relies on:
//!
//! - Every record carries a [`ResourceVersion`]; `update_*` calls succeed only
//!   if the version on the submitted record is still the stored one, and the
//!   stored copy comes back with a new, larger version.
//! - `list_*` calls return a point-in-time snapshot. Staleness between a
//!   snapshot and a write is caught by the version check, not by the listing.
//!
//! [`MemoryStore`] implements both traits in process.

mod memory;

use async_trait::async_trait;
use fleet_id::{ClusterId, ResourceVersion, WorkerName};
use fleet_reconcile::RetryableError;
use thiserror::Error;

use crate::model::{Cluster, LeaseRecord, Worker};

pub use memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// A record with the same key already exists.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The record changed since it was read (optimistic concurrency).
    #[error("{kind} '{key}' version conflict: expected {expected}, stored {actual}")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Returns true if the record is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a record with the same key already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl RetryableError for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

/// Worker and Cluster record access.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn list_workers(&self) -> StoreResult<Vec<Worker>>;

    async fn get_worker(&self, name: &WorkerName) -> StoreResult<Worker>;

    /// Creates a worker record. Fails with `AlreadyExists` if the name is taken.
    async fn create_worker(&self, worker: Worker) -> StoreResult<Worker>;

    /// Writes the worker's status, conditioned on `worker.version`.
    async fn update_worker_status(&self, worker: Worker) -> StoreResult<Worker>;

    async fn delete_worker(&self, name: &WorkerName) -> StoreResult<()>;

    async fn list_clusters(&self) -> StoreResult<Vec<Cluster>>;

    async fn get_cluster(&self, id: &ClusterId) -> StoreResult<Cluster>;

    /// Writes the cluster's status, conditioned on `cluster.version`.
    async fn update_cluster_status(&self, cluster: Cluster) -> StoreResult<Cluster>;
}

/// Lease record access for leader election.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get_lease(&self, name: &str) -> StoreResult<LeaseRecord>;

    async fn create_lease(&self, lease: LeaseRecord) -> StoreResult<LeaseRecord>;

    /// Replaces the lease, conditioned on `lease.version`.
    async fn update_lease(&self, lease: LeaseRecord) -> StoreResult<LeaseRecord>;
}
