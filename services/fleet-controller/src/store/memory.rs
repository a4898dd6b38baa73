//! In-process store.
//!
//! Backs the binary when no external store is configured and every test in
//! this crate. Enforces the same version rules a real store would, and can
//! inject conflicts and outages to exercise retry paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{ClusterId, ResourceVersion, WorkerName};
use tokio::sync::RwLock;
use tracing::debug;

use super::{LeaseStore, StoreError, StoreResult, VersionedStore};
use crate::model::{Cluster, Condition, ConditionType, LeaseRecord, Worker};

const WORKER: &str = "worker";
const CLUSTER: &str = "cluster";
const LEASE: &str = "lease";

#[derive(Debug, Default)]
struct Records {
    workers: BTreeMap<WorkerName, Worker>,
    clusters: BTreeMap<ClusterId, Cluster>,
    leases: BTreeMap<String, LeaseRecord>,
}

/// In-memory [`VersionedStore`] and [`LeaseStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Records>,

    /// Accepted worker/cluster mutations.
    writes: AtomicU64,

    /// Upcoming status updates to reject with a conflict.
    injected_conflicts: AtomicU32,

    /// Upcoming worker/cluster calls to fail as unavailable.
    injected_outages: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted worker/cluster creates, updates and deletes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Rejects the next `n` worker/cluster status updates with a conflict,
    /// as if another writer got there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` worker/cluster calls as unavailable.
    pub fn inject_unavailable(&self, n: u32) {
        self.injected_outages.store(n, Ordering::SeqCst);
    }

    /// Adds a cluster as the external cluster registry would.
    ///
    /// The (name, location) pair must be unique.
    pub async fn insert_cluster(&self, mut cluster: Cluster) -> StoreResult<Cluster> {
        let mut records = self.records.write().await;
        if records
            .clusters
            .values()
            .any(|c| c.spec.name == cluster.spec.name && c.spec.location == cluster.spec.location)
        {
            return Err(StoreError::AlreadyExists {
                kind: CLUSTER,
                key: format!("{}/{}", cluster.spec.location, cluster.spec.name),
            });
        }
        if records.clusters.contains_key(&cluster.id) {
            return Err(StoreError::AlreadyExists {
                kind: CLUSTER,
                key: cluster.id.to_string(),
            });
        }
        cluster.version = ResourceVersion::INITIAL;
        records.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    /// Removes a cluster out of band.
    pub async fn remove_cluster(&self, id: &ClusterId) -> StoreResult<()> {
        self.records
            .write()
            .await
            .clusters
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(CLUSTER, id))
    }

    /// Sets a cluster's `Healthy` condition, as the health reconciler would.
    pub async fn set_cluster_healthy(
        &self,
        id: &ClusterId,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<Cluster> {
        let mut records = self.records.write().await;
        let cluster = records
            .clusters
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(CLUSTER, id))?;
        let (reason, message) = if healthy {
            ("Reachable", "cluster reachable")
        } else {
            ("Unreachable", "cluster unreachable")
        };
        if cluster
            .status
            .conditions
            .set(Condition::new(ConditionType::Healthy, healthy, reason, message, now))
        {
            cluster.version = cluster.version.next();
        }
        Ok(cluster.clone())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_outage(&self) -> StoreResult<()> {
        if Self::take(&self.injected_outages) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    fn check_version(
        &self,
        kind: &'static str,
        key: impl ToString,
        expected: ResourceVersion,
        actual: ResourceVersion,
    ) -> StoreResult<()> {
        if Self::take(&self.injected_conflicts) || expected != actual {
            return Err(StoreError::Conflict {
                kind,
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        self.check_outage()?;
        Ok(self.records.read().await.workers.values().cloned().collect())
    }

    async fn get_worker(&self, name: &WorkerName) -> StoreResult<Worker> {
        self.check_outage()?;
        self.records
            .read()
            .await
            .workers
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(WORKER, name))
    }

    async fn create_worker(&self, mut worker: Worker) -> StoreResult<Worker> {
        self.check_outage()?;
        let mut records = self.records.write().await;
        if records.workers.contains_key(&worker.name) {
            return Err(StoreError::AlreadyExists {
                kind: WORKER,
                key: worker.name.to_string(),
            });
        }
        worker.version = ResourceVersion::INITIAL;
        records.workers.insert(worker.name.clone(), worker.clone());
        self.record_write();
        debug!(worker = %worker.name, "Worker created");
        Ok(worker)
    }

    async fn update_worker_status(&self, worker: Worker) -> StoreResult<Worker> {
        self.check_outage()?;
        let mut records = self.records.write().await;
        let stored = records
            .workers
            .get_mut(&worker.name)
            .ok_or_else(|| StoreError::not_found(WORKER, &worker.name))?;
        self.check_version(WORKER, &worker.name, worker.version, stored.version)?;

        stored.status = worker.status;
        stored.version = stored.version.next();
        self.record_write();
        Ok(stored.clone())
    }

    async fn delete_worker(&self, name: &WorkerName) -> StoreResult<()> {
        self.check_outage()?;
        let removed = self.records.write().await.workers.remove(name);
        match removed {
            Some(_) => {
                self.record_write();
                Ok(())
            }
            None => Err(StoreError::not_found(WORKER, name)),
        }
    }

    async fn list_clusters(&self) -> StoreResult<Vec<Cluster>> {
        self.check_outage()?;
        Ok(self.records.read().await.clusters.values().cloned().collect())
    }

    async fn get_cluster(&self, id: &ClusterId) -> StoreResult<Cluster> {
        self.check_outage()?;
        self.records
            .read()
            .await
            .clusters
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(CLUSTER, id))
    }

    async fn update_cluster_status(&self, cluster: Cluster) -> StoreResult<Cluster> {
        self.check_outage()?;
        let mut records = self.records.write().await;
        let stored = records
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| StoreError::not_found(CLUSTER, cluster.id))?;
        self.check_version(CLUSTER, cluster.id, cluster.version, stored.version)?;

        stored.status = cluster.status;
        stored.version = stored.version.next();
        self.record_write();
        Ok(stored.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn get_lease(&self, name: &str) -> StoreResult<LeaseRecord> {
        self.records
            .read()
            .await
            .leases
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(LEASE, name))
    }

    async fn create_lease(&self, mut lease: LeaseRecord) -> StoreResult<LeaseRecord> {
        let mut records = self.records.write().await;
        if records.leases.contains_key(&lease.name) {
            return Err(StoreError::AlreadyExists {
                kind: LEASE,
                key: lease.name,
            });
        }
        lease.version = ResourceVersion::INITIAL;
        records.leases.insert(lease.name.clone(), lease.clone());
        Ok(lease)
    }

    async fn update_lease(&self, lease: LeaseRecord) -> StoreResult<LeaseRecord> {
        let mut records = self.records.write().await;
        let stored = records
            .leases
            .get_mut(&lease.name)
            .ok_or_else(|| StoreError::not_found(LEASE, &lease.name))?;
        if stored.version != lease.version {
            return Err(StoreError::Conflict {
                kind: LEASE,
                key: lease.name,
                expected: lease.version,
                actual: stored.version,
            });
        }
        let version = stored.version.next();
        *stored = LeaseRecord { version, ..lease };
        Ok(stored.clone())
    }
}
