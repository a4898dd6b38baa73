//! Cluster-to-worker assignment.
//!
//! Each pass works from one snapshot of Workers and Clusters and runs two
//! phases:
//!
//! 1. **Bookkeeping.** Make every live Worker's `clusters` set mirror the
//!    Clusters that name it: drop ids of Clusters that are gone or owned by
//!    someone else, add ids of Clusters that name it but are missing.
//! 2. **Orphans.** Hand every healthy Cluster that is unassigned, or names a
//!    Worker that no longer exists, to the least-loaded live Worker.
//!
//! # Invariants
//!
//! - A Cluster's `assigned_worker` is the source of truth; Worker sets are
//!   derived from it
//! - An orphan is claimed on the Cluster record before the Worker record is
//!   touched, conditioned on the version in the snapshot. A concurrent
//!   master's claim shows up as a conflict, and the re-read tells us to skip
//! - A validly assigned Cluster is never moved
//! - A pass over an already-balanced fleet issues no writes
//!
//! Placement is greedy and never rebalances existing assignments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_id::{ClusterId, ResourceVersion, WorkerName};
use fleet_reconcile::{with_optimistic_retry, Mutation, RetryPolicy};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ensure_write_advanced, ControllerError, ControllerResult};
use crate::model::{Cluster, Worker};
use crate::store::{StoreResult, VersionedStore};

/// Point-in-time view of the fleet a balance pass works from.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub workers: Vec<Worker>,
    pub clusters: BTreeMap<ClusterId, Cluster>,
}

impl Snapshot {
    pub fn new(workers: Vec<Worker>, clusters: Vec<Cluster>) -> Self {
        Self {
            workers,
            clusters: clusters.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    fn is_live(&self, name: &WorkerName) -> bool {
        self.workers.iter().any(|w| &w.name == name)
    }
}

/// Changes needed to make a Worker's set mirror the Clusters naming it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookkeepingPlan {
    pub prune: BTreeSet<ClusterId>,
    pub restore: BTreeSet<ClusterId>,
}

impl BookkeepingPlan {
    pub fn is_empty(&self) -> bool {
        self.prune.is_empty() && self.restore.is_empty()
    }

    /// Applies the plan to a set. Returns true if the set changed.
    fn apply(&self, clusters: &mut BTreeSet<ClusterId>) -> bool {
        let mut changed = false;
        for id in &self.prune {
            changed |= clusters.remove(id);
        }
        for id in &self.restore {
            changed |= clusters.insert(*id);
        }
        changed
    }
}

/// Outcome of one balance pass.
#[derive(Debug, Default)]
pub struct BalanceReport {
    /// Stale ids removed from Worker sets.
    pub pruned: usize,

    /// Missing ids added back to Worker sets.
    pub restored: usize,

    /// Orphans claimed this pass.
    pub assigned: Vec<(ClusterId, WorkerName)>,

    /// Orphans another writer claimed or removed first.
    pub skipped: usize,

    /// Orphans left alone because no Worker is alive.
    pub unassignable: usize,

    /// Per-record failures; the rest of the pass went ahead.
    pub failed: Vec<(String, ControllerError)>,

    /// Healthy Clusters per live Worker at the end of the pass.
    pub loads: BTreeMap<WorkerName, usize>,
}

impl BalanceReport {
    fn fail(&mut self, subject: String, e: ControllerError) {
        if e.is_fatal() {
            error!(subject = %subject, error = %e, fatal = true, "Store broke write guarantees");
        } else {
            warn!(subject = %subject, error = %e, "Balance step failed");
        }
        self.failed.push((subject, e));
    }
}

/// Works out, for a Worker, which ids to drop and which to add back.
pub fn plan_bookkeeping(
    worker: &Worker,
    clusters: &BTreeMap<ClusterId, Cluster>,
) -> BookkeepingPlan {
    let prune = worker
        .status
        .clusters
        .iter()
        .filter(|id| !clusters.get(id).is_some_and(|c| c.is_assigned_to(&worker.name)))
        .copied()
        .collect();
    let restore = clusters
        .values()
        .filter(|c| c.is_assigned_to(&worker.name) && !worker.status.clusters.contains(&c.id))
        .map(|c| c.id)
        .collect();
    BookkeepingPlan { prune, restore }
}

/// Healthy Clusters with no live owner, in snapshot order.
pub fn plan_orphans(snapshot: &Snapshot) -> Vec<&Cluster> {
    snapshot
        .clusters
        .values()
        .filter(|c| c.is_healthy())
        .filter(|c| match &c.status.assigned_worker {
            None => true,
            Some(owner) => !snapshot.is_live(owner),
        })
        .collect()
}

/// Healthy Clusters per live Worker, in snapshot Worker order.
pub fn initial_loads(snapshot: &Snapshot) -> Vec<(WorkerName, usize)> {
    snapshot
        .workers
        .iter()
        .map(|w| {
            let load = snapshot
                .clusters
                .values()
                .filter(|c| c.is_healthy() && c.is_assigned_to(&w.name))
                .count();
            (w.name.clone(), load)
        })
        .collect()
}

/// Sorts `loads` ascending (ties keep their order) and returns the index of
/// the least-loaded Worker.
pub fn least_loaded(loads: &mut [(WorkerName, usize)]) -> Option<usize> {
    loads.sort_by_key(|(_, load)| *load);
    if loads.is_empty() {
        None
    } else {
        Some(0)
    }
}

/// Keeps Worker bookkeeping consistent and hands out orphaned Clusters.
pub struct AssignmentBalancer {
    store: Arc<dyn VersionedStore>,
    retry: RetryPolicy,
}

impl AssignmentBalancer {
    pub fn new(store: Arc<dyn VersionedStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Reads the current fleet.
    pub async fn snapshot(&self) -> StoreResult<Snapshot> {
        let workers = self.store.list_workers().await?;
        let clusters = self.store.list_clusters().await?;
        Ok(Snapshot::new(workers, clusters))
    }

    /// Runs one pass against a fresh snapshot.
    pub async fn balance(&self) -> ControllerResult<BalanceReport> {
        let snapshot = self.snapshot().await?;
        Ok(self.balance_snapshot(snapshot).await)
    }

    /// Runs one pass against `snapshot`, which may already be stale.
    #[instrument(
        skip_all,
        fields(workers = snapshot.workers.len(), clusters = snapshot.clusters.len())
    )]
    pub async fn balance_snapshot(&self, snapshot: Snapshot) -> BalanceReport {
        let mut report = BalanceReport::default();

        for worker in &snapshot.workers {
            let plan = plan_bookkeeping(worker, &snapshot.clusters);
            if plan.is_empty() {
                continue;
            }
            match self.apply_bookkeeping(worker, &plan).await {
                Ok(true) => {
                    debug!(
                        worker = %worker.name,
                        pruned = plan.prune.len(),
                        restored = plan.restore.len(),
                        "Worker bookkeeping reconciled"
                    );
                    report.pruned += plan.prune.len();
                    report.restored += plan.restore.len();
                }
                Ok(false) => {}
                Err(e) if e.is_not_found() => {
                    debug!(worker = %worker.name, "Worker gone before bookkeeping write");
                }
                Err(e) => report.fail(format!("worker/{}", worker.name), e),
            }
        }

        let mut loads = initial_loads(&snapshot);
        for orphan in plan_orphans(&snapshot) {
            let Some(index) = least_loaded(&mut loads) else {
                report.unassignable += 1;
                continue;
            };
            let target = loads[index].0.clone();

            match self.claim(orphan, &target).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(cluster = %orphan.id, "Orphan claimed elsewhere, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(e) if e.is_not_found() => {
                    debug!(cluster = %orphan.id, "Orphan removed before claim");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.fail(format!("cluster/{}", orphan.id), e);
                    continue;
                }
            }

            loads[index].1 += 1;
            info!(cluster = %orphan.id, worker = %target, "Assigned orphaned cluster");
            report.assigned.push((orphan.id, target.clone()));

            match self.append(&target, orphan.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!(
                    cluster = %orphan.id,
                    worker = %target,
                    "Worker vanished after claim; cluster will be reassigned"
                ),
                Err(e) => report.fail(format!("worker/{target}"), e),
            }
        }

        if report.unassignable > 0 {
            warn!(orphans = report.unassignable, "No live workers to assign clusters to");
        }
        report.loads = loads.into_iter().collect();
        report
    }

    async fn apply_bookkeeping(
        &self,
        worker: &Worker,
        plan: &BookkeepingPlan,
    ) -> ControllerResult<bool> {
        let store = &self.store;
        let mut seed = Some(worker.clone());
        let mut read_version = ResourceVersion::INITIAL;

        let result = with_optimistic_retry(
            &self.retry,
            || {
                let seed = seed.take();
                async move {
                    match seed {
                        Some(worker) => Ok(worker),
                        None => store.get_worker(&worker.name).await,
                    }
                }
            },
            |w: &mut Worker| {
                read_version = w.version;
                plan.apply(&mut w.status.clusters)
            },
            |w| store.update_worker_status(w),
        )
        .await?;

        match result {
            Mutation::Updated(stored) => {
                ensure_write_advanced(
                    "worker",
                    worker.name.as_str(),
                    stored.name.as_str(),
                    read_version,
                    stored.version,
                )?;
                Ok(true)
            }
            Mutation::Unchanged(_) => Ok(false),
        }
    }

    /// Points `orphan` at `target`, conditioned on the snapshot version.
    ///
    /// Returns false if a re-read shows the Cluster is no longer the orphan
    /// the snapshot saw.
    async fn claim(&self, orphan: &Cluster, target: &WorkerName) -> ControllerResult<bool> {
        let store = &self.store;
        let expected = orphan.status.assigned_worker.clone();
        let mut seed = Some(orphan.clone());
        let mut read_version = ResourceVersion::INITIAL;

        let result = with_optimistic_retry(
            &self.retry,
            || {
                let seed = seed.take();
                async move {
                    match seed {
                        Some(cluster) => Ok(cluster),
                        None => store.get_cluster(&orphan.id).await,
                    }
                }
            },
            |c: &mut Cluster| {
                if c.status.assigned_worker != expected || !c.is_healthy() {
                    return false;
                }
                read_version = c.version;
                c.status.assigned_worker = Some(target.clone());
                true
            },
            |c| store.update_cluster_status(c),
        )
        .await?;

        match result {
            Mutation::Updated(stored) => {
                ensure_write_advanced(
                    "cluster",
                    &orphan.id.to_string(),
                    &stored.id.to_string(),
                    read_version,
                    stored.version,
                )?;
                Ok(true)
            }
            Mutation::Unchanged(_) => Ok(false),
        }
    }

    /// Adds `cluster` to `worker`'s set.
    async fn append(&self, worker: &WorkerName, cluster: ClusterId) -> ControllerResult<()> {
        let mut read_version = ResourceVersion::INITIAL;

        let result = with_optimistic_retry(
            &self.retry,
            || self.store.get_worker(worker),
            |w: &mut Worker| {
                read_version = w.version;
                w.status.clusters.insert(cluster)
            },
            |w| self.store.update_worker_status(w),
        )
        .await?;

        if let Mutation::Updated(stored) = result {
            ensure_write_advanced(
                "worker",
                worker.as_str(),
                stored.name.as_str(),
                read_version,
                stored.version,
            )?;
        }
        Ok(())
    }
}
