//! Eviction of Workers that stopped heartbeating.
//!
//! Deletion is by name and unconditional, so a Worker whose heartbeat lands
//! between the listing and the delete is evicted anyway. Its next heartbeat
//! finds the record gone and registers it again.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use fleet_id::WorkerName;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::ControllerResult;
use crate::store::{StoreError, VersionedStore};

/// Default time after the last heartbeat at which a Worker is considered dead.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(300);

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: Vec<WorkerName>,
    pub failed: Vec<(WorkerName, StoreError)>,
}

/// Deletes Worker records whose last heartbeat is older than the TTL.
///
/// Clusters pointing at an evicted Worker are left alone; the balancer sees
/// them as orphans on its next pass.
pub struct LivenessSweeper {
    store: Arc<dyn VersionedStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LivenessSweeper {
    pub fn new(store: Arc<dyn VersionedStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// Evicts every stale Worker.
    ///
    /// Only a failed listing is an error. Individual delete failures are
    /// collected in the report and retried on the next sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> ControllerResult<SweepReport> {
        let workers = self.store.list_workers().await?;
        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        let cutoff = self.clock.now() - ttl;

        let mut report = SweepReport {
            scanned: workers.len(),
            ..SweepReport::default()
        };

        for worker in workers.iter().filter(|w| w.is_stale(cutoff)) {
            match self.store.delete_worker(&worker.name).await {
                Ok(()) => {
                    info!(
                        worker = %worker.name,
                        last_seen = %worker.last_seen(),
                        clusters = worker.status.clusters.len(),
                        "Evicted stale worker"
                    );
                    report.evicted.push(worker.name.clone());
                }
                Err(e) if e.is_not_found() => {
                    debug!(worker = %worker.name, "Stale worker already gone");
                }
                Err(e) => {
                    warn!(worker = %worker.name, error = %e, "Failed to evict stale worker");
                    report.failed.push((worker.name.clone(), e));
                }
            }
        }

        Ok(report)
    }
}
