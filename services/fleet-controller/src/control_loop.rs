//! Top-level controller loop.
//!
//! Wires registration, leader election, sweeping and balancing together:
//!
//! - the heartbeat loop and the lease arbiter run as supervised tasks on
//!   every process
//! - the monitor tick runs on every process but only does work while this
//!   process holds the lease: sweep stale Workers, then balance Clusters
//!
//! Nothing is propagated out of a cycle; failures are logged and the next
//! tick starts from a fresh snapshot.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::balancer::{AssignmentBalancer, BalanceReport};
use crate::clock::Clock;
use crate::config::Config;
use crate::lease::LeaseArbiter;
use crate::registration::SelfRegistration;
use crate::role::RoleHandle;
use crate::shutdown::wait_for_shutdown;
use crate::store::{LeaseStore, VersionedStore};
use crate::supervisor::{panic_message, spawn_supervised, RestartPolicy};
use crate::sweeper::{LivenessSweeper, SweepReport};

/// What one monitor cycle did. `None` means the step failed outright.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub sweep: Option<SweepReport>,
    pub balance: Option<BalanceReport>,
}

/// The fleet controller.
pub struct ControlLoop {
    config: Config,
    role: RoleHandle,
    registration: SelfRegistration,
    arbiter: Arc<LeaseArbiter>,
    sweeper: LivenessSweeper,
    balancer: AssignmentBalancer,
    restart: RestartPolicy,
}

impl ControlLoop {
    pub fn new(
        config: Config,
        store: Arc<dyn VersionedStore>,
        leases: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let role = RoleHandle::new(config.worker_name.clone());
        let registration = SelfRegistration::new(
            store.clone(),
            config.worker_name.clone(),
            clock.clone(),
            config.retry_policy(),
            config.heartbeat_interval,
        );
        let arbiter = Arc::new(LeaseArbiter::new(
            leases,
            config.worker_name.clone(),
            config.lease_config(),
            clock.clone(),
            Arc::new(role.clone()),
        ));
        let sweeper = LivenessSweeper::new(store.clone(), clock, config.heartbeat_ttl);
        let balancer = AssignmentBalancer::new(store, config.retry_policy());

        Self {
            config,
            role,
            registration,
            arbiter,
            sweeper,
            balancer,
            restart: RestartPolicy::default(),
        }
    }

    /// Overrides how background tasks are restarted.
    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Handle on this process's leadership role.
    pub fn role(&self) -> RoleHandle {
        self.role.clone()
    }

    /// Runs until shutdown, then signals `done` once background tasks have
    /// stopped or the grace period ran out.
    #[instrument(skip_all, fields(worker = %self.config.worker_name))]
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        done: oneshot::Sender<()>,
    ) -> anyhow::Result<()> {
        info!(
            monitor_interval_secs = self.config.monitor_interval.as_secs(),
            "Starting fleet controller"
        );

        if let Err(e) = self.registration.register().await {
            warn!(error = %e, "Initial registration failed; heartbeat will retry");
        }

        let heartbeat = {
            let registration = self.registration.clone();
            let rx = shutdown.clone();
            spawn_supervised("heartbeat", self.restart.clone(), shutdown.clone(), move || {
                let registration = registration.clone();
                let rx = rx.clone();
                async move {
                    registration.run_heartbeat_loop(rx).await;
                    Ok(())
                }
            })
        };

        let election = {
            let arbiter = self.arbiter.clone();
            let rx = shutdown.clone();
            spawn_supervised("leader-election", self.restart.clone(), shutdown.clone(), move || {
                let arbiter = arbiter.clone();
                let rx = rx.clone();
                async move {
                    arbiter.run(rx).await;
                    Ok(())
                }
            })
        };

        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.role.is_leader() {
                        self.run_cycle_guarded().await;
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!(
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Shutting down, waiting for background tasks"
        );
        let tasks = join_all([heartbeat, election]);
        if tokio::time::timeout(self.config.shutdown_grace, tasks).await.is_err() {
            warn!("Background tasks did not stop within the grace period");
        }

        // The heartbeat task may have been between restarts when shutdown
        // fired, in which case its own deregistration never ran.
        if let Err(e) = self.registration.deregister().await {
            warn!(error = %e, "Failed to deregister worker");
        }

        info!("Fleet controller stopped");
        let _ = done.send(());
        Ok(())
    }

    /// One sweep-then-balance pass. Errors are logged, not returned.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.sweeper.sweep().await {
            Ok(sweep) => report.sweep = Some(sweep),
            Err(e) => log_cycle_error("sweep", &e),
        }
        match self.balancer.balance().await {
            Ok(balance) => report.balance = Some(balance),
            Err(e) => log_cycle_error("balance", &e),
        }

        let evicted = report.sweep.as_ref().map_or(0, |s| s.evicted.len());
        let (reassigned, pruned, failed) = report.balance.as_ref().map_or((0, 0, 0), |b| {
            (b.assigned.len(), b.pruned, b.failed.len())
        });
        let failed = failed + report.sweep.as_ref().map_or(0, |s| s.failed.len());
        info!(evicted, reassigned, pruned, failed, "Monitor cycle complete");

        report
    }

    async fn run_cycle_guarded(&self) {
        if let Err(payload) = AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            error!(panic = %panic_message(payload), "Monitor cycle panicked");
        }
    }
}

fn log_cycle_error(step: &str, e: &crate::error::ControllerError) {
    if e.is_fatal() {
        error!(step, error = %e, fatal = true, "Monitor step broke store guarantees");
    } else {
        warn!(step, error = %e, "Monitor step failed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{DateTime, TimeDelta, Utc};
    use fleet_id::{ClusterId, WorkerName};
    use fleet_reconcile::BackoffPolicy;

    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Cluster, Worker};
    use crate::store::{MemoryStore, StoreResult};

    fn config(name: &str) -> Config {
        Config {
            worker_name: WorkerName::new(name).unwrap(),
            log_level: "info".to_string(),
            lease_name: "fleet-controller".to_string(),
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
            release_on_cancel: true,
            heartbeat_interval: Duration::from_secs(120),
            heartbeat_ttl: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            retry_steps: 5,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    /// Delegates to a [`MemoryStore`] but panics on the first Worker update.
    struct PanicsOnFirstHeartbeat {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl VersionedStore for PanicsOnFirstHeartbeat {
        async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
            self.inner.list_workers().await
        }

        async fn get_worker(&self, name: &WorkerName) -> StoreResult<Worker> {
            self.inner.get_worker(name).await
        }

        async fn create_worker(&self, worker: Worker) -> StoreResult<Worker> {
            self.inner.create_worker(worker).await
        }

        async fn update_worker_status(&self, worker: Worker) -> StoreResult<Worker> {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("store client crashed");
            }
            self.inner.update_worker_status(worker).await
        }

        async fn delete_worker(&self, name: &WorkerName) -> StoreResult<()> {
            self.inner.delete_worker(name).await
        }

        async fn list_clusters(&self) -> StoreResult<Vec<Cluster>> {
            self.inner.list_clusters().await
        }

        async fn get_cluster(&self, id: &ClusterId) -> StoreResult<Cluster> {
            self.inner.get_cluster(id).await
        }

        async fn update_cluster_status(&self, cluster: Cluster) -> StoreResult<Cluster> {
            self.inner.update_cluster_status(cluster).await
        }
    }

    #[tokio::test]
    async fn test_cycle_evicts_then_reassigns() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let controller =
            ControlLoop::new(config("w2"), store.clone(), store.clone(), clock.clone());

        store.create_worker(Worker::new(WorkerName::new("w1").unwrap(), t0())).await.unwrap();
        clock.advance(TimeDelta::minutes(6));
        store
            .create_worker(Worker::new(WorkerName::new("w2").unwrap(), clock.now()))
            .await
            .unwrap();

        let mut cluster = store.insert_cluster(Cluster::new("x", "eu")).await.unwrap();
        cluster = store.set_cluster_healthy(&cluster.id, true, t0()).await.unwrap();
        cluster.status.assigned_worker = Some(WorkerName::new("w1").unwrap());
        store.update_cluster_status(cluster.clone()).await.unwrap();

        let report = controller.run_cycle().await;

        assert_eq!(report.sweep.unwrap().evicted.len(), 1);
        let balance = report.balance.unwrap();
        assert_eq!(balance.assigned.len(), 1);
        assert_eq!(balance.assigned[0].1.as_str(), "w2");
    }

    #[tokio::test]
    async fn test_cycle_survives_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let controller = ControlLoop::new(config("w1"), store.clone(), store.clone(), clock);

        store.inject_unavailable(2);
        let report = controller.run_cycle().await;
        assert!(report.sweep.is_none());
        assert!(report.balance.is_none());

        let report = controller.run_cycle().await;
        assert!(report.sweep.is_some());
        assert!(report.balance.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_heartbeat_restart_still_deregisters() {
        let store = Arc::new(PanicsOnFirstHeartbeat {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
        });
        let clock = Arc::new(ManualClock::new(t0()));
        let restart = RestartPolicy {
            max_restarts: 5,
            window: Duration::from_secs(300),
            backoff: BackoffPolicy {
                base: Duration::from_secs(30),
                max: Duration::from_secs(30),
                jitter: 0.0,
            },
        };
        let leases = Arc::new(MemoryStore::new());
        let controller = ControlLoop::new(config("w1"), store.clone(), leases, clock)
            .with_restart_policy(restart);

        let (tx, rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(controller.run(rx, done_tx));

        // The first heartbeat panics and the supervisor waits out its backoff.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.armed.load(Ordering::SeqCst));
        assert!(store.get_worker(&WorkerName::new("w1").unwrap()).await.is_ok());

        tx.send(true).unwrap();
        done_rx.await.unwrap();
        task.await.unwrap().unwrap();

        let err = store.get_worker(&WorkerName::new("w1").unwrap()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
