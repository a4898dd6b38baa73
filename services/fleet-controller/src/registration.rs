//! Worker self-registration and heartbeat.
//!
//! Every controller process, master or not, owns exactly one Worker record.
//! It creates the record at startup, stamps `last_heartbeat` on a fixed
//! interval, and deletes the record on shutdown.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::{ResourceVersion, WorkerName};
use fleet_reconcile::{retry_transient, with_optimistic_retry, Mutation, RetryPolicy};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{ensure_write_advanced, ControllerError, ControllerResult};
use crate::model::{Condition, ConditionType, Worker};
use crate::shutdown::wait_for_shutdown;
use crate::store::VersionedStore;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Owns this process's Worker record.
#[derive(Clone)]
pub struct SelfRegistration {
    store: Arc<dyn VersionedStore>,
    name: WorkerName,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
}

impl SelfRegistration {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        name: WorkerName,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            name,
            clock,
            retry,
            heartbeat_interval,
        }
    }

    pub fn name(&self) -> &WorkerName {
        &self.name
    }

    /// Creates the Worker record.
    ///
    /// A record that already exists under this name is adopted as-is.
    pub async fn register(&self) -> ControllerResult<Worker> {
        let now = self.clock.now();
        let mut worker = Worker::new(self.name.clone(), now);
        worker.status.conditions.set(Condition::new(
            ConditionType::Healthy,
            true,
            "Verified",
            "Worker accepted",
            now,
        ));

        let created =
            retry_transient(&self.retry, || self.store.create_worker(worker.clone())).await;
        match created {
            Ok(created) => {
                info!(worker = %self.name, uid = %created.uid, "Worker registered");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                let existing =
                    retry_transient(&self.retry, || self.store.get_worker(&self.name)).await?;
                info!(worker = %self.name, uid = %existing.uid, "Worker already registered");
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stamps `last_heartbeat = now` on the Worker record.
    ///
    /// Re-creates the record if it has been deleted, e.g. by a sweeper that
    /// judged this process dead during a long pause.
    pub async fn heartbeat(&self) -> ControllerResult<Worker> {
        let now = self.clock.now();
        let mut read_version = ResourceVersion::INITIAL;

        let result = with_optimistic_retry(
            &self.retry,
            || self.store.get_worker(&self.name),
            |worker: &mut Worker| {
                read_version = worker.version;
                worker.status.last_heartbeat = Some(now);
                true
            },
            |worker| self.store.update_worker_status(worker),
        )
        .await;

        match result {
            Ok(Mutation::Updated(stored)) => {
                ensure_write_advanced(
                    "worker",
                    self.name.as_str(),
                    stored.name.as_str(),
                    read_version,
                    stored.version,
                )?;
                Ok(stored)
            }
            Ok(Mutation::Unchanged(worker)) => Ok(worker),
            Err(e) if e.is_not_found() => {
                warn!(worker = %self.name, "Worker record missing, registering again");
                self.register().await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the Worker record. A record that is already gone is fine.
    pub async fn deregister(&self) -> ControllerResult<()> {
        match retry_transient(&self.retry, || self.store.delete_worker(&self.name)).await {
            Ok(()) => {
                info!(worker = %self.name, "Worker deregistered");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(worker = %self.name, "Worker record already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Heartbeats immediately and then every interval until shutdown, then
    /// deregisters once.
    #[instrument(skip_all, fields(worker = %self.name))]
    pub async fn run_heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.heartbeat_interval.as_secs(),
            "Starting heartbeat loop"
        );

        let mut consecutive_failures = 0u32;
        let mut timer = tokio::time::interval(self.heartbeat_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => match self.heartbeat().await {
                    Ok(worker) => {
                        consecutive_failures = 0;
                        debug!(version = %worker.version, "Heartbeat recorded");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        log_heartbeat_failure(&e, consecutive_failures);
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Heartbeat loop shutting down");
        if let Err(e) = self.deregister().await {
            warn!(error = %e, "Failed to deregister worker");
        }
    }
}

fn log_heartbeat_failure(e: &ControllerError, consecutive_failures: u32) {
    if e.is_fatal() {
        error!(error = %e, fatal = true, "Heartbeat write broke store guarantees");
    } else if consecutive_failures <= 3 {
        warn!(error = %e, consecutive_failures, "Heartbeat failed");
    } else {
        error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
    }
}
