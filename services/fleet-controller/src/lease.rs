//! Lease-based leader election.
//!
//! Competing controllers race on a single [`LeaseRecord`]. The holder renews
//! it every `retry_period`; if it cannot renew within `renew_deadline` it
//! steps down. Everyone else polls every `retry_period` and takes the lease
//! over once `renew_time + lease_duration` has passed.
//!
//! Mutual exclusion is eventual: a holder that stalls past its lease may
//! briefly overlap with its successor until its next renewal fails. Every
//! master-only write is version-conditioned, so the overlap cannot corrupt
//! assignments.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_id::{ResourceVersion, WorkerName};
use fleet_reconcile::RetryableError;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::model::LeaseRecord;
use crate::shutdown::sleep_or_shutdown;
use crate::store::{LeaseStore, StoreResult};

/// Lease duration written when the holder releases on shutdown.
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Upper bound of the random extra delay between acquisition attempts, as a
/// fraction of `retry_period`.
const ACQUIRE_JITTER: f64 = 0.2;

/// Leader election timing.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    /// Name of the lease record.
    pub name: String,

    /// How long a lease is valid after its last renewal.
    pub lease_duration: Duration,

    /// How long the holder keeps retrying a failed renewal before stepping
    /// down. Must be shorter than `lease_duration`.
    pub renew_deadline: Duration,

    /// Interval between acquisition and renewal attempts.
    pub retry_period: Duration,

    /// Clear the holder on shutdown so a successor need not wait out the
    /// lease.
    pub release_on_cancel: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: "fleet-controller".to_string(),
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
            release_on_cancel: true,
        }
    }
}

/// Notified on leadership changes.
///
/// Callbacks run inline on the election task and must not block.
pub trait LeaderCallbacks: Send + Sync {
    /// This process acquired the lease.
    fn on_started_leading(&self);

    /// This process no longer holds the lease (lost or shutting down).
    fn on_stopped_leading(&self);

    /// A different holder than the last one observed was seen, including
    /// this process.
    fn on_new_leader(&self, identity: &WorkerName);
}

enum RenewOutcome {
    Lost,
    Shutdown,
}

/// Drives acquisition and renewal of one lease for one identity.
pub struct LeaseArbiter {
    store: Arc<dyn LeaseStore>,
    identity: WorkerName,
    config: LeaseConfig,
    clock: Arc<dyn Clock>,
    callbacks: Arc<dyn LeaderCallbacks>,
    observed_holder: Mutex<Option<WorkerName>>,
}

impl LeaseArbiter {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        identity: WorkerName,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
        callbacks: Arc<dyn LeaderCallbacks>,
    ) -> Self {
        Self {
            store,
            identity,
            config,
            clock,
            callbacks,
            observed_holder: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &WorkerName {
        &self.identity
    }

    /// Runs election rounds until shutdown.
    ///
    /// Losing the lease sends the arbiter back to acquisition; it only
    /// returns once shutdown is signalled.
    #[instrument(skip_all, fields(lease = %self.config.name, identity = %self.identity))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting leader election");

        loop {
            if !self.acquire(&mut shutdown).await {
                break;
            }
            self.callbacks.on_started_leading();

            match self.renew(&mut shutdown).await {
                RenewOutcome::Lost => {
                    warn!("Failed to renew lease within deadline");
                    self.callbacks.on_stopped_leading();
                }
                RenewOutcome::Shutdown => {
                    self.callbacks.on_stopped_leading();
                    if self.config.release_on_cancel {
                        self.release().await;
                    }
                    break;
                }
            }
        }

        info!("Leader election stopped");
    }

    /// One acquire-or-renew attempt.
    ///
    /// Returns `Ok(true)` if this identity holds the lease afterwards,
    /// `Ok(false)` if someone else holds a valid lease or won a write race.
    pub async fn try_acquire_or_renew(&self) -> StoreResult<bool> {
        let now = self.clock.now();

        let current = match self.store.get_lease(&self.config.name).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return self.create(now).await,
            Err(e) => return Err(e),
        };
        self.observe(&current);

        if self.held_by_other(&current) && !self.expired(&current, now) {
            return Ok(false);
        }

        let mut next = current.clone();
        if !current.is_held_by(&self.identity) {
            next.acquire_time = Some(now);
            next.leader_transitions = current.leader_transitions.saturating_add(1);
        }
        next.holder = Some(self.identity.clone());
        next.renew_time = Some(now);
        next.lease_duration = self.config.lease_duration;

        match self.store.update_lease(next).await {
            Ok(stored) => {
                self.observe(&stored);
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "Lost lease write race");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Clears the holder if this identity still holds the lease.
    pub async fn release(&self) {
        let current = match self.store.get_lease(&self.config.name).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        if !current.is_held_by(&self.identity) {
            return;
        }

        let released = LeaseRecord {
            holder: None,
            lease_duration: RELEASED_LEASE_DURATION,
            renew_time: Some(self.clock.now()),
            ..current
        };
        match self.store.update_lease(released).await {
            Ok(_) => info!("Released lease"),
            Err(e) => warn!(error = %e, "Failed to release lease"),
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> StoreResult<bool> {
        let record = LeaseRecord {
            name: self.config.name.clone(),
            holder: Some(self.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: 0,
            version: ResourceVersion::INITIAL,
        };
        match self.store.create_lease(record).await {
            Ok(stored) => {
                self.observe(&stored);
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns true once the lease is held; false on shutdown.
    async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Lease acquisition attempt failed"),
            }
            if sleep_or_shutdown(shutdown, self.jittered_retry_period()).await {
                return false;
            }
        }
    }

    async fn renew(&self, shutdown: &mut watch::Receiver<bool>) -> RenewOutcome {
        loop {
            let deadline = Instant::now() + self.config.renew_deadline;

            loop {
                match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                    Ok(Ok(true)) => break,
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Lease renewal attempt failed"),
                    Err(_) => return RenewOutcome::Lost,
                }
                if Instant::now() + self.config.retry_period >= deadline {
                    return RenewOutcome::Lost;
                }
                if sleep_or_shutdown(shutdown, self.config.retry_period).await {
                    return RenewOutcome::Shutdown;
                }
            }

            if sleep_or_shutdown(shutdown, self.config.retry_period).await {
                return RenewOutcome::Shutdown;
            }
        }
    }

    fn observe(&self, record: &LeaseRecord) {
        let mut observed = self
            .observed_holder
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *observed != record.holder {
            *observed = record.holder.clone();
            if let Some(holder) = &record.holder {
                self.callbacks.on_new_leader(holder);
            }
        }
    }

    fn held_by_other(&self, record: &LeaseRecord) -> bool {
        record
            .holder
            .as_ref()
            .is_some_and(|holder| holder != &self.identity)
    }

    fn expired(&self, record: &LeaseRecord, now: DateTime<Utc>) -> bool {
        let duration = TimeDelta::from_std(record.lease_duration).unwrap_or(TimeDelta::MAX);
        match record
            .renew_time
            .and_then(|renewed| renewed.checked_add_signed(duration))
        {
            Some(expires) => expires <= now,
            None => true,
        }
    }

    fn jittered_retry_period(&self) -> Duration {
        let factor = 1.0 + rand::rng().random_range(0.0..ACQUIRE_JITTER);
        self.config.retry_period.mul_f64(factor)
    }
}
