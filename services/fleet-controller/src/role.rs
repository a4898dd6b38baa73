//! Process-wide leadership role.
//!
//! The lease arbiter flips the role from its callbacks; the monitor loop
//! reads it at the top of every tick. Readers may briefly see a stale value.
//! Everything gated on it re-validates against the store, so that is fine.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use fleet_id::WorkerName;
use tracing::info;

use crate::lease::LeaderCallbacks;

/// Whether this process currently holds the master lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Follower = 0,
    Leader = 1,
}

impl Role {
    fn from_u8(value: u8) -> Self {
        if value == Role::Leader as u8 {
            Role::Leader
        } else {
            Role::Follower
        }
    }
}

/// Shared, lock-free view of the current role.
#[derive(Debug, Clone)]
pub struct RoleHandle {
    identity: WorkerName,
    role: Arc<AtomicU8>,
    observed_leader: Arc<RwLock<Option<WorkerName>>>,
}

impl RoleHandle {
    pub fn new(identity: WorkerName) -> Self {
        Self {
            identity,
            role: Arc::new(AtomicU8::new(Role::Follower as u8)),
            observed_leader: Arc::new(RwLock::new(None)),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// The most recent lease holder this process has observed.
    pub fn observed_leader(&self) -> Option<WorkerName> {
        self.observed_leader
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, role: Role) {
        self.role.store(role as u8, Ordering::Release);
    }
}

impl LeaderCallbacks for RoleHandle {
    fn on_started_leading(&self) {
        self.set(Role::Leader);
        *self
            .observed_leader
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(self.identity.clone());
        info!(identity = %self.identity, "Acquired master lease");
    }

    fn on_stopped_leading(&self) {
        self.set(Role::Follower);
        info!(identity = %self.identity, "Master lease lost");
    }

    fn on_new_leader(&self, identity: &WorkerName) {
        *self
            .observed_leader
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(identity.clone());
        if identity != &self.identity {
            info!(leader = %identity, "New master elected");
        }
    }
}
