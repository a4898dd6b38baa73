//! Fleet Controller Library
//!
//! Every controller process registers itself as a Worker and heartbeats.
//! One of them, elected through a lease, additionally acts as master: it
//! evicts Workers that stopped heartbeating and assigns every healthy
//! Cluster to exactly one live Worker, favouring the least loaded.
//!
//! ## Architecture
//!
//! ```text
//! ControlLoop
//! ├── SelfRegistration     (heartbeat loop, supervised)
//! ├── LeaseArbiter         (leader election, supervised, flips Role)
//! └── monitor tick         (leader only)
//!     ├── LivenessSweeper     (evict stale Workers)
//!     └── AssignmentBalancer  (bookkeeping, then orphans)
//! ```
//!
//! All state lives in the store behind [`store::VersionedStore`] and
//! [`store::LeaseStore`]; the only in-process shared state is the
//! [`role::Role`].

pub mod balancer;
pub mod clock;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod lease;
pub mod model;
pub mod registration;
pub mod role;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod sweeper;

pub use balancer::{AssignmentBalancer, BalanceReport, Snapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use control_loop::{ControlLoop, CycleReport};
pub use error::{ControllerError, ControllerResult};
pub use lease::{LeaderCallbacks, LeaseArbiter, LeaseConfig};
pub use model::{Cluster, Condition, ConditionType, LeaseRecord, Worker};
pub use registration::SelfRegistration;
pub use role::{Role, RoleHandle};
pub use store::{LeaseStore, MemoryStore, StoreError, VersionedStore};
pub use supervisor::{spawn_supervised, RestartPolicy};
pub use sweeper::{LivenessSweeper, SweepReport};
