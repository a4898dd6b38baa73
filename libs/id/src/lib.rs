//! # fleet-id
//!
//! Identifier types shared by the fleet controller.
//!
//! ## ID Kinds
//!
//! - `ClusterId` / `WorkerUid`: system-generated, `{prefix}_{ulid}` format
//!   (e.g. `cls_01HV4Z2WQXKJNM8GPQY6VBKC3D`), strictly parsed.
//! - `WorkerName`: the operator-visible worker identity. Usually the pod name
//!   the process runs under; when none is supplied, a random 4-letter name.
//! - `ResourceVersion`: the monotonic version token a store attaches to every
//!   record for optimistic concurrency.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
