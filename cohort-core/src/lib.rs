//! Cohort core library: domain types, configuration, on-disk layout.
//!
//! - [`types`]: instances, lock records, heartbeats, audit events, messages
//! - [`config`]: [`CoordConfig`] and layered loading
//! - [`paths`]: coordination directory layout, lock keys, canonical paths
//! - [`clock`]: injected time source
//! - [`fingerprint`]: content hashes for exclusive grants
//! - [`error`]: [`CoreError`]

pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod paths;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendKind, CoordConfig};
pub use error::CoreError;
pub use types::{
    blocks, conflicts, AuditAction, AuditEvent, Heartbeat, HeartbeatStatus, HolderInfo, Instance,
    InstanceId, InstanceStatus, LockHolder, LockId, LockRecord, LockType, Message, Priority,
    ReadLockMode, BROADCAST, LOCK_SCHEMA_VERSION,
};
