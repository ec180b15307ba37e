//! Durable lock storage for cohort.
//!
//! [`LockStore`] is the single persistence seam of the engine: lock records,
//! heartbeats, the audit trail and the sweep slot all go through it. Two
//! implementations exist:
//!
//! - [`FileLockStore`]: one JSON document per record under the coordination
//!   directory, mutations serialized by per-path guard files
//! - [`SqliteLockStore`]: an embedded database that additionally offers a
//!   [`Mailbox`]
//!
//! [`open_store`] picks one from a [`CoordConfig`].
//!
//! Stores never cache. Every call re-reads persisted state, so separate
//! processes observe each other's writes on the next call.

pub mod error;
pub mod file;
pub mod guard;
pub mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use cohort_core::{
    AuditEvent, BackendKind, CoordConfig, Heartbeat, InstanceId, LockRecord, LockType, Message,
    ReadLockMode,
};

pub use error::StoreError;
pub use file::{write_json_atomic, FileLockStore};
pub use sqlite::SqliteLockStore;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of [`LockStore::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The record is stored. `replaced` lists expired records of other
    /// holders that were removed to make room.
    Written { replaced: Vec<LockRecord> },
    /// A live, incompatible record of another holder is in the way.
    Conflict { holder: LockRecord },
}

/// Knobs every store needs from the configuration.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub coordination_dir: PathBuf,
    pub read_locks: ReadLockMode,
    pub guard_attempts: u32,
    pub guard_stale_after: std::time::Duration,
    pub busy_timeout: std::time::Duration,
}

impl From<&CoordConfig> for StoreSettings {
    fn from(config: &CoordConfig) -> Self {
        Self {
            coordination_dir: config.coordination_dir.clone(),
            read_locks: config.read_locks,
            guard_attempts: config.guard_attempts,
            guard_stale_after: config.guard_stale_after(),
            busy_timeout: config.db_busy_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Durable mapping from canonical file path to lock records.
///
/// Paths handed to a store are already canonical. Every mutation of a single
/// path is atomic with respect to every other mutation of that path, across
/// processes.
pub trait LockStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn coordination_dir(&self) -> &Path;

    // Locks ---------------------------------------------------------------

    /// The exclusive-write record of `path`, live or expired.
    fn read(&self, path: &Path) -> Result<Option<LockRecord>, StoreError>;

    /// Every record of `path` (write slot first, then readers by holder).
    fn read_all(&self, path: &Path) -> Result<Vec<LockRecord>, StoreError>;

    /// Store `record` unless a live, incompatible record of another holder
    /// exists. Records of the same holder are replaced in place; storing an
    /// exclusive write drops the holder's own read record.
    fn write(&self, record: &LockRecord, now: DateTime<Utc>) -> Result<WriteOutcome, StoreError>;

    /// Remove every record `holder` has on `path`.
    ///
    /// Absent records are a no-op. If the holder has nothing there but a
    /// different live instance holds the write slot, fails with
    /// [`StoreError::NotHolder`]. Expired records of other holders are left
    /// for the sweep.
    fn delete(
        &self,
        path: &Path,
        holder: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LockRecord>, StoreError>;

    /// Remove exactly `record`, only if the stored slot still carries its
    /// `lock_id`. Used by sweeps, which bypass the holder check.
    fn force_delete(&self, record: &LockRecord) -> Result<bool, StoreError>;

    /// All stored records across all paths, sorted by path then type.
    fn list(&self) -> Result<Vec<LockRecord>, StoreError>;

    // Heartbeats ------------------------------------------------------------

    fn put_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError>;

    fn get_heartbeat(&self, instance_id: &InstanceId) -> Result<Option<Heartbeat>, StoreError>;

    fn list_heartbeats(&self) -> Result<Vec<Heartbeat>, StoreError>;

    fn remove_heartbeat(&self, instance_id: &InstanceId) -> Result<bool, StoreError>;

    // Audit trail -----------------------------------------------------------

    fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Up to `limit` most recent events, oldest first.
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError>;

    // Sweep slot ------------------------------------------------------------

    /// Claim the opportunistic sweep if none ran within `interval` of `now`.
    /// At most one caller wins per interval.
    fn claim_sweep(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Result<bool, StoreError>;

    // Mailbox ---------------------------------------------------------------

    fn mailbox(&self) -> Option<&dyn Mailbox> {
        None
    }
}

/// Prioritized, TTL-bound messages between instances.
pub trait Mailbox: Send + Sync {
    fn send(&self, message: &Message) -> Result<(), StoreError>;

    /// Unexpired messages for `instance_id` (direct and broadcast, excluding
    /// its own broadcasts) not yet delivered to it, highest priority first,
    /// then oldest first. Returned messages are marked delivered.
    fn drain(&self, instance_id: &InstanceId, now: DateTime<Utc>)
        -> Result<Vec<Message>, StoreError>;

    /// Undelivered, unexpired message count for `instance_id`.
    fn pending_count(&self, instance_id: &InstanceId, now: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Delete expired messages. Returns how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Open the store selected by `config.backend` (resolving `auto`).
pub fn open_store(config: &CoordConfig) -> Result<Arc<dyn LockStore>, StoreError> {
    let settings = StoreSettings::from(config);
    match config.effective_backend() {
        BackendKind::Sqlite => Ok(Arc::new(SqliteLockStore::open(settings)?)),
        BackendKind::File | BackendKind::Auto => Ok(Arc::new(FileLockStore::open(settings)?)),
    }
}

/// Order records the way `read_all` and `list` promise.
pub(crate) fn sort_records(records: &mut [LockRecord]) {
    records.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then_with(|| type_rank(a.lock_type).cmp(&type_rank(b.lock_type)))
            .then_with(|| a.locked_by.instance_id.cmp(&b.locked_by.instance_id))
    });
}

fn type_rank(t: LockType) -> u8 {
    match t {
        LockType::ExclusiveWrite => 0,
        LockType::SharedRead => 1,
    }
}
