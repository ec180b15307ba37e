//! Lock manager: acquire, release, extend, inspect.
//!
//! The manager owns the conflict policy; the store only guarantees that a
//! single mutation of a path is atomic. Nothing is cached between calls, so
//! every decision reflects what is persisted at that moment.
//!
//! Acquire never blocks and never fails on contention. It answers with one
//! of three outcomes:
//!
//! - `Granted`: a new record was written, or this instance already held a
//!   compatible live lock and its intent/expiry were refreshed in place
//! - `Reclaimed`: the path was held by another instance whose lease had
//!   expired; the previous grant is recorded in the audit trail
//! - `Denied`: another live holder is in the way, the path guard was
//!   contended, or the store could not be reached

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use serde_json::json;

use cohort_core::fingerprint::fingerprint_file;
use cohort_core::paths::canonicalize_lock_path;
use cohort_core::{
    conflicts, AuditAction, AuditEvent, Clock, CoordConfig, HolderInfo, InstanceId, LockHolder,
    LockRecord, LockType,
};
use cohort_store::{LockStore, StoreError, WriteOutcome};

use crate::error::CoordError;
use crate::heartbeat::HeartbeatMonitor;
use crate::record_audit;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A live, incompatible lock of another instance.
    Conflict,
    /// Another process was mid-mutation on the same path.
    Contended,
    /// The store could not be read or written. Callers must fail safe.
    StoreUnavailable,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Contended => "contended",
            Self::StoreUnavailable => "store unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Granted {
        record: LockRecord,
        reentered: bool,
    },
    Reclaimed {
        record: LockRecord,
        previous: LockRecord,
    },
    Denied {
        path: PathBuf,
        reason: DenyReason,
        holder: Option<HolderInfo>,
    },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }

    /// The record now held, unless denied.
    pub fn record(&self) -> Option<&LockRecord> {
        match self {
            Self::Granted { record, .. } | Self::Reclaimed { record, .. } => Some(record),
            Self::Denied { .. } => None,
        }
    }

    /// `"allow"` or `"deny"`, the shape adapters emit.
    pub fn decision(&self) -> &'static str {
        if self.is_granted() {
            "allow"
        } else {
            "deny"
        }
    }

    /// One line a human can act on.
    pub fn message(&self) -> String {
        match self {
            Self::Granted {
                record,
                reentered: false,
            } => format!(
                "{} lock granted on {} until {}",
                record.lock_type,
                record.file_path.display(),
                record.expires_at.to_rfc3339()
            ),
            Self::Granted {
                record,
                reentered: true,
            } => format!(
                "{} lock on {} already held, refreshed until {}",
                record.lock_type,
                record.file_path.display(),
                record.expires_at.to_rfc3339()
            ),
            Self::Reclaimed { record, previous } => format!(
                "{} lock granted on {}; reclaimed from {} (expired {})",
                record.lock_type,
                record.file_path.display(),
                previous.holder(),
                previous.expires_at.to_rfc3339()
            ),
            Self::Denied {
                path,
                holder: Some(holder),
                ..
            } => format!("{} is locked: {holder}", path.display()),
            Self::Denied { path, reason, .. } => {
                format!("cannot lock {}: {}", path.display(), reason.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Records removed. `modified` compares the file against the fingerprint
    /// taken at grant time; `None` when no fingerprint was recorded.
    Released {
        records: Vec<LockRecord>,
        modified: Option<bool>,
    },
    /// Nothing of ours was there.
    NotHeld,
    /// Another live instance holds the path; nothing was removed.
    NotHolder { holder: InstanceId },
}

/// Live holders of a path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStatus {
    pub path: PathBuf,
    pub locked: bool,
    pub holders: Vec<HolderInfo>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    config: CoordConfig,
    monitor: HeartbeatMonitor,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        config: CoordConfig,
        monitor: HeartbeatMonitor,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            monitor,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    pub fn canonical(&self, path: &Path) -> Result<PathBuf, CoordError> {
        Ok(canonicalize_lock_path(&self.config.root, path)?)
    }

    /// Lease for a request: the default when unspecified, clamped to the
    /// configured maximum.
    pub fn resolve_ttl(&self, ttl: Option<Duration>) -> Result<Duration, CoordError> {
        let Some(ttl) = ttl else {
            return Ok(self.config.default_ttl());
        };
        if ttl <= Duration::zero() {
            return Err(CoordError::InvalidTtl {
                secs: ttl.num_seconds(),
            });
        }
        let max = self.config.max_ttl();
        if ttl > max {
            tracing::debug!(requested = ttl.num_seconds(), max = max.num_seconds(), "clamping ttl");
            return Ok(max);
        }
        Ok(ttl)
    }

    // Acquire -------------------------------------------------------------

    /// Try to take a `lock_type` lock on `path` for `holder`.
    ///
    /// Errors only for an unusable path or TTL. After deciding, a bounded
    /// sweep runs if none ran within the sweep interval.
    pub fn acquire(
        &self,
        holder: &LockHolder,
        path: &Path,
        lock_type: LockType,
        ttl: Option<Duration>,
        intent: &str,
    ) -> Result<AcquireOutcome, CoordError> {
        let path = self.canonical(path)?;
        let ttl = self.resolve_ttl(ttl)?;
        let outcome = self.decide(holder, &path, lock_type, ttl, intent, self.now());

        if let Err(e) = self.monitor.maybe_sweep() {
            tracing::warn!(error = %e, "opportunistic sweep failed");
        }
        Ok(outcome)
    }

    fn decide(
        &self,
        holder: &LockHolder,
        path: &Path,
        lock_type: LockType,
        ttl: Duration,
        intent: &str,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let existing = match self.store.read_all(path) {
            Ok(records) => records,
            Err(e) => return self.denied_by_store(path, &e),
        };

        // Re-entry: a live lock of ours that already covers the request.
        let covering = existing.iter().find(|r| {
            r.is_held_by(&holder.instance_id)
                && r.is_live(now)
                && (r.lock_type == lock_type || r.lock_type == LockType::ExclusiveWrite)
        });
        if let Some(mine) = covering {
            let mut refreshed = mine.clone();
            refreshed.intent = intent.to_string();
            refreshed.expires_at = (now + ttl).trunc_subsecs(3);
            return match self.store.write(&refreshed, now) {
                Ok(WriteOutcome::Written { .. }) => {
                    tracing::debug!(path = %path.display(), instance = %holder.instance_id, "re-entered lock");
                    self.audit_lock(
                        &refreshed,
                        AuditAction::Reentered,
                        json!({ "intent": refreshed.intent, "expires_at": refreshed.expires_at }),
                        now,
                    );
                    AcquireOutcome::Granted {
                        record: refreshed,
                        reentered: true,
                    }
                }
                Ok(WriteOutcome::Conflict { holder: other }) => self.denied(path, &holder.instance_id, other, now),
                Err(e) => self.denied_by_store(path, &e),
            };
        }

        let mut record = LockRecord::new(
            path.to_path_buf(),
            lock_type,
            holder.clone(),
            now,
            ttl,
            intent,
        );
        if lock_type == LockType::ExclusiveWrite {
            record.file_hash = match fingerprint_file(path, self.config.fingerprint_max_bytes) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not fingerprint file");
                    None
                }
            };
        }

        match self.store.write(&record, now) {
            Ok(WriteOutcome::Written { replaced }) => self.granted(record, replaced, now),
            Ok(WriteOutcome::Conflict { holder: other }) => {
                self.denied(path, &holder.instance_id, other, now)
            }
            Err(e) => self.denied_by_store(path, &e),
        }
    }

    fn granted(
        &self,
        record: LockRecord,
        replaced: Vec<LockRecord>,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let mode = self.config.read_locks;
        let mut previous = None;
        for old in replaced {
            if previous.is_none() && conflicts(old.lock_type, record.lock_type, mode) {
                previous = Some(old);
                continue;
            }
            self.audit_lock(
                &old,
                AuditAction::Purged,
                json!({ "lock_type": old.lock_type, "expired_at": old.expires_at, "reason": "expired" }),
                now,
            );
        }

        match previous {
            Some(previous) => {
                tracing::info!(
                    path = %record.file_path.display(),
                    instance = %record.holder(),
                    previous = %previous.holder(),
                    "reclaimed expired lock"
                );
                self.audit_lock(
                    &record,
                    AuditAction::Reclaimed,
                    json!({
                        "lock_type": record.lock_type,
                        "intent": record.intent,
                        "previous_holder": previous.holder(),
                        "previous_pid": previous.locked_by.pid,
                        "previous_intent": previous.intent,
                        "previous_expired_at": previous.expires_at,
                        "reason": format!("reclaimed from {} (expired)", previous.holder()),
                    }),
                    now,
                );
                AcquireOutcome::Reclaimed { record, previous }
            }
            None => {
                tracing::debug!(
                    path = %record.file_path.display(),
                    instance = %record.holder(),
                    lock_type = %record.lock_type,
                    "lock granted"
                );
                self.audit_lock(
                    &record,
                    AuditAction::Acquired,
                    json!({
                        "lock_type": record.lock_type,
                        "intent": record.intent,
                        "expires_at": record.expires_at,
                    }),
                    now,
                );
                AcquireOutcome::Granted {
                    record,
                    reentered: false,
                }
            }
        }
    }

    fn denied(
        &self,
        path: &Path,
        requester: &InstanceId,
        holder: LockRecord,
        now: DateTime<Utc>,
    ) -> AcquireOutcome {
        let info = holder.holder_info();
        tracing::debug!(path = %path.display(), instance = %requester, holder = %info.instance_id, "lock denied");
        record_audit(
            self.store.as_ref(),
            AuditEvent::for_lock(
                requester.clone(),
                AuditAction::Denied,
                path,
                json!({
                    "holder": info.instance_id,
                    "holder_lock_type": info.lock_type,
                    "holder_intent": info.intent,
                }),
                now,
            ),
        );
        AcquireOutcome::Denied {
            path: path.to_path_buf(),
            reason: DenyReason::Conflict,
            holder: Some(info),
        }
    }

    pub(crate) fn denied_by_store(&self, path: &Path, err: &StoreError) -> AcquireOutcome {
        let reason = match err {
            StoreError::Contended { .. } => {
                tracing::debug!(path = %path.display(), "path guard contended");
                DenyReason::Contended
            }
            _ => {
                tracing::error!(path = %path.display(), error = %err, "lock store unavailable");
                DenyReason::StoreUnavailable
            }
        };
        AcquireOutcome::Denied {
            path: path.to_path_buf(),
            reason,
            holder: None,
        }
    }

    // Release / extend ----------------------------------------------------

    /// Remove every record `instance_id` holds on `path`. Safe to repeat and
    /// safe on paths that were never locked.
    pub fn release(&self, instance_id: &InstanceId, path: &Path) -> Result<ReleaseOutcome, CoordError> {
        let path = self.canonical(path)?;
        let now = self.now();
        let removed = match self.store.delete(&path, instance_id, now) {
            Ok(removed) => removed,
            Err(StoreError::NotHolder { holder, .. }) => {
                tracing::warn!(
                    path = %path.display(),
                    instance = %instance_id,
                    holder = %holder,
                    "release by non-holder ignored"
                );
                return Ok(ReleaseOutcome::NotHolder { holder });
            }
            Err(e) => return Err(e.into()),
        };
        if removed.is_empty() {
            tracing::debug!(path = %path.display(), instance = %instance_id, "nothing to release");
            return Ok(ReleaseOutcome::NotHeld);
        }

        let modified = self.content_changed(&removed);
        for record in &removed {
            self.audit_lock(
                record,
                AuditAction::Released,
                json!({ "lock_type": record.lock_type, "modified": modified }),
                now,
            );
        }
        tracing::debug!(path = %path.display(), instance = %instance_id, "lock released");
        Ok(ReleaseOutcome::Released {
            records: removed,
            modified,
        })
    }

    fn content_changed(&self, removed: &[LockRecord]) -> Option<bool> {
        let record = removed.iter().find(|r| r.file_hash.is_some())?;
        match fingerprint_file(&record.file_path, self.config.fingerprint_max_bytes) {
            Ok(now) => Some(now != record.file_hash),
            Err(e) => {
                tracing::warn!(path = %record.file_path.display(), error = %e, "could not fingerprint file");
                None
            }
        }
    }

    /// Push the expiry of a live lock held by `instance_id` to `now + ttl`.
    pub fn extend(
        &self,
        instance_id: &InstanceId,
        path: &Path,
        ttl: Option<Duration>,
    ) -> Result<LockRecord, CoordError> {
        let path = self.canonical(path)?;
        let ttl = self.resolve_ttl(ttl)?;
        let now = self.now();
        let records = self.store.read_all(&path)?;

        let Some(mine) = records
            .iter()
            .find(|r| r.is_held_by(instance_id) && r.is_live(now))
        else {
            if let Some(other) = records
                .iter()
                .find(|r| r.lock_type == LockType::ExclusiveWrite && r.is_live(now))
            {
                return Err(CoordError::NotHolder {
                    path,
                    holder: other.holder().clone(),
                });
            }
            return Err(CoordError::NotHeld { path });
        };

        let mut extended = mine.clone();
        extended.expires_at = (now + ttl).trunc_subsecs(3);
        extended.extensions += 1;
        match self.store.write(&extended, now)? {
            WriteOutcome::Written { .. } => {
                self.audit_lock(
                    &extended,
                    AuditAction::Extended,
                    json!({ "expires_at": extended.expires_at, "extensions": extended.extensions }),
                    now,
                );
                Ok(extended)
            }
            WriteOutcome::Conflict { holder } => Err(CoordError::Conflict {
                path,
                holder: holder.holder_info(),
            }),
        }
    }

    /// Release everything `instance_id` holds. Used on deregistration.
    pub fn release_all(&self, instance_id: &InstanceId) -> Result<Vec<LockRecord>, CoordError> {
        let now = self.now();
        let mut paths: Vec<PathBuf> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| r.is_held_by(instance_id))
            .map(|r| r.file_path)
            .collect();
        paths.dedup();

        let mut released = Vec::new();
        for path in paths {
            for record in self.store.delete(&path, instance_id, now)? {
                self.audit_lock(
                    &record,
                    AuditAction::Released,
                    json!({ "lock_type": record.lock_type, "reason": "deregistered" }),
                    now,
                );
                released.push(record);
            }
        }
        Ok(released)
    }

    // Queries ---------------------------------------------------------------

    /// The stored record of `path` (exclusive first), live or expired.
    pub fn inspect(&self, path: &Path) -> Result<Option<LockRecord>, CoordError> {
        let path = self.canonical(path)?;
        Ok(self.store.read_all(&path)?.into_iter().next())
    }

    pub fn is_locked(&self, path: &Path) -> Result<LockStatus, CoordError> {
        let path = self.canonical(path)?;
        let now = self.now();
        let holders: Vec<HolderInfo> = self
            .store
            .read_all(&path)?
            .iter()
            .filter(|r| r.is_live(now))
            .map(LockRecord::holder_info)
            .collect();
        Ok(LockStatus {
            path,
            locked: !holders.is_empty(),
            holders,
        })
    }

    pub fn list_locks(&self, include_expired: bool) -> Result<Vec<LockRecord>, CoordError> {
        let now = self.now();
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|r| include_expired || r.is_live(now))
            .collect())
    }

    fn audit_lock(
        &self,
        record: &LockRecord,
        action: AuditAction,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        record_audit(
            self.store.as_ref(),
            AuditEvent::for_lock(record.holder().clone(), action, &record.file_path, details, now),
        );
    }
}
