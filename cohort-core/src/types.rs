//! Domain types for the coordination engine.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All persisted types are serializable/deserializable via serde + serde_json.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Version stamped into every persisted lock record.
pub const LOCK_SCHEMA_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A stable, collision-resistant identifier for one running instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Mint a fresh identifier (`inst-` + 32 hex chars).
    pub fn generate() -> Self {
        Self(format!("inst-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Unique identifier of a single grant. A re-entrant acquire keeps the id;
/// a reclaim mints a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub String);

impl LockId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for LockId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Access mode of a lock. Persisted as `"read"` / `"write"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    #[serde(rename = "read")]
    SharedRead,
    #[serde(rename = "write")]
    ExclusiveWrite,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::SharedRead => "read",
            LockType::ExclusiveWrite => "write",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "shared" | "shared_read" => Some(LockType::SharedRead),
            "write" | "exclusive" | "exclusive_write" => Some(LockType::ExclusiveWrite),
            _ => None,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `SharedRead` locks interact with writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadLockMode {
    /// Readers block writers and writers block readers.
    #[default]
    Enforced,
    /// Read records are kept for visibility only.
    Advisory,
}

/// Lifecycle of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Active,
    Stopping,
    Stopped,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Active => write!(f, "active"),
            InstanceStatus::Stopping => write!(f, "stopping"),
            InstanceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Status carried by a heartbeat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    #[default]
    Active,
    Stopping,
}

impl fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeartbeatStatus::Active => write!(f, "active"),
            HeartbeatStatus::Stopping => write!(f, "stopping"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Identity record persisted under `instances/<context>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: InstanceId,
    /// Process whose liveness decides whether this identity may be re-adopted.
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub status: InstanceStatus,
    /// Context key the identity was registered under.
    #[serde(default)]
    pub context: String,
    /// Working directory root the instance coordinates on.
    #[serde(default)]
    pub root: PathBuf,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// `locked_by` block of a lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub instance_id: InstanceId,
    pub pid: u32,
}

/// A single persisted lock grant.
///
/// Records are only ever written whole; a reader never observes a partially
/// updated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub schema_version: String,
    pub lock_id: LockId,
    /// Canonical absolute path of the locked file.
    pub file_path: PathBuf,
    pub lock_type: LockType,
    pub locked_by: LockHolder,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub extensions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub intent: String,
}

impl LockRecord {
    /// Build a fresh grant starting at `now` and lasting `ttl`.
    ///
    /// Timestamps are truncated to milliseconds, the precision every backend
    /// persists.
    pub fn new(
        file_path: PathBuf,
        lock_type: LockType,
        holder: LockHolder,
        now: DateTime<Utc>,
        ttl: Duration,
        intent: impl Into<String>,
    ) -> Self {
        let now = now.trunc_subsecs(3);
        Self {
            schema_version: LOCK_SCHEMA_VERSION.to_string(),
            lock_id: LockId::generate(),
            file_path,
            lock_type,
            locked_by: holder,
            locked_at: now,
            expires_at: (now + ttl).trunc_subsecs(3),
            extensions: 0,
            file_hash: None,
            intent: intent.into(),
        }
    }

    pub fn holder(&self) -> &InstanceId {
        &self.locked_by.instance_id
    }

    pub fn is_held_by(&self, instance: &InstanceId) -> bool {
        &self.locked_by.instance_id == instance
    }

    /// A lock is live strictly before `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_live(now)
    }

    /// Seconds of lease left (zero once expired).
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    pub fn holder_info(&self) -> HolderInfo {
        HolderInfo {
            instance_id: self.locked_by.instance_id.clone(),
            pid: self.locked_by.pid,
            lock_type: self.lock_type,
            acquired_at: self.locked_at,
            expires_at: self.expires_at,
            intent: self.intent.clone(),
        }
    }
}

/// Who holds a lock, in the shape callers show to humans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub instance_id: InstanceId,
    pub pid: u32,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub intent: String,
}

impl fmt::Display for HolderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lock held by {} (pid {}) since {}",
            self.lock_type,
            self.instance_id,
            self.pid,
            self.acquired_at.to_rfc3339()
        )?;
        if !self.intent.is_empty() {
            write!(f, ": {}", self.intent)?;
        }
        Ok(())
    }
}

/// Whether `existing` prevents `requester` from taking a `requested` lock on
/// the same path at `now`.
///
/// Own records and expired records never block. Two exclusive writes always
/// conflict; read/write interaction depends on `mode`.
pub fn blocks(
    existing: &LockRecord,
    requested: LockType,
    requester: &InstanceId,
    now: DateTime<Utc>,
    mode: ReadLockMode,
) -> bool {
    if existing.is_held_by(requester) || existing.is_expired(now) {
        return false;
    }
    conflicts(existing.lock_type, requested, mode)
}

/// Whether two lock types held by different instances are incompatible,
/// ignoring expiry.
pub fn conflicts(held: LockType, requested: LockType, mode: ReadLockMode) -> bool {
    match (held, requested) {
        (LockType::ExclusiveWrite, LockType::ExclusiveWrite) => true,
        (LockType::SharedRead, LockType::SharedRead) => false,
        (LockType::ExclusiveWrite, LockType::SharedRead)
        | (LockType::SharedRead, LockType::ExclusiveWrite) => mode == ReadLockMode::Enforced,
    }
}

// ---------------------------------------------------------------------------
// Heartbeats
// ---------------------------------------------------------------------------

/// Liveness signal written by the owning instance, read-only to everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub instance_id: InstanceId,
    pub pid: u32,
    pub last_ping: DateTime<Utc>,
    #[serde(default)]
    pub ping_count: u64,
    #[serde(default)]
    pub status: HeartbeatStatus,
}

impl Heartbeat {
    /// `now - last_ping <= timeout`.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_ping <= timeout
    }
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Kind of event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Registered,
    Deregistered,
    Acquired,
    Reentered,
    Reclaimed,
    Released,
    Extended,
    Swept,
    Purged,
    Denied,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Registered => "registered",
            AuditAction::Deregistered => "deregistered",
            AuditAction::Acquired => "acquired",
            AuditAction::Reentered => "reentered",
            AuditAction::Reclaimed => "reclaimed",
            AuditAction::Released => "released",
            AuditAction::Extended => "extended",
            AuditAction::Swept => "swept",
            AuditAction::Purged => "purged",
            AuditAction::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "registered" => AuditAction::Registered,
            "deregistered" => AuditAction::Deregistered,
            "acquired" => AuditAction::Acquired,
            "reentered" => AuditAction::Reentered,
            "reclaimed" => AuditAction::Reclaimed,
            "released" => AuditAction::Released,
            "extended" => AuditAction::Extended,
            "swept" => AuditAction::Swept,
            "purged" => AuditAction::Purged,
            "denied" => AuditAction::Denied,
            _ => return None,
        })
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Row id assigned by the relational store; absent in the JSONL trail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub instance_id: InstanceId,
    pub action_type: AuditAction,
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Audit entry about a file lock.
    pub fn for_lock(
        instance_id: InstanceId,
        action: AuditAction,
        file_path: &std::path::Path,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            instance_id,
            action_type: action,
            target_type: "file_lock".to_string(),
            target_id: file_path.display().to_string(),
            details,
            timestamp: now,
        }
    }

    /// Audit entry about an instance lifecycle change.
    pub fn for_instance(
        instance_id: InstanceId,
        action: AuditAction,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let target_id = instance_id.0.clone();
        Self {
            id: None,
            instance_id,
            action_type: action,
            target_type: "instance".to_string(),
            target_id,
            details,
            timestamp: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Recipient wildcard for broadcast messages.
pub const BROADCAST: &str = "*";

/// Delivery priority; higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

/// An inter-instance message with a bounded lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub from_instance: InstanceId,
    /// Recipient instance id, or [`BROADCAST`].
    pub to_instance: String,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_instance == BROADCAST
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
