//! SQLite-backed lock store with audit log and mailbox.
//!
//! Each exclusive-write slot is one row keyed by `(file_path, '*')`; each
//! shared reader has its own row keyed by `(file_path, instance_id)`. Winning
//! the write slot is decided by a single upsert whose `DO UPDATE` only fires
//! when the current row is expired or already ours, inside a
//! `BEGIN IMMEDIATE` transaction.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text with millisecond
//! precision so string comparison orders them correctly.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use cohort_core::paths;
use cohort_core::{
    blocks, AuditAction, AuditEvent, BackendKind, Heartbeat, HeartbeatStatus, InstanceId,
    LockHolder, LockId, LockRecord, LockType, Message, Priority, BROADCAST, LOCK_SCHEMA_VERSION,
};

use crate::error::StoreError;
use crate::{sort_records, LockStore, Mailbox, StoreSettings, WriteOutcome};

/// `lock_slot` value of the exclusive-write row.
const WRITE_SLOT: &str = "*";
const SWEEP_KEY: &str = "last_sweep";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS file_locks (
    lock_id     TEXT PRIMARY KEY,
    file_path   TEXT NOT NULL,
    lock_slot   TEXT NOT NULL,
    lock_type   TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    pid         INTEGER NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    extensions  INTEGER NOT NULL DEFAULT 0,
    reason      TEXT NOT NULL DEFAULT '',
    file_hash   TEXT,
    UNIQUE (file_path, lock_slot)
);
CREATE INDEX IF NOT EXISTS idx_file_locks_instance ON file_locks(instance_id);
CREATE INDEX IF NOT EXISTS idx_file_locks_expires ON file_locks(expires_at);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    details     TEXT NOT NULL DEFAULT '{}',
    timestamp   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    message_id    TEXT PRIMARY KEY,
    from_instance TEXT NOT NULL,
    to_instance   TEXT NOT NULL,
    message_type  TEXT NOT NULL,
    payload       TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 1,
    expires_at    TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_instance, expires_at);

CREATE TABLE IF NOT EXISTS message_receipts (
    message_id   TEXT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
    instance_id  TEXT NOT NULL,
    delivered_at TEXT NOT NULL,
    PRIMARY KEY (message_id, instance_id)
);

CREATE TABLE IF NOT EXISTS instances (
    instance_id TEXT PRIMARY KEY,
    pid         INTEGER NOT NULL,
    last_ping   TEXT NOT NULL,
    ping_count  INTEGER NOT NULL DEFAULT 0,
    status      TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub struct SqliteLockStore {
    conn: Mutex<Connection>,
    settings: StoreSettings,
    db_path: PathBuf,
}

impl std::fmt::Debug for SqliteLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLockStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord {
            path: PathBuf::from("coordination.db"),
            message: format!("bad timestamp '{s}': {e}"),
        })
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const LOCK_COLUMNS: &str = "lock_id, file_path, lock_type, instance_id, pid, acquired_at, \
                            expires_at, extensions, reason, file_hash";

/// One `file_locks` row as stored. Anything but `lock_id` may be missing or
/// of the wrong type in a damaged database.
struct RawLock {
    lock_id: String,
    file_path: Option<String>,
    lock_type: Option<String>,
    instance_id: Option<String>,
    pid: Option<i64>,
    acquired_at: Option<String>,
    expires_at: Option<String>,
    extensions: Option<i64>,
    reason: Option<String>,
    file_hash: Option<String>,
}

impl RawLock {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            lock_id: row.get(0)?,
            file_path: row.get(1).ok(),
            lock_type: row.get(2).ok(),
            instance_id: row.get(3).ok(),
            pid: row.get(4).ok(),
            acquired_at: row.get(5).ok(),
            expires_at: row.get(6).ok(),
            extensions: row.get(7).ok(),
            reason: row.get(8).ok(),
            file_hash: row.get::<_, Option<String>>(9).ok().flatten(),
        })
    }

    fn to_record(&self) -> Result<LockRecord, StoreError> {
        let file_path = PathBuf::from(self.file_path.as_deref().unwrap_or_default());
        let corrupt = |message: String| StoreError::CorruptRecord {
            path: file_path.clone(),
            message,
        };
        let lock_type = self
            .lock_type
            .as_deref()
            .and_then(LockType::parse)
            .ok_or_else(|| corrupt(format!("bad lock_type {:?}", self.lock_type)))?;
        let instance_id = self
            .instance_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| corrupt("missing instance_id".to_string()))?;
        let pid = self
            .pid
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| corrupt(format!("bad pid {:?}", self.pid)))?;
        let locked_at = parse_dt(self.acquired_at.as_deref().unwrap_or_default())?;
        let expires_at = parse_dt(self.expires_at.as_deref().unwrap_or_default())?;
        Ok(LockRecord {
            schema_version: LOCK_SCHEMA_VERSION.to_string(),
            lock_id: LockId(self.lock_id.clone()),
            file_path: file_path.clone(),
            lock_type,
            locked_by: LockHolder {
                instance_id: InstanceId(instance_id),
                pid,
            },
            locked_at,
            expires_at,
            extensions: self
                .extensions
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or_default(),
            file_hash: self.file_hash.clone(),
            intent: self.reason.clone().unwrap_or_default(),
        })
    }
}

/// Convert rows, warning about and skipping the ones that are not locks.
fn convert_rows(rows: Vec<RawLock>) -> Vec<LockRecord> {
    let mut records: Vec<LockRecord> = rows
        .iter()
        .filter_map(|raw| match raw.to_record() {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, lock_id = %raw.lock_id, "skipping corrupt lock row");
                None
            }
        })
        .collect();
    sort_records(&mut records);
    records
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn slot_of(record: &LockRecord) -> &str {
    match record.lock_type {
        LockType::ExclusiveWrite => WRITE_SLOT,
        LockType::SharedRead => record.locked_by.instance_id.as_str(),
    }
}

fn select_raw(conn: &Connection, path: &str) -> Result<Vec<RawLock>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOCK_COLUMNS} FROM file_locks WHERE file_path = ?1"
    ))?;
    let rows = stmt
        .query_map(params![path], RawLock::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn select_path(conn: &Connection, path: &str) -> Result<Vec<LockRecord>, StoreError> {
    Ok(convert_rows(select_raw(conn, path)?))
}

/// Like [`select_path`], but deletes rows that do not convert. Only called
/// inside a write transaction, so a corrupt row is overwritten by the next
/// mutation of its path instead of pinning the slot.
fn select_path_repairing(conn: &Connection, path: &str) -> Result<Vec<LockRecord>, StoreError> {
    let mut records = Vec::new();
    for raw in select_raw(conn, path)? {
        match raw.to_record() {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(error = %e, lock_id = %raw.lock_id, "removing corrupt lock row");
                conn.execute(
                    "DELETE FROM file_locks WHERE lock_id = ?1",
                    params![raw.lock_id],
                )?;
            }
        }
    }
    sort_records(&mut records);
    Ok(records)
}

fn select_slot(
    conn: &Connection,
    path: &str,
    slot: &str,
) -> Result<Option<LockRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {LOCK_COLUMNS} FROM file_locks WHERE file_path = ?1 AND lock_slot = ?2"),
            params![path, slot],
            RawLock::from_row,
        )
        .optional()?;
    Ok(raw.and_then(|raw| convert_rows(vec![raw]).pop()))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl SqliteLockStore {
    /// Open (or create) `<coordination_dir>/coordination.db`.
    pub fn open(settings: StoreSettings) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&settings.coordination_dir).map_err(|e| StoreError::Unavailable {
            message: format!("cannot create {}: {e}", settings.coordination_dir.display()),
        })?;
        let db_path = paths::database_path(&settings.coordination_dir);
        let conn = Connection::open(&db_path).map_err(|e| StoreError::Unavailable {
            message: format!("cannot open {}: {e}", db_path.display()),
        })?;
        conn.busy_timeout(settings.busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(db = %db_path.display(), "opened sqlite lock store");
        Ok(Self {
            conn: Mutex::new(conn),
            settings,
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Unavailable {
            message: "database connection mutex poisoned".to_string(),
        })
    }
}

impl LockStore for SqliteLockStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn coordination_dir(&self) -> &Path {
        &self.settings.coordination_dir
    }

    fn read(&self, path: &Path) -> Result<Option<LockRecord>, StoreError> {
        let conn = self.conn()?;
        select_slot(&conn, &path_text(path), WRITE_SLOT)
    }

    fn read_all(&self, path: &Path) -> Result<Vec<LockRecord>, StoreError> {
        let conn = self.conn()?;
        select_path(&conn, &path_text(path))
    }

    fn write(&self, record: &LockRecord, now: DateTime<Utc>) -> Result<WriteOutcome, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let path = path_text(&record.file_path);
        let me = &record.locked_by.instance_id;
        let mode = self.settings.read_locks;

        let existing = select_path_repairing(&tx, &path)?;
        for other in &existing {
            if blocks(other, record.lock_type, me, now, mode) {
                let holder = other.clone();
                tx.commit()?;
                return Ok(WriteOutcome::Conflict { holder });
            }
        }

        // Expired rows of other holders outside the slot the upsert replaces.
        let slot = slot_of(record);
        let mut replaced = Vec::new();
        for other in existing.iter().filter(|r| !r.is_held_by(me) && r.is_expired(now)) {
            if slot_of(other) == slot {
                continue;
            }
            tx.execute(
                "DELETE FROM file_locks WHERE lock_id = ?1",
                params![other.lock_id.0],
            )?;
            replaced.push(other.clone());
        }
        let previous_in_slot = existing
            .iter()
            .find(|r| slot_of(r) == slot && !r.is_held_by(me))
            .cloned();

        let changed = tx.execute(
            "INSERT INTO file_locks (lock_id, file_path, lock_slot, lock_type, instance_id, pid,
                                     acquired_at, expires_at, extensions, reason, file_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(file_path, lock_slot) DO UPDATE SET
                lock_id = excluded.lock_id,
                lock_type = excluded.lock_type,
                instance_id = excluded.instance_id,
                pid = excluded.pid,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at,
                extensions = excluded.extensions,
                reason = excluded.reason,
                file_hash = excluded.file_hash
             WHERE file_locks.expires_at <= ?12
                OR file_locks.instance_id = excluded.instance_id",
            params![
                record.lock_id.0,
                path,
                slot,
                record.lock_type.as_str(),
                me.as_str(),
                i64::from(record.locked_by.pid),
                ts(record.locked_at),
                ts(record.expires_at),
                i64::from(record.extensions),
                record.intent,
                record.file_hash,
                ts(now),
            ],
        )?;

        if changed == 0 {
            let holder = select_slot(&tx, &path, slot)?;
            drop(tx);
            return match holder {
                Some(holder) => Ok(WriteOutcome::Conflict { holder }),
                None => Err(StoreError::Contended {
                    path: record.file_path.clone(),
                }),
            };
        }
        if let Some(previous) = previous_in_slot {
            replaced.push(previous);
        }

        if record.lock_type == LockType::ExclusiveWrite {
            // Upgrade: the holder's own read row is superseded.
            tx.execute(
                "DELETE FROM file_locks WHERE file_path = ?1 AND lock_slot = ?2",
                params![path, me.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(WriteOutcome::Written { replaced })
    }

    fn delete(
        &self,
        path: &Path,
        holder: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LockRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let text = path_text(path);

        let existing = select_path_repairing(&tx, &text)?;
        let (mine, others): (Vec<_>, Vec<_>) =
            existing.into_iter().partition(|r| r.is_held_by(holder));

        if mine.is_empty() {
            let blocking = others
                .into_iter()
                .find(|r| r.lock_type == LockType::ExclusiveWrite && r.is_live(now));
            // Keep any corrupt-row repair even though nothing of ours goes.
            tx.commit()?;
            return match blocking {
                Some(other) => Err(StoreError::NotHolder {
                    path: path.to_path_buf(),
                    holder: other.locked_by.instance_id,
                }),
                None => Ok(vec![]),
            };
        }

        tx.execute(
            "DELETE FROM file_locks WHERE file_path = ?1 AND instance_id = ?2",
            params![text, holder.as_str()],
        )?;
        tx.commit()?;
        Ok(mine)
    }

    fn force_delete(&self, record: &LockRecord) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM file_locks WHERE lock_id = ?1 AND file_path = ?2",
            params![record.lock_id.0, path_text(&record.file_path)],
        )?;
        Ok(n > 0)
    }

    fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {LOCK_COLUMNS} FROM file_locks"))?;
        let rows = stmt
            .query_map([], RawLock::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(convert_rows(rows))
    }

    fn put_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO instances (instance_id, pid, last_ping, ping_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(instance_id) DO UPDATE SET
                pid = excluded.pid,
                last_ping = excluded.last_ping,
                ping_count = excluded.ping_count,
                status = excluded.status",
            params![
                heartbeat.instance_id.as_str(),
                i64::from(heartbeat.pid),
                ts(heartbeat.last_ping),
                i64::try_from(heartbeat.ping_count).unwrap_or(i64::MAX),
                heartbeat.status.to_string(),
            ],
        )?;
        Ok(())
    }

    fn get_heartbeat(&self, instance_id: &InstanceId) -> Result<Option<Heartbeat>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT instance_id, pid, last_ping, ping_count, status
                 FROM instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                heartbeat_row,
            )
            .optional()?;
        row.map(raw_heartbeat).transpose()
    }

    fn list_heartbeats(&self) -> Result<Vec<Heartbeat>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT instance_id, pid, last_ping, ping_count, status
             FROM instances ORDER BY instance_id",
        )?;
        let rows = stmt
            .query_map([], heartbeat_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(raw_heartbeat).collect()
    }

    fn remove_heartbeat(&self, instance_id: &InstanceId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM instances WHERE instance_id = ?1",
            params![instance_id.as_str()],
        )?;
        Ok(n > 0)
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (instance_id, action_type, target_type, target_id, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.instance_id.as_str(),
                event.action_type.as_str(),
                event.target_type,
                event.target_id,
                serde_json::to_string(&event.details)?,
                ts(event.timestamp),
            ],
        )?;
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, action_type, target_type, target_id, details, timestamp
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, instance, action, target_type, target_id, details, timestamp) in rows.into_iter().rev() {
            let Some(action_type) = AuditAction::parse(&action) else {
                tracing::warn!(id, action = %action, "skipping audit row with unknown action");
                continue;
            };
            events.push(AuditEvent {
                id: Some(id),
                instance_id: InstanceId(instance),
                action_type,
                target_type,
                target_id,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                timestamp: parse_dt(&timestamp)?,
            });
        }
        Ok(events)
    }

    fn claim_sweep(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value
             WHERE meta.value <= ?3",
            params![SWEEP_KEY, ts(now), ts(now - interval)],
        )?;
        Ok(n > 0)
    }

    fn mailbox(&self) -> Option<&dyn Mailbox> {
        Some(self)
    }
}

type RawHeartbeat = (String, i64, String, i64, String);

fn heartbeat_row(row: &Row<'_>) -> rusqlite::Result<RawHeartbeat> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn raw_heartbeat(raw: RawHeartbeat) -> Result<Heartbeat, StoreError> {
    let (instance_id, pid, last_ping, ping_count, status) = raw;
    Ok(Heartbeat {
        instance_id: InstanceId(instance_id),
        pid: u32::try_from(pid).unwrap_or_default(),
        last_ping: parse_dt(&last_ping)?,
        ping_count: u64::try_from(ping_count).unwrap_or_default(),
        status: if status == "stopping" {
            HeartbeatStatus::Stopping
        } else {
            HeartbeatStatus::Active
        },
    })
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str =
    "m.message_id, m.from_instance, m.to_instance, m.message_type, m.payload, m.priority, \
     m.expires_at, m.created_at";

type RawMessage = (String, String, String, String, String, i64, String, String);

fn message_row(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn raw_message(raw: RawMessage) -> Result<Message, StoreError> {
    let (message_id, from, to, message_type, payload, priority, expires_at, created_at) = raw;
    Ok(Message {
        message_id,
        from_instance: InstanceId(from),
        to_instance: to,
        message_type,
        payload: serde_json::from_str(&payload)?,
        priority: Priority::from_rank(priority),
        expires_at: parse_dt(&expires_at)?,
        created_at: parse_dt(&created_at)?,
    })
}

const UNDELIVERED: &str = "FROM messages m
     WHERE m.expires_at > ?2
       AND (m.to_instance = ?1 OR (m.to_instance = ?3 AND m.from_instance != ?1))
       AND NOT EXISTS (SELECT 1 FROM message_receipts r
                       WHERE r.message_id = m.message_id AND r.instance_id = ?1)";

impl Mailbox for SqliteLockStore {
    fn send(&self, message: &Message) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (message_id, from_instance, to_instance, message_type, payload,
                                   priority, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.message_id,
                message.from_instance.as_str(),
                message.to_instance,
                message.message_type,
                serde_json::to_string(&message.payload)?,
                message.priority.rank(),
                ts(message.expires_at),
                ts(message.created_at),
            ],
        )?;
        Ok(())
    }

    fn drain(
        &self,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} {UNDELIVERED}
                 ORDER BY m.priority DESC, m.created_at ASC, m.message_id ASC"
            ))?;
            let rows = stmt
                .query_map(params![instance_id.as_str(), ts(now), BROADCAST], message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut messages = Vec::with_capacity(raw.len());
        for row in raw {
            let message = raw_message(row)?;
            tx.execute(
                "INSERT OR IGNORE INTO message_receipts (message_id, instance_id, delivered_at)
                 VALUES (?1, ?2, ?3)",
                params![message.message_id, instance_id.as_str(), ts(now)],
            )?;
            messages.push(message);
        }
        tx.commit()?;
        Ok(messages)
    }

    fn pending_count(
        &self,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {UNDELIVERED}"),
            params![instance_id.as_str(), ts(now), BROADCAST],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM messages WHERE expires_at <= ?1",
            params![ts(now)],
        )?;
        Ok(n)
    }
}
