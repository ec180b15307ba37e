//! File-backed lock store.
//!
//! # Write protocol
//!
//! 1. Take the path guard `locks/<key>.guard` (bounded attempts).
//! 2. Re-read every record of the path.
//! 3. Refuse if a live record of another holder is incompatible.
//! 4. Remove expired records of other holders.
//! 5. Write the new record to `.<name>.<uuid>.tmp` in the same directory.
//! 6. Rename over the slot file (atomic on POSIX).
//! 7. Drop the guard, re-read the slot and confirm the `lock_id`.
//!
//! Unparseable records are logged and treated as absent; the next write of
//! the path removes them.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use cohort_core::paths::{self, encode_lock_key};
use cohort_core::{
    blocks, AuditEvent, BackendKind, Heartbeat, InstanceId, LockRecord, LockType,
};

use crate::error::{io_err, StoreError};
use crate::guard::PathGuard;
use crate::{sort_records, LockStore, StoreSettings, WriteOutcome};

const WRITE_SUFFIX: &str = ".lock.json";
const READ_INFIX: &str = ".read.";
const SWEEP_GUARD: &str = "sweep.guard";

#[derive(Debug)]
pub struct FileLockStore {
    settings: StoreSettings,
}

/// What a slot file turned out to contain.
enum Loaded<T> {
    Missing,
    Corrupt,
    Found(T),
}

#[derive(Debug, Serialize, Deserialize)]
struct SweepMarker {
    last_sweep: DateTime<Utc>,
}

impl FileLockStore {
    /// Open the store, creating the directory layout if needed.
    pub fn open(settings: StoreSettings) -> Result<Self, StoreError> {
        let dir = &settings.coordination_dir;
        for sub in [paths::locks_dir(dir), paths::heartbeats_dir(dir)] {
            fs::create_dir_all(&sub).map_err(|e| StoreError::Unavailable {
                message: format!("cannot create {}: {e}", sub.display()),
            })?;
        }
        tracing::debug!(dir = %dir.display(), "opened file lock store");
        Ok(Self { settings })
    }

    fn dir(&self) -> &Path {
        &self.settings.coordination_dir
    }

    fn guard(&self, key: &str) -> Result<PathGuard, StoreError> {
        PathGuard::acquire(
            &paths::guard_path(self.dir(), key),
            self.settings.guard_attempts,
            self.settings.guard_stale_after,
        )
    }

    fn slot_path(&self, key: &str, record: &LockRecord) -> PathBuf {
        match record.lock_type {
            LockType::ExclusiveWrite => paths::write_lock_path(self.dir(), key),
            LockType::SharedRead => {
                paths::read_lock_path(self.dir(), key, record.locked_by.instance_id.as_str())
            }
        }
    }

    /// Write slot plus every read slot of `key`, with whatever they contain.
    fn load_slots(&self, key: &str) -> Result<Vec<(PathBuf, Loaded<LockRecord>)>, StoreError> {
        let mut slots = Vec::new();
        let write_slot = paths::write_lock_path(self.dir(), key);
        let loaded = load_json(&write_slot)?;
        if !matches!(loaded, Loaded::Missing) {
            slots.push((write_slot, loaded));
        }

        let prefix = format!("{key}{READ_INFIX}");
        for file in list_dir(&paths::locks_dir(self.dir()))? {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                let loaded = load_json(&file)?;
                slots.push((file, loaded));
            }
        }
        Ok(slots)
    }

    fn confirm(&self, slot: &Path, record: &LockRecord) -> Result<Option<LockRecord>, StoreError> {
        match load_json::<LockRecord>(slot)? {
            Loaded::Found(stored) if stored.lock_id == record.lock_id => Ok(None),
            Loaded::Found(stored) => Ok(Some(stored)),
            Loaded::Missing | Loaded::Corrupt => Err(StoreError::Contended {
                path: slot.to_path_buf(),
            }),
        }
    }
}

impl LockStore for FileLockStore {
    fn backend(&self) -> BackendKind {
        BackendKind::File
    }

    fn coordination_dir(&self) -> &Path {
        self.dir()
    }

    fn read(&self, path: &Path) -> Result<Option<LockRecord>, StoreError> {
        let slot = paths::write_lock_path(self.dir(), &encode_lock_key(path));
        match load_json(&slot)? {
            Loaded::Found(record) => Ok(Some(record)),
            Loaded::Missing | Loaded::Corrupt => Ok(None),
        }
    }

    fn read_all(&self, path: &Path) -> Result<Vec<LockRecord>, StoreError> {
        let mut records: Vec<LockRecord> = self
            .load_slots(&encode_lock_key(path))?
            .into_iter()
            .filter_map(|(_, loaded)| match loaded {
                Loaded::Found(r) => Some(r),
                _ => None,
            })
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    fn write(&self, record: &LockRecord, now: DateTime<Utc>) -> Result<WriteOutcome, StoreError> {
        let key = encode_lock_key(&record.file_path);
        let me = &record.locked_by.instance_id;
        let slot = self.slot_path(&key, record);
        let mode = self.settings.read_locks;

        let mut replaced = Vec::new();
        {
            let _guard = self.guard(&key)?;
            let slots = self.load_slots(&key)?;

            // Refuse before touching anything.
            for (_, loaded) in &slots {
                if let Loaded::Found(existing) = loaded {
                    if blocks(existing, record.lock_type, me, now, mode) {
                        return Ok(WriteOutcome::Conflict {
                            holder: existing.clone(),
                        });
                    }
                }
            }

            let mut own_read = None;
            for (file, loaded) in slots {
                match loaded {
                    Loaded::Missing => {}
                    Loaded::Corrupt => {
                        if file != slot {
                            tracing::warn!(file = %file.display(), "removing corrupt lock record");
                            remove_if_exists(&file)?;
                        }
                    }
                    Loaded::Found(existing) if existing.is_held_by(me) => {
                        if existing.lock_type == LockType::SharedRead
                            && record.lock_type == LockType::ExclusiveWrite
                        {
                            own_read = Some(file);
                        }
                    }
                    Loaded::Found(existing) if existing.is_expired(now) => {
                        remove_if_exists(&file)?;
                        replaced.push(existing);
                    }
                    Loaded::Found(_) => {}
                }
            }

            write_json_atomic(&slot, record)?;
            if let Some(file) = own_read {
                remove_if_exists(&file)?;
            }
        }

        if let Some(holder) = self.confirm(&slot, record)? {
            tracing::warn!(
                path = %record.file_path.display(),
                holder = %holder.locked_by.instance_id,
                "lost write race after rename"
            );
            return Ok(WriteOutcome::Conflict { holder });
        }
        Ok(WriteOutcome::Written { replaced })
    }

    fn delete(
        &self,
        path: &Path,
        holder: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LockRecord>, StoreError> {
        let key = encode_lock_key(path);
        let _guard = self.guard(&key)?;

        let mut removed = Vec::new();
        let mut other_writer = None;
        for (file, loaded) in self.load_slots(&key)? {
            let Loaded::Found(existing) = loaded else {
                continue;
            };
            if existing.is_held_by(holder) {
                remove_if_exists(&file)?;
                removed.push(existing);
            } else if existing.lock_type == LockType::ExclusiveWrite && existing.is_live(now) {
                other_writer = Some(existing);
            }
        }

        if removed.is_empty() {
            if let Some(other) = other_writer {
                return Err(StoreError::NotHolder {
                    path: path.to_path_buf(),
                    holder: other.locked_by.instance_id,
                });
            }
        }
        Ok(removed)
    }

    fn force_delete(&self, record: &LockRecord) -> Result<bool, StoreError> {
        let key = encode_lock_key(&record.file_path);
        let slot = self.slot_path(&key, record);
        let _guard = self.guard(&key)?;
        match load_json::<LockRecord>(&slot)? {
            Loaded::Found(stored) if stored.lock_id == record.lock_id => {
                remove_if_exists(&slot)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list(&self) -> Result<Vec<LockRecord>, StoreError> {
        let mut records = Vec::new();
        for file in list_dir(&paths::locks_dir(self.dir()))? {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_record = !name.starts_with('.')
                && (name.ends_with(WRITE_SUFFIX) || (name.contains(READ_INFIX) && name.ends_with(".json")));
            if !is_record {
                continue;
            }
            if let Loaded::Found(record) = load_json::<LockRecord>(&file)? {
                records.push(record);
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    fn put_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        write_json_atomic(
            &paths::heartbeat_path(self.dir(), heartbeat.instance_id.as_str()),
            heartbeat,
        )
    }

    fn get_heartbeat(&self, instance_id: &InstanceId) -> Result<Option<Heartbeat>, StoreError> {
        match load_json(&paths::heartbeat_path(self.dir(), instance_id.as_str()))? {
            Loaded::Found(hb) => Ok(Some(hb)),
            Loaded::Missing | Loaded::Corrupt => Ok(None),
        }
    }

    fn list_heartbeats(&self) -> Result<Vec<Heartbeat>, StoreError> {
        let mut beats = Vec::new();
        for file in list_dir(&paths::heartbeats_dir(self.dir()))? {
            let is_json = file
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"));
            if !is_json {
                continue;
            }
            if let Loaded::Found(hb) = load_json::<Heartbeat>(&file)? {
                beats.push(hb);
            }
        }
        beats.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(beats)
    }

    fn remove_heartbeat(&self, instance_id: &InstanceId) -> Result<bool, StoreError> {
        remove_if_exists(&paths::heartbeat_path(self.dir(), instance_id.as_str()))
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let path = paths::audit_log_path(self.dir());
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| io_err(&path, e))
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let path = paths::audit_log_path(self.dir());
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(&path, e)),
        };
        let events: Vec<AuditEvent> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(ev) => Some(ev),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unreadable audit line");
                    None
                }
            })
            .collect();
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }

    fn claim_sweep(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let guard_path = self.dir().join(SWEEP_GUARD);
        let _guard = match PathGuard::acquire(&guard_path, 1, self.settings.guard_stale_after) {
            Ok(g) => g,
            Err(StoreError::Contended { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let marker_path = paths::sweep_marker_path(self.dir());
        if let Loaded::Found(marker) = load_json::<SweepMarker>(&marker_path)? {
            if now - marker.last_sweep < interval {
                return Ok(false);
            }
        }
        write_json_atomic(&marker_path, &SweepMarker { last_sweep: now })?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(io_err(path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Ok(Loaded::Found(v)),
        Err(e) => {
            let corrupt = StoreError::CorruptRecord {
                path: path.to_path_buf(),
                message: e.to_string(),
            };
            tracing::warn!(error = %corrupt, "treating record as absent");
            Ok(Loaded::Corrupt)
        }
    }
}

/// Serialize `value` next to `target` and rename it into place.
pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let json = serde_json::to_vec_pretty(value)?;
    let written = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&tmp, e));
    }
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(target, e));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(io_err(dir, e)),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    files.sort();
    Ok(files)
}
