//! Coordination directory layout, lock-key encoding and path canonicalization.
//!
//! # Storage layout
//!
//! ```text
//! <coordination_dir>/
//!   config.yaml
//!   locks/<key>.lock.json              (exclusive write record)
//!   locks/<key>.read.<instance>.json   (shared read record, one per holder)
//!   locks/<key>.guard                  (transient per-path guard)
//!   heartbeats/<instance>.json
//!   instances/<context>.json
//!   audit.jsonl  decisions.jsonl  work.jsonl  sweep.json
//!   coordination.db
//!   run/<context>.sock
//! ```
//!
//! # Lock keys
//!
//! A lock key is `b64-` followed by the URL-safe, unpadded base64 of the
//! canonical path bytes, which [`decode_lock_key`] reverses. Keys that would
//! exceed [`MAX_KEY_LEN`] fall back to `sha-` + hex SHA-256 of the same bytes;
//! those cannot be decoded and the record's own `file_path` is authoritative.

use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{io_err, CoreError};

pub const COORDINATION_DIR: &str = ".cohort";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DATABASE_FILE: &str = "coordination.db";
pub const AUDIT_LOG: &str = "audit.jsonl";
pub const DECISIONS_LOG: &str = "decisions.jsonl";
pub const WORK_LOG: &str = "work.jsonl";
pub const SWEEP_MARKER: &str = "sweep.json";

/// Longest key (in bytes) used verbatim in a file name.
pub const MAX_KEY_LEN: usize = 200;

const B64_PREFIX: &str = "b64-";
const SHA_PREFIX: &str = "sha-";

// ---------------------------------------------------------------------------
// 1. Layout helpers
// ---------------------------------------------------------------------------

/// `<root>/.cohort`
pub fn default_coordination_dir(root: &Path) -> PathBuf {
    root.join(COORDINATION_DIR)
}

pub fn config_path(coord: &Path) -> PathBuf {
    coord.join(CONFIG_FILE)
}

pub fn locks_dir(coord: &Path) -> PathBuf {
    coord.join("locks")
}

pub fn heartbeats_dir(coord: &Path) -> PathBuf {
    coord.join("heartbeats")
}

pub fn instances_dir(coord: &Path) -> PathBuf {
    coord.join("instances")
}

pub fn run_dir(coord: &Path) -> PathBuf {
    coord.join("run")
}

pub fn database_path(coord: &Path) -> PathBuf {
    coord.join(DATABASE_FILE)
}

pub fn audit_log_path(coord: &Path) -> PathBuf {
    coord.join(AUDIT_LOG)
}

pub fn decisions_log_path(coord: &Path) -> PathBuf {
    coord.join(DECISIONS_LOG)
}

pub fn work_log_path(coord: &Path) -> PathBuf {
    coord.join(WORK_LOG)
}

pub fn sweep_marker_path(coord: &Path) -> PathBuf {
    coord.join(SWEEP_MARKER)
}

/// `<coord>/heartbeats/<instance>.json`
pub fn heartbeat_path(coord: &Path, instance_id: &str) -> PathBuf {
    heartbeats_dir(coord).join(format!("{instance_id}.json"))
}

/// `<coord>/instances/<context>.json`
pub fn identity_path(coord: &Path, context: &str) -> PathBuf {
    instances_dir(coord).join(format!("{}.json", sanitize_component(context)))
}

/// `<coord>/run/<context>.sock`
pub fn socket_path(coord: &Path, context: &str) -> PathBuf {
    run_dir(coord).join(format!("{}.sock", sanitize_component(context)))
}

/// Exclusive write record for a lock key.
pub fn write_lock_path(coord: &Path, key: &str) -> PathBuf {
    locks_dir(coord).join(format!("{key}.lock.json"))
}

/// Shared read record of `instance_id` for a lock key.
pub fn read_lock_path(coord: &Path, key: &str, instance_id: &str) -> PathBuf {
    locks_dir(coord).join(format!("{key}.read.{}.json", sanitize_component(instance_id)))
}

/// Guard file serializing mutations of one lock key.
pub fn guard_path(coord: &Path, key: &str) -> PathBuf {
    locks_dir(coord).join(format!("{key}.guard"))
}

/// Replace anything that is not `[A-Za-z0-9._-]` so the value is a single
/// safe file-name component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// 2. Lock key encoding
// ---------------------------------------------------------------------------

/// Deterministic file-name-safe key for a canonical path.
pub fn encode_lock_key(path: &Path) -> String {
    let bytes = path_bytes(path);
    let encoded = URL_SAFE_NO_PAD.encode(&bytes);
    if B64_PREFIX.len() + encoded.len() <= MAX_KEY_LEN {
        return format!("{B64_PREFIX}{encoded}");
    }
    let mut h = Sha256::new();
    h.update(&bytes);
    format!("{SHA_PREFIX}{}", hex::encode(h.finalize()))
}

/// Reverse [`encode_lock_key`]. Returns `None` for hashed or malformed keys.
pub fn decode_lock_key(key: &str) -> Option<PathBuf> {
    let encoded = key.strip_prefix(B64_PREFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    Some(path_from_bytes(bytes))
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

// ---------------------------------------------------------------------------
// 3. Canonicalization
// ---------------------------------------------------------------------------

/// Canonical absolute form of `path` for use as a lock identity.
///
/// Relative paths are resolved against `root`. `.` and `..` are folded
/// lexically, then the longest existing ancestor is resolved through the
/// filesystem so symlinked checkouts and worktrees agree on one key. The
/// target itself does not need to exist.
pub fn canonicalize_lock_path(root: &Path, path: &Path) -> Result<PathBuf, CoreError> {
    if path.as_os_str().is_empty() {
        return Err(CoreError::InvalidPath {
            path: path.to_path_buf(),
            reason: "empty path".to_string(),
        });
    }

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized = normalize_lexically(&joined).ok_or_else(|| CoreError::InvalidPath {
        path: path.to_path_buf(),
        reason: "path escapes the filesystem root".to_string(),
    })?;
    if !normalized.is_absolute() {
        return Err(CoreError::InvalidPath {
            path: path.to_path_buf(),
            reason: "root is not absolute".to_string(),
        });
    }

    // Resolve the deepest existing ancestor, then re-append the remainder.
    let mut existing = normalized.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(&existing) {
            Ok(resolved) => {
                let mut out = resolved;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Ok(normalized);
                };
                tail.push(name);
                if !existing.pop() {
                    return Ok(normalized);
                }
            }
            Err(err) => return Err(io_err(&existing, err)),
        }
    }
}

/// Fold `.` and `..` without touching the filesystem. `None` if `..` climbs
/// above the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
