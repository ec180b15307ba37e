//! Instance identity: who am I, and am I a continuation of an earlier run?
//!
//! One identity file per working context lives under
//! `<coordination_dir>/instances/<context>.json`. A context is the explicit
//! session name when one is given, otherwise the owner process id. A file
//! whose recorded pid is still running is re-adopted as-is; anything else
//! (missing, corrupt, stopped, dead pid) yields a freshly minted identity
//! that overwrites the old file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use cohort_core::paths::{identity_path, sanitize_component};
use cohort_core::{Instance, InstanceId, InstanceStatus};
use cohort_store::write_json_atomic;

use crate::error::{io_err, CoordError};

/// Whether a process with `pid` exists on this host.
///
/// Signal-0 probe: `EPERM` means the process exists but belongs to someone
/// else, which still counts as alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_pid_alive(pid: u32) -> bool {
    pid == std::process::id()
}

/// Context key for an identity file.
pub fn context_key(session: Option<&str>, owner_pid: u32) -> String {
    match session.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => sanitize_component(name),
        None => format!("pid-{owner_pid}"),
    }
}

/// Result of [`Identity::register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub instance: Instance,
    /// `true` when an existing live identity was re-adopted.
    pub reused: bool,
}

/// Reads and writes identity files for one coordination directory.
#[derive(Debug, Clone)]
pub struct Identity {
    coordination_dir: PathBuf,
    root: PathBuf,
}

impl Identity {
    pub fn new(coordination_dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            coordination_dir: coordination_dir.into(),
            root: root.into(),
        }
    }

    pub fn path_for(&self, context: &str) -> PathBuf {
        identity_path(&self.coordination_dir, context)
    }

    /// The identity recorded for `context`, if the file exists and parses.
    /// A corrupt file is reported as absent.
    pub fn load(&self, context: &str) -> Result<Option<Instance>, CoordError> {
        let path = self.path_for(context);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::warn!(path = %path.display(), "identity file is not UTF-8, ignoring");
                return Ok(None);
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        match serde_json::from_str::<Instance>(&text) {
            Ok(instance) => Ok(Some(instance)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt identity file, ignoring");
                Ok(None)
            }
        }
    }

    /// Re-adopt the live identity of `context`, or mint and persist a new one.
    pub fn register(
        &self,
        context: &str,
        owner_pid: u32,
        now: DateTime<Utc>,
    ) -> Result<Registration, CoordError> {
        if let Some(existing) = self.load(context)? {
            if existing.status != InstanceStatus::Stopped && is_pid_alive(existing.pid) {
                tracing::debug!(
                    instance = %existing.instance_id,
                    context,
                    "re-adopting live identity"
                );
                return Ok(Registration {
                    instance: existing,
                    reused: true,
                });
            }
        }

        let capabilities = match cohort_detector::detect_capabilities(&self.root) {
            Ok(caps) => caps,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "capability detection failed");
                Default::default()
            }
        };
        let instance = Instance {
            instance_id: InstanceId::generate(),
            pid: owner_pid,
            created_at: now,
            capabilities,
            status: InstanceStatus::Active,
            context: context.to_string(),
            root: self.root.clone(),
        };
        write_json_atomic(&self.path_for(context), &instance)?;
        tracing::info!(instance = %instance.instance_id, context, pid = owner_pid, "registered instance");
        Ok(Registration {
            instance,
            reused: false,
        })
    }

    /// Remove the identity file of `context`. Missing files are fine.
    /// Returns the identity that was recorded, if any.
    pub fn retire(&self, context: &str) -> Result<Option<Instance>, CoordError> {
        let recorded = self.load(context)?;
        let path = self.path_for(context);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path, e)),
        }
        Ok(recorded.map(|mut i| {
            i.status = InstanceStatus::Stopped;
            i
        }))
    }

    pub fn coordination_dir(&self) -> &Path {
        &self.coordination_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Identity) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/api")).unwrap();
        let identity = Identity::new(dir.path().join(".cohort"), dir.path());
        (dir, identity)
    }

    #[test]
    fn own_pid_is_alive_and_zero_is_not() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn context_prefers_session_name() {
        assert_eq!(context_key(Some("review"), 42), "review");
        assert_eq!(context_key(Some("  "), 42), "pid-42");
        assert_eq!(context_key(None, 7), "pid-7");
    }

    #[test]
    fn register_is_idempotent_while_pid_lives() {
        let (_dir, identity) = setup();
        let pid = std::process::id();
        let first = identity.register("s1", pid, Utc::now()).unwrap();
        assert!(!first.reused);
        assert!(first.instance.capabilities.contains("backend"));

        let second = identity.register("s1", pid, Utc::now()).unwrap();
        assert!(second.reused);
        assert_eq!(second.instance.instance_id, first.instance.instance_id);
    }

    #[test]
    fn dead_pid_gets_fresh_identity() {
        let (_dir, identity) = setup();
        let first = identity.register("s1", 999_999_999, Utc::now()).unwrap();
        let second = identity.register("s1", 999_999_999, Utc::now()).unwrap();
        assert!(!second.reused);
        assert_ne!(second.instance.instance_id, first.instance.instance_id);
    }

    #[test]
    fn corrupt_identity_is_overwritten() {
        let (_dir, identity) = setup();
        let path = identity.path_for("s1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0xff, 0xfe, b'{']).unwrap();

        assert!(identity.load("s1").unwrap().is_none());
        let reg = identity.register("s1", std::process::id(), Utc::now()).unwrap();
        assert!(!reg.reused);
        let on_disk = identity.load("s1").unwrap().unwrap();
        assert_eq!(on_disk.instance_id, reg.instance.instance_id);
    }

    #[test]
    fn retire_is_safe_to_repeat() {
        let (_dir, identity) = setup();
        identity.register("s1", std::process::id(), Utc::now()).unwrap();
        let retired = identity.retire("s1").unwrap().unwrap();
        assert_eq!(retired.status, InstanceStatus::Stopped);
        assert!(!identity.path_for("s1").exists());
        assert!(identity.retire("s1").unwrap().is_none());
    }
}
