//! Coordination configuration.
//!
//! # Resolution order
//!
//! 1. built-in defaults
//! 2. user file `~/.cohort/config.yaml`
//! 3. project file `<root>/.cohort/config.yaml`
//! 4. environment (`COHORT_DIR`, `COHORT_BACKEND`,
//!    `COHORT_LIVENESS_TIMEOUT_SECS`, `COHORT_DEFAULT_TTL_SECS`)
//!
//! Every layer is a partial overlay: keys missing from a file keep the value
//! of the layer below.
//!
//! # API pattern
//!
//! - `load_at(home, root, env)`: explicit home and environment; used in tests
//! - `load(root)`: derives home from `dirs::home_dir()` and reads the process
//!   environment, delegates to `load_at`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::paths;
use crate::types::ReadLockMode;

pub const ENV_DIR: &str = "COHORT_DIR";
pub const ENV_BACKEND: &str = "COHORT_BACKEND";
pub const ENV_LIVENESS_TIMEOUT: &str = "COHORT_LIVENESS_TIMEOUT_SECS";
pub const ENV_DEFAULT_TTL: &str = "COHORT_DEFAULT_TTL_SECS";

const MIB: u64 = 1024 * 1024;

/// Which lock store implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Sqlite,
    /// SQLite when `coordination.db` already exists, files otherwise.
    #[default]
    Auto,
}

impl BackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Some(BackendKind::File),
            "sqlite" | "db" => Some(BackendKind::Sqlite),
            "auto" => Some(BackendKind::Auto),
            _ => None,
        }
    }
}

/// Fully resolved settings for one coordination root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordConfig {
    /// Working tree the coordinated instances operate on.
    pub root: PathBuf,
    pub coordination_dir: PathBuf,
    pub backend: BackendKind,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub liveness_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_limit: usize,
    pub read_locks: ReadLockMode,
    pub guard_stale_after_ms: u64,
    pub guard_attempts: u32,
    pub db_busy_timeout_ms: u64,
    pub fingerprint_max_bytes: u64,
    pub journal_lock_ttl_secs: u64,
    pub message_ttl_secs: u64,
    pub audit_rotate_bytes: u64,
}

/// One config file. All keys optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigOverlay {
    coordination_dir: Option<PathBuf>,
    backend: Option<BackendKind>,
    default_ttl_secs: Option<u64>,
    max_ttl_secs: Option<u64>,
    liveness_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    sweep_batch_limit: Option<usize>,
    read_locks: Option<ReadLockMode>,
    guard_stale_after_ms: Option<u64>,
    guard_attempts: Option<u32>,
    db_busy_timeout_ms: Option<u64>,
    fingerprint_max_bytes: Option<u64>,
    journal_lock_ttl_secs: Option<u64>,
    message_ttl_secs: Option<u64>,
    audit_rotate_bytes: Option<u64>,
}

impl CoordConfig {
    /// Built-in defaults for `root`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            coordination_dir: paths::default_coordination_dir(&root),
            root,
            backend: BackendKind::Auto,
            default_ttl_secs: 300,
            max_ttl_secs: 3600,
            liveness_timeout_secs: 90,
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 60,
            sweep_batch_limit: 256,
            read_locks: ReadLockMode::Enforced,
            guard_stale_after_ms: 10_000,
            guard_attempts: 3,
            db_busy_timeout_ms: 250,
            fingerprint_max_bytes: MIB,
            journal_lock_ttl_secs: 5,
            message_ttl_secs: 3600,
            audit_rotate_bytes: 10 * MIB,
        }
    }

    /// Builder-style backend override, mostly for tests.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Reject settings that cannot produce a working lock manager.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.default_ttl_secs == 0 || self.max_ttl_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "lock TTLs must be greater than zero".to_string(),
            ));
        }
        if self.default_ttl_secs > self.max_ttl_secs {
            return Err(CoreError::InvalidConfig(format!(
                "default_ttl_secs ({}) exceeds max_ttl_secs ({})",
                self.default_ttl_secs, self.max_ttl_secs
            )));
        }
        if self.liveness_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "liveness_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.guard_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "guard_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Backend actually used once `Auto` is resolved against the filesystem.
    pub fn effective_backend(&self) -> BackendKind {
        match self.backend {
            BackendKind::Auto if paths::database_path(&self.coordination_dir).exists() => {
                BackendKind::Sqlite
            }
            BackendKind::Auto => BackendKind::File,
            other => other,
        }
    }

    // Durations -----------------------------------------------------------

    pub fn default_ttl(&self) -> chrono::Duration {
        secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> chrono::Duration {
        secs(self.max_ttl_secs)
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        secs(self.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        secs(self.sweep_interval_secs)
    }

    pub fn journal_lock_ttl(&self) -> chrono::Duration {
        secs(self.journal_lock_ttl_secs)
    }

    pub fn message_ttl(&self) -> chrono::Duration {
        secs(self.message_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn guard_stale_after(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.guard_stale_after_ms)
    }

    pub fn db_busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.db_busy_timeout_ms)
    }

    // Layering ------------------------------------------------------------

    fn apply(&mut self, overlay: ConfigOverlay) {
        if let Some(dir) = overlay.coordination_dir {
            self.coordination_dir = self.resolve_dir(dir);
        }
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $( if let Some(v) = overlay.$field { self.$field = v; } )*
            };
        }
        take!(
            backend,
            default_ttl_secs,
            max_ttl_secs,
            liveness_timeout_secs,
            heartbeat_interval_secs,
            sweep_interval_secs,
            sweep_batch_limit,
            read_locks,
            guard_stale_after_ms,
            guard_attempts,
            db_busy_timeout_ms,
            fingerprint_max_bytes,
            journal_lock_ttl_secs,
            message_ttl_secs,
            audit_rotate_bytes,
        );
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env(ENV_DIR).filter(|v| !v.trim().is_empty()) {
            self.coordination_dir = self.resolve_dir(PathBuf::from(dir));
        }
        if let Some(raw) = env(ENV_BACKEND) {
            self.backend = BackendKind::parse(&raw).ok_or_else(|| {
                CoreError::InvalidConfig(format!("{ENV_BACKEND}: unknown backend '{raw}'"))
            })?;
        }
        if let Some(raw) = env(ENV_LIVENESS_TIMEOUT) {
            self.liveness_timeout_secs = parse_secs(ENV_LIVENESS_TIMEOUT, &raw)?;
        }
        if let Some(raw) = env(ENV_DEFAULT_TTL) {
            self.default_ttl_secs = parse_secs(ENV_DEFAULT_TTL, &raw)?;
        }
        Ok(())
    }

    fn resolve_dir(&self, dir: PathBuf) -> PathBuf {
        if dir.is_absolute() {
            dir
        } else {
            self.root.join(dir)
        }
    }
}

fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1000))
}

fn parse_secs(var: &str, raw: &str) -> Result<u64, CoreError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| CoreError::InvalidConfig(format!("{var}: expected seconds, got '{raw}'")))
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// `<home>/.cohort/config.yaml`
pub fn user_config_path_at(home: &Path) -> PathBuf {
    paths::config_path(&home.join(paths::COORDINATION_DIR))
}

/// `<root>/.cohort/config.yaml`
pub fn project_config_path(root: &Path) -> PathBuf {
    paths::config_path(&paths::default_coordination_dir(root))
}

fn read_overlay(path: &Path) -> Result<Option<ConfigOverlay>, CoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    if contents.trim().is_empty() {
        return Ok(Some(ConfigOverlay::default()));
    }
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|source| CoreError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
}

/// Resolve configuration for `root` with an explicit home directory and
/// environment lookup. `home = None` skips the user layer.
pub fn load_at<F>(home: Option<&Path>, root: &Path, env: F) -> Result<CoordConfig, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = CoordConfig::for_root(root);

    if let Some(home) = home {
        if let Some(overlay) = read_overlay(&user_config_path_at(home))? {
            config.apply(overlay);
        }
    }
    if let Some(overlay) = read_overlay(&project_config_path(root))? {
        config.apply(overlay);
    }
    config.apply_env(env)?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper using the real home and process environment.
pub fn load(root: &Path) -> Result<CoordConfig, CoreError> {
    let home = dirs::home_dir();
    load_at(home.as_deref(), root, |key| std::env::var(key).ok())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_validate() {
        let cfg = CoordConfig::for_root("/repo");
        cfg.validate().unwrap();
        assert_eq!(cfg.coordination_dir, PathBuf::from("/repo/.cohort"));
        assert_eq!(cfg.default_ttl().num_seconds(), 300);
        assert_eq!(cfg.liveness_timeout().num_seconds(), 90);
        assert_eq!(cfg.read_locks, ReadLockMode::Enforced);
    }

    #[test]
    fn default_ttl_above_max_is_rejected() {
        let mut cfg = CoordConfig::for_root("/repo");
        cfg.default_ttl_secs = 7200;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds max_ttl_secs"), "got: {err}");
    }

    #[test]
    fn zero_liveness_timeout_is_rejected() {
        let mut cfg = CoordConfig::for_root("/repo");
        cfg.liveness_timeout_secs = 0;
        assert!(matches!(cfg.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn env_overrides_apply_last() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = load_at(None, dir.path(), |key| match key {
            ENV_BACKEND => Some("sqlite".into()),
            ENV_LIVENESS_TIMEOUT => Some("45".into()),
            ENV_DIR => Some("state".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.backend, BackendKind::Sqlite);
        assert_eq!(cfg.liveness_timeout_secs, 45);
        assert_eq!(cfg.coordination_dir, dir.path().join("state"));
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load_at(None, dir.path(), |key| {
            (key == ENV_DEFAULT_TTL).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains(ENV_DEFAULT_TTL));
    }

    #[test]
    fn auto_backend_follows_database_presence() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = load_at(None, dir.path(), no_env).unwrap();
        assert_eq!(cfg.effective_backend(), BackendKind::File);

        std::fs::create_dir_all(&cfg.coordination_dir).unwrap();
        std::fs::write(paths::database_path(&cfg.coordination_dir), b"").unwrap();
        assert_eq!(cfg.effective_backend(), BackendKind::Sqlite);
        assert_eq!(
            cfg.clone().with_backend(BackendKind::File).effective_backend(),
            BackendKind::File
        );
    }

    #[test]
    fn backend_parse_accepts_aliases() {
        assert_eq!(BackendKind::parse("JSON"), Some(BackendKind::File));
        assert_eq!(BackendKind::parse(" db "), Some(BackendKind::Sqlite));
        assert_eq!(BackendKind::parse("redis"), None);
    }
}
