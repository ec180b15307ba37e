//! Layered config loading against real files.

use assert_fs::prelude::*;
use cohort_core::config::{self, BackendKind};
use cohort_core::{CoreError, ReadLockMode};
use predicates::prelude::*;

fn no_env(_: &str) -> Option<String> {
    None
}

// ---------------------------------------------------------------------------
// 1. Layering
// ---------------------------------------------------------------------------

#[test]
fn project_file_overrides_user_file() {
    let home = assert_fs::TempDir::new().expect("home");
    let root = assert_fs::TempDir::new().expect("root");

    home.child(".cohort/config.yaml")
        .write_str("default_ttl_secs: 120\nliveness_timeout_secs: 60\nbackend: file\n")
        .expect("user config");
    root.child(".cohort/config.yaml")
        .write_str("liveness_timeout_secs: 30\nread_locks: advisory\n")
        .expect("project config");

    let cfg = config::load_at(Some(home.path()), root.path(), no_env).expect("load");
    assert_eq!(cfg.default_ttl_secs, 120, "user layer kept where project is silent");
    assert_eq!(cfg.liveness_timeout_secs, 30, "project layer wins");
    assert_eq!(cfg.backend, BackendKind::File);
    assert_eq!(cfg.read_locks, ReadLockMode::Advisory);
    assert_eq!(cfg.max_ttl_secs, 3600, "untouched keys keep defaults");
}

#[test]
fn env_beats_every_file() {
    let root = assert_fs::TempDir::new().expect("root");
    root.child(".cohort/config.yaml")
        .write_str("default_ttl_secs: 100\n")
        .expect("project config");

    let cfg = config::load_at(None, root.path(), |k| {
        (k == config::ENV_DEFAULT_TTL).then(|| "200".to_string())
    })
    .expect("load");
    assert_eq!(cfg.default_ttl_secs, 200);
}

#[test]
fn relative_coordination_dir_is_resolved_against_root() {
    let root = assert_fs::TempDir::new().expect("root");
    root.child(".cohort/config.yaml")
        .write_str("coordination_dir: shared/coord\n")
        .expect("project config");

    let cfg = config::load_at(None, root.path(), no_env).expect("load");
    assert_eq!(cfg.coordination_dir, root.path().join("shared/coord"));
}

#[test]
fn empty_file_is_all_defaults() {
    let root = assert_fs::TempDir::new().expect("root");
    root.child(".cohort/config.yaml").touch().expect("touch");
    let cfg = config::load_at(None, root.path(), no_env).expect("load");
    assert_eq!(cfg.default_ttl_secs, 300);
}

// ---------------------------------------------------------------------------
// 2. Errors
// ---------------------------------------------------------------------------

#[test]
fn malformed_yaml_names_the_file() {
    let root = assert_fs::TempDir::new().expect("root");
    let file = root.child(".cohort/config.yaml");
    file.write_str(": : not yaml [").expect("write");

    let err = config::load_at(None, root.path(), no_env).unwrap_err();
    assert!(matches!(err, CoreError::ConfigParse { .. }), "got: {err}");
    assert!(predicate::str::contains("config.yaml").eval(&err.to_string()));
}

#[test]
fn invalid_combination_is_rejected_after_layering() {
    let root = assert_fs::TempDir::new().expect("root");
    root.child(".cohort/config.yaml")
        .write_str("default_ttl_secs: 600\nmax_ttl_secs: 60\n")
        .expect("write");

    let err = config::load_at(None, root.path(), no_env).unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfig(_)), "got: {err}");
}

#[test]
fn loading_never_creates_the_coordination_dir() {
    let root = assert_fs::TempDir::new().expect("root");
    let _ = config::load_at(None, root.path(), no_env).expect("load");
    root.child(".cohort").assert(predicate::path::missing());
}
