//! Behaviour both lock store backends must share.
//!
//! Every test runs once per backend through `#[rstest]` cases.

use std::path::PathBuf;
use std::sync::{Arc, Barrier};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use cohort_core::{
    AuditAction, AuditEvent, BackendKind, CoordConfig, Heartbeat, HeartbeatStatus, InstanceId,
    LockHolder, LockRecord, LockType, ReadLockMode,
};
use cohort_store::{open_store, LockStore, StoreError, WriteOutcome};
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open(dir: &TempDir, backend: BackendKind, mode: ReadLockMode) -> Arc<dyn LockStore> {
    let mut config = CoordConfig::for_root(dir.path()).with_backend(backend);
    config.read_locks = mode;
    open_store(&config).expect("open store")
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn target() -> PathBuf {
    PathBuf::from("/repo/src/app.py")
}

fn lock(holder: &str, lock_type: LockType, at: DateTime<Utc>, ttl: i64) -> LockRecord {
    LockRecord::new(
        target(),
        lock_type,
        LockHolder {
            instance_id: InstanceId::from(holder),
            pid: 100,
        },
        at,
        Duration::seconds(ttl),
        format!("{holder} editing"),
    )
}

fn written(outcome: WriteOutcome) -> Vec<LockRecord> {
    match outcome {
        WriteOutcome::Written { replaced } => replaced,
        other => panic!("expected Written, got {other:?}"),
    }
}

fn conflict(outcome: WriteOutcome) -> LockRecord {
    match outcome {
        WriteOutcome::Conflict { holder } => holder,
        other => panic!("expected Conflict, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 1. Read / write
// ---------------------------------------------------------------------------

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn absent_path_reads_none(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    assert_eq!(store.read(&target()).unwrap(), None);
    assert!(store.read_all(&target()).unwrap().is_empty());
    assert!(store.list().unwrap().is_empty());
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn written_record_reads_back_whole(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let mut rec = lock("a", LockType::ExclusiveWrite, now(), 300);
    rec.file_hash = Some("abc123".into());

    assert!(written(store.write(&rec, now()).unwrap()).is_empty());
    assert_eq!(store.read(&target()).unwrap(), Some(rec.clone()));
    assert_eq!(store.list().unwrap(), vec![rec]);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn live_write_blocks_other_writer(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    let a = lock("a", LockType::ExclusiveWrite, t, 300);
    written(store.write(&a, t).unwrap());

    let b = lock("b", LockType::ExclusiveWrite, t, 300);
    let holder = conflict(store.write(&b, t + Duration::seconds(10)).unwrap());
    assert_eq!(holder, a);
    assert_eq!(store.read(&target()).unwrap(), Some(a));
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn same_holder_replaces_in_place(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    let first = lock("a", LockType::ExclusiveWrite, t, 300);
    written(store.write(&first, t).unwrap());

    let mut second = first.clone();
    second.intent = "new intent".into();
    second.expires_at = t + Duration::seconds(600);
    written(store.write(&second, t).unwrap());

    assert_eq!(store.read_all(&target()).unwrap(), vec![second]);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn expired_record_is_replaced_and_reported(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    let a = lock("a", LockType::ExclusiveWrite, t, 300);
    written(store.write(&a, t).unwrap());

    let later = t + Duration::seconds(301);
    let b = lock("b", LockType::ExclusiveWrite, later, 300);
    let replaced = written(store.write(&b, later).unwrap());
    assert_eq!(replaced, vec![a]);
    assert_eq!(store.read(&target()).unwrap(), Some(b));
}

// ---------------------------------------------------------------------------
// 2. Shared reads
// ---------------------------------------------------------------------------

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn readers_coexist_and_block_writers_when_enforced(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    written(store.write(&lock("a", LockType::SharedRead, t, 60), t).unwrap());
    written(store.write(&lock("b", LockType::SharedRead, t, 60), t).unwrap());
    assert_eq!(store.read_all(&target()).unwrap().len(), 2);
    assert_eq!(store.read(&target()).unwrap(), None, "no write slot yet");

    let holder = conflict(store.write(&lock("c", LockType::ExclusiveWrite, t, 60), t).unwrap());
    assert_eq!(holder.lock_type, LockType::SharedRead);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn advisory_reads_never_block(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Advisory);
    let t = now();
    written(store.write(&lock("a", LockType::SharedRead, t, 60), t).unwrap());
    written(store.write(&lock("b", LockType::ExclusiveWrite, t, 60), t).unwrap());
    written(store.write(&lock("c", LockType::SharedRead, t, 60), t).unwrap());

    // Writers still exclude writers.
    conflict(store.write(&lock("d", LockType::ExclusiveWrite, t, 60), t).unwrap());
    assert_eq!(store.read_all(&target()).unwrap().len(), 3);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn upgrade_drops_own_read_record(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    written(store.write(&lock("a", LockType::SharedRead, t, 60), t).unwrap());
    let w = lock("a", LockType::ExclusiveWrite, t, 60);
    written(store.write(&w, t).unwrap());
    assert_eq!(store.read_all(&target()).unwrap(), vec![w]);
}

// ---------------------------------------------------------------------------
// 3. Delete
// ---------------------------------------------------------------------------

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn delete_is_noop_when_absent(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let removed = store.delete(&target(), &InstanceId::from("a"), now()).unwrap();
    assert!(removed.is_empty());
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn delete_by_non_holder_fails_while_live(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    let a = lock("a", LockType::ExclusiveWrite, t, 300);
    written(store.write(&a, t).unwrap());

    let err = store.delete(&target(), &InstanceId::from("b"), t).unwrap_err();
    match err {
        StoreError::NotHolder { holder, .. } => assert_eq!(holder, InstanceId::from("a")),
        other => panic!("expected NotHolder, got {other}"),
    }

    let removed = store.delete(&target(), &InstanceId::from("a"), t).unwrap();
    assert_eq!(removed, vec![a]);
    assert_eq!(store.read(&target()).unwrap(), None);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn force_delete_requires_matching_lock_id(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    let a = lock("a", LockType::ExclusiveWrite, t, 10);
    written(store.write(&a, t).unwrap());

    let later = t + Duration::seconds(11);
    let b = lock("b", LockType::ExclusiveWrite, later, 300);
    written(store.write(&b, later).unwrap());

    assert!(!store.force_delete(&a).unwrap(), "stale snapshot must not remove b");
    assert_eq!(store.read(&target()).unwrap(), Some(b.clone()));
    assert!(store.force_delete(&b).unwrap());
    assert_eq!(store.read(&target()).unwrap(), None);
}

// ---------------------------------------------------------------------------
// 4. Heartbeats, audit, sweep slot
// ---------------------------------------------------------------------------

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn heartbeats_roundtrip(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let hb = Heartbeat {
        instance_id: InstanceId::from("a"),
        pid: 5,
        last_ping: now(),
        ping_count: 1,
        status: HeartbeatStatus::Active,
    };
    store.put_heartbeat(&hb).unwrap();
    let mut next = hb.clone();
    next.ping_count = 2;
    store.put_heartbeat(&next).unwrap();

    assert_eq!(store.list_heartbeats().unwrap(), vec![next.clone()]);
    assert_eq!(store.get_heartbeat(&hb.instance_id).unwrap(), Some(next));
    assert!(store.remove_heartbeat(&hb.instance_id).unwrap());
    assert!(!store.remove_heartbeat(&hb.instance_id).unwrap());
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn audit_returns_most_recent_oldest_first(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    let t = now();
    for (i, action) in [AuditAction::Acquired, AuditAction::Extended, AuditAction::Released]
        .into_iter()
        .enumerate()
    {
        let ev = AuditEvent::for_lock(
            InstanceId::from("a"),
            action,
            &target(),
            serde_json::json!({ "n": i }),
            t + Duration::seconds(i as i64),
        );
        store.append_audit(&ev).unwrap();
    }

    let recent = store.recent_audit(2).unwrap();
    let actions: Vec<_> = recent.iter().map(|e| e.action_type).collect();
    assert_eq!(actions, vec![AuditAction::Extended, AuditAction::Released]);
    assert_eq!(recent[1].details["n"], 2);
    assert_eq!(recent[1].target_type, "file_lock");
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn mailbox_only_on_sqlite(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, backend, ReadLockMode::Enforced);
    assert_eq!(store.mailbox().is_some(), backend == BackendKind::Sqlite);
    assert_eq!(store.backend(), backend);
}

#[test]
fn auto_backend_opens_files_until_a_database_exists() {
    let dir = TempDir::new().unwrap();
    let config = CoordConfig::for_root(dir.path());
    assert_eq!(open_store(&config).unwrap().backend(), BackendKind::File);

    open_store(&config.clone().with_backend(BackendKind::Sqlite)).unwrap();
    assert_eq!(open_store(&config).unwrap().backend(), BackendKind::Sqlite);
}

// ---------------------------------------------------------------------------
// 5. Races
// ---------------------------------------------------------------------------

/// Many threads, each with its own store handle, race for one expired lock.
/// Exactly one may win.
#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn racing_reclaimers_yield_one_winner(#[case] backend: BackendKind) {
    let dir = TempDir::new().unwrap();
    let t = now();
    {
        let store = open(&dir, backend, ReadLockMode::Enforced);
        written(store.write(&lock("dead", LockType::ExclusiveWrite, t, 1), t).unwrap());
    }
    let later = t + Duration::seconds(5);

    let racers = 8;
    let barrier = Arc::new(Barrier::new(racers));
    let handles: Vec<_> = (0..racers)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let root = dir.path().to_path_buf();
            std::thread::spawn(move || {
                let mut config = CoordConfig::for_root(&root).with_backend(backend);
                // Generous so slow CI never turns a loss into an error.
                config.guard_attempts = 200;
                config.db_busy_timeout_ms = 5_000;
                let store = open_store(&config).expect("open");
                let rec = lock(&format!("racer-{i}"), LockType::ExclusiveWrite, later, 300);
                barrier.wait();
                store.write(&rec, later)
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.join().expect("thread") {
            Ok(WriteOutcome::Written { .. }) => winners += 1,
            Ok(WriteOutcome::Conflict { .. }) | Err(StoreError::Contended { .. }) => {}
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }
    assert_eq!(winners, 1);

    let store = open(&dir, backend, ReadLockMode::Enforced);
    let stored = store.read(&target()).unwrap().expect("a winner is recorded");
    assert!(stored.holder().as_str().starts_with("racer-"));
}
