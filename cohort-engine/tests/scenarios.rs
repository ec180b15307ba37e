//! End-to-end coordination scenarios, run against both store backends with a
//! manual clock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

use chrono::Duration;
use cohort_core::{
    AuditAction, BackendKind, CoordConfig, LockType, ManualClock, Priority, ReadLockMode,
};
use cohort_engine::{AcquireOutcome, CoordError, Coordinator, DenyReason, ReleaseOutcome};
use cohort_store::open_store;
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
    config: CoordConfig,
}

impl Harness {
    fn new(backend: BackendKind) -> Self {
        Self::with_mode(backend, ReadLockMode::Enforced)
    }

    fn with_mode(backend: BackendKind, mode: ReadLockMode) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/app.py"), "print('hi')\n").unwrap();
        let mut config = CoordConfig::for_root(dir.path()).with_backend(backend);
        config.read_locks = mode;
        config.db_busy_timeout_ms = 2_000;
        Self {
            dir,
            clock: Arc::new(ManualClock::starting_now()),
            config,
        }
    }

    /// A coordinator for `session`, with its own store handle like a
    /// separate process would have.
    fn instance(&self, session: &str) -> Coordinator {
        let store = open_store(&self.config).unwrap();
        Coordinator::with_parts(
            self.config.clone(),
            store,
            self.clock.clone(),
            Some(session),
            std::process::id(),
        )
    }

    fn canonical(&self, rel: &str) -> PathBuf {
        self.dir.path().canonicalize().unwrap().join(rel)
    }
}

fn app() -> &'static Path {
    Path::new("src/app.py")
}

fn secs(s: i64) -> Option<Duration> {
    Some(Duration::seconds(s))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn live_lock_denies_other_instance(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    let b = h.instance("b");

    let granted = a
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "refactor app")
        .unwrap();
    assert!(matches!(granted, AcquireOutcome::Granted { reentered: false, .. }));
    let a_id = a.current_instance().unwrap().unwrap().instance_id;

    h.clock.advance_secs(120);
    let denied = b
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "fix bug")
        .unwrap();
    match &denied {
        AcquireOutcome::Denied {
            reason: DenyReason::Conflict,
            holder: Some(holder),
            ..
        } => {
            assert_eq!(holder.instance_id, a_id);
            assert_eq!(holder.intent, "refactor app");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(denied.decision(), "deny");
    assert!(denied.message().contains(a_id.as_str()));
    assert!(denied.message().contains("refactor app"));
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn expired_lock_is_reclaimed_and_audited(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    let b = h.instance("b");

    a.acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "refactor app")
        .unwrap();
    let a_id = a.current_instance().unwrap().unwrap().instance_id;

    h.clock.advance_secs(301);
    let outcome = b
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "fix bug")
        .unwrap();
    let AcquireOutcome::Reclaimed { record, previous } = outcome else {
        panic!("expected reclaim, got {outcome:?}");
    };
    let b_id = b.current_instance().unwrap().unwrap().instance_id;
    assert_eq!(record.holder(), &b_id);
    assert_eq!(previous.holder(), &a_id);

    let info = b.get_lock_info(app()).unwrap().unwrap();
    assert_eq!(info.holder(), &b_id);

    let audit = b.recent_audit(100).unwrap();
    let reclaimed = audit
        .iter()
        .find(|e| e.action_type == AuditAction::Reclaimed)
        .expect("reclaim audited");
    assert_eq!(reclaimed.instance_id, b_id);
    assert_eq!(reclaimed.details["previous_holder"], a_id.as_str());
    let reason = reclaimed.details["reason"].as_str().unwrap();
    assert!(reason.contains(a_id.as_str()) && reason.contains("expired"));
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn silent_instance_loses_locks_to_sweep(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    a.acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "refactor app")
        .unwrap();
    let a_id = a.current_instance().unwrap().unwrap().instance_id;

    h.clock.advance_secs(30);
    a.heartbeat().unwrap();
    h.clock.advance_secs(30);
    a.heartbeat().unwrap();

    // Lease still has minutes left; only the heartbeat gap matters.
    h.clock.advance_secs(91);
    let report = a.cleanup_stale().unwrap();
    assert_eq!(report.released.len(), 1);
    assert_eq!(report.released[0].file_path, h.canonical("src/app.py"));
    assert_eq!(report.dead_instances, vec![a_id.clone()]);
    assert!(!a.is_file_locked(app()).unwrap().locked);

    let audit = a.recent_audit(100).unwrap();
    assert!(audit
        .iter()
        .any(|e| e.action_type == AuditAction::Swept && e.target_type == "file_lock"));

    // A second sweep finds nothing left to do.
    assert!(a.cleanup_stale().unwrap().is_empty());
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn reacquire_updates_intent_in_place(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");

    let first = a
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "first pass")
        .unwrap();
    h.clock.advance_secs(10);
    let second = a
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "second pass")
        .unwrap();

    let AcquireOutcome::Granted {
        record,
        reentered: true,
    } = second
    else {
        panic!("expected re-entry, got {second:?}");
    };
    assert_eq!(record.lock_id, first.record().unwrap().lock_id);
    assert_eq!(record.intent, "second pass");

    let locks = a.list_locks(true).unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].intent, "second pass");
    assert!(locks[0].expires_at > first.record().unwrap().expires_at);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn release_is_idempotent(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");

    assert_eq!(a.release_file_lock(app()).unwrap(), ReleaseOutcome::NotHeld);
    a.acquire_file_lock(app(), LockType::ExclusiveWrite, None, "edit")
        .unwrap();
    assert!(matches!(
        a.release_file_lock(app()).unwrap(),
        ReleaseOutcome::Released { .. }
    ));
    assert_eq!(a.release_file_lock(app()).unwrap(), ReleaseOutcome::NotHeld);
    assert!(a.get_lock_info(app()).unwrap().is_none());
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn only_holder_may_release_or_extend(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    let b = h.instance("b");
    a.acquire_file_lock(app(), LockType::ExclusiveWrite, None, "edit")
        .unwrap();
    let a_id = a.current_instance().unwrap().unwrap().instance_id;
    b.register_instance().unwrap();

    assert_eq!(
        b.release_file_lock(app()).unwrap(),
        ReleaseOutcome::NotHolder {
            holder: a_id.clone()
        }
    );
    assert!(a.is_file_locked(app()).unwrap().locked);

    let err = b.extend_file_lock(app(), secs(60)).unwrap_err();
    assert!(matches!(err, CoordError::NotHolder { holder, .. } if holder == a_id));
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn extend_bumps_counter_and_clamps(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    a.acquire_file_lock(app(), LockType::ExclusiveWrite, secs(60), "edit")
        .unwrap();

    h.clock.advance_secs(30);
    let extended = a.extend_file_lock(app(), secs(100_000)).unwrap();
    assert_eq!(extended.extensions, 1);
    assert_eq!(
        (extended.expires_at - extended.locked_at).num_seconds(),
        30 + 3600
    );
    let stored = a.get_lock_info(app()).unwrap().unwrap();
    assert_eq!(stored, extended);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn extend_without_lock_is_not_held(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    a.register_instance().unwrap();
    let err = a.extend_file_lock(app(), secs(60)).unwrap_err();
    assert!(matches!(err, CoordError::NotHeld { .. }));
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn enforced_reads_share_but_block_writers(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let (a, b, c) = (h.instance("a"), h.instance("b"), h.instance("c"));

    assert!(a
        .acquire_file_lock(app(), LockType::SharedRead, None, "read")
        .unwrap()
        .is_granted());
    assert!(b
        .acquire_file_lock(app(), LockType::SharedRead, None, "read")
        .unwrap()
        .is_granted());
    let denied = c
        .acquire_file_lock(app(), LockType::ExclusiveWrite, None, "write")
        .unwrap();
    assert!(!denied.is_granted());

    let status = c.is_file_locked(app()).unwrap();
    assert_eq!(status.holders.len(), 2);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn advisory_reads_never_block(#[case] backend: BackendKind) {
    let h = Harness::with_mode(backend, ReadLockMode::Advisory);
    let (a, b) = (h.instance("a"), h.instance("b"));

    assert!(a
        .acquire_file_lock(app(), LockType::SharedRead, None, "read")
        .unwrap()
        .is_granted());
    assert!(b
        .acquire_file_lock(app(), LockType::ExclusiveWrite, None, "write")
        .unwrap()
        .is_granted());
    assert_eq!(b.list_locks(false).unwrap().len(), 2);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn write_holder_reading_is_reentrant(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    a.acquire_file_lock(app(), LockType::ExclusiveWrite, None, "edit")
        .unwrap();
    let read = a
        .acquire_file_lock(app(), LockType::SharedRead, None, "look")
        .unwrap();
    assert!(matches!(read, AcquireOutcome::Granted { reentered: true, .. }));

    let locks = a.list_locks(false).unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].lock_type, LockType::ExclusiveWrite);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn deregister_releases_everything_once(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    a.acquire_file_lock(app(), LockType::ExclusiveWrite, None, "edit")
        .unwrap();
    a.acquire_file_lock(Path::new("src/other.py"), LockType::ExclusiveWrite, None, "edit")
        .unwrap();
    let a_id = a.current_instance().unwrap().unwrap().instance_id;

    assert_eq!(a.deregister_instance().unwrap(), Some(a_id));
    assert!(a.list_locks(true).unwrap().is_empty());
    assert!(a.instances().unwrap().is_empty());
    assert!(a.current_instance().unwrap().is_none());
    assert_eq!(a.deregister_instance().unwrap(), None);
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn release_reports_content_change(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let a = h.instance("a");
    let granted = a
        .acquire_file_lock(app(), LockType::ExclusiveWrite, None, "edit")
        .unwrap();
    assert!(granted.record().unwrap().file_hash.is_some());

    std::fs::write(h.dir.path().join("src/app.py"), "print('bye')\n").unwrap();
    match a.release_file_lock(app()).unwrap() {
        ReleaseOutcome::Released { modified, .. } => assert_eq!(modified, Some(true)),
        other => panic!("expected release, got {other:?}"),
    }
}

#[test]
fn zero_ttl_is_rejected() {
    let h = Harness::new(BackendKind::File);
    let a = h.instance("a");
    let err = a
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(0), "edit")
        .unwrap_err();
    assert!(matches!(err, CoordError::InvalidTtl { secs: 0 }));
}

#[test]
fn failing_heartbeat_store_denies_instead_of_erroring() {
    let h = Harness::new(BackendKind::File);
    let a = h.instance("a");
    let heartbeats = cohort_core::paths::heartbeats_dir(&h.config.coordination_dir);
    std::fs::remove_dir_all(&heartbeats).unwrap();
    std::fs::write(&heartbeats, "not a directory").unwrap();

    let outcome = a
        .acquire_file_lock(app(), LockType::ExclusiveWrite, secs(300), "edit")
        .unwrap();
    match outcome {
        AcquireOutcome::Denied {
            path,
            reason: DenyReason::StoreUnavailable,
            holder: None,
        } => assert_eq!(path, h.canonical("src/app.py")),
        other => panic!("expected store-unavailable denial, got {other:?}"),
    }
}

#[rstest]
#[case::file(BackendKind::File)]
#[case::sqlite(BackendKind::Sqlite)]
fn racing_instances_get_one_grant(#[case] backend: BackendKind) {
    let h = Harness::new(backend);
    let coordinators: Vec<Coordinator> = (0..6)
        .map(|i| {
            let c = h.instance(&format!("racer-{i}"));
            c.register_instance().unwrap();
            c
        })
        .collect();
    let barrier = Arc::new(Barrier::new(coordinators.len()));

    let handles: Vec<_> = coordinators
        .into_iter()
        .map(|c| {
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                c.acquire_file_lock(app(), LockType::ExclusiveWrite, None, "race")
                    .unwrap()
                    .is_granted()
            })
        })
        .collect();
    let grants = handles
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|granted| *granted)
        .count();
    assert_eq!(grants, 1);
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

#[test]
fn sqlite_mailbox_delivers_once() {
    let h = Harness::new(BackendKind::Sqlite);
    let a = h.instance("a");
    let b = h.instance("b");
    let b_id = b.register_instance().unwrap().instance.instance_id;

    a.send_message(
        b_id.as_str(),
        "intent",
        serde_json::json!({ "file": "src/app.py" }),
        Priority::High,
        None,
    )
    .unwrap();
    assert_eq!(b.pending_message_count().unwrap(), Some(1));
    let inbox = b.drain_messages().unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].message_type, "intent");
    assert!(b.drain_messages().unwrap().is_empty());
    assert_eq!(b.pending_message_count().unwrap(), Some(0));
}

#[test]
fn file_backend_has_no_mailbox() {
    let h = Harness::new(BackendKind::File);
    let a = h.instance("a");
    let err = a
        .send_message("*", "intent", serde_json::Value::Null, Priority::Normal, None)
        .unwrap_err();
    assert!(matches!(err, CoordError::MailboxUnsupported { .. }));
    assert_eq!(a.pending_message_count().unwrap(), None);
}
