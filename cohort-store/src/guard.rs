//! Per-path guard files for the file-backed store.
//!
//! A guard is a sibling file created with `O_CREAT | O_EXCL` holding a token
//! unique to its holder. Whoever creates it may read-modify-write the records
//! of that path; dropping the guard removes the file if it still carries the
//! holder's token. Guards left behind by a crashed process are broken once
//! their mtime is older than the configured staleness bound. Breaking is
//! serialised through a `<guard>.break` sibling so two breakers can never
//! remove each other's fresh guard.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{io_err, StoreError};

/// Pause between guard attempts. Multiplied by the attempt number.
const RETRY_STEP: Duration = Duration::from_millis(2);

#[derive(Debug)]
pub struct PathGuard {
    path: PathBuf,
    token: String,
}

impl PathGuard {
    /// Try to take the guard at `path`, at most `attempts` times.
    ///
    /// Returns [`StoreError::Contended`] when another live process keeps it.
    pub fn acquire(path: &Path, attempts: u32, stale_after: Duration) -> Result<Self, StoreError> {
        let attempts = attempts.max(1);
        let token = format!("{} {}\n", std::process::id(), uuid::Uuid::new_v4());
        let mut failed = 0;
        let mut broke_stale = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(token.as_bytes()) {
                        let _ = std::fs::remove_file(path);
                        return Err(io_err(path, e));
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !broke_stale && break_if_stale(path, stale_after)? {
                        broke_stale = true;
                        continue;
                    }
                    failed += 1;
                    if failed >= attempts {
                        break;
                    }
                    std::thread::sleep(RETRY_STEP * failed);
                }
                Err(e) => return Err(io_err(path, e)),
            }
        }
        tracing::debug!(guard = %path.display(), attempts, "guard contended");
        Err(StoreError::Contended {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(current) if current == self.token => {}
            Ok(_) => {
                tracing::warn!(guard = %self.path.display(), "guard was broken and retaken; leaving it");
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(guard = %self.path.display(), error = %e, "cannot read guard");
                return;
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(guard = %self.path.display(), error = %e, "failed to remove guard");
            }
        }
    }
}

/// Contents and age of the file at `path`, `None` if it is gone.
fn observe(path: &Path) -> Result<Option<(String, Duration)>, StoreError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or_default();
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some((contents, age))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

fn breaker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".break");
    PathBuf::from(name)
}

/// Remove an abandoned guard. `Ok(true)` if it was removed (or vanished).
///
/// The guard is only removed while holding the breaker file, and only if it
/// still carries the contents that were judged stale.
fn break_if_stale(path: &Path, stale_after: Duration) -> Result<bool, StoreError> {
    let Some((stale_contents, age)) = observe(path)? else {
        return Ok(true);
    };
    if age < stale_after {
        return Ok(false);
    }

    let breaker = breaker_path(path);
    match OpenOptions::new().write(true).create_new(true).open(&breaker) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // A breaker that crashed mid-break must not wedge the path.
            if let Some((_, breaker_age)) = observe(&breaker)? {
                if breaker_age >= stale_after {
                    tracing::warn!(breaker = %breaker.display(), "removing abandoned guard breaker");
                    let _ = std::fs::remove_file(&breaker);
                }
            }
            return Ok(false);
        }
        Err(e) => return Err(io_err(&breaker, e)),
    }

    let result = match observe(path) {
        Ok(None) => Ok(true),
        Ok(Some((contents, _))) if contents != stale_contents => Ok(false),
        Ok(Some(_)) => {
            tracing::warn!(
                guard = %path.display(),
                age_ms = age.as_millis() as u64,
                "breaking abandoned guard"
            );
            match std::fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                Err(e) => Err(io_err(path, e)),
            }
        }
        Err(e) => Err(e),
    };
    if let Err(e) = std::fs::remove_file(&breaker) {
        tracing::warn!(breaker = %breaker.display(), error = %e, "failed to remove guard breaker");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn write_aged(path: &Path, contents: &str, age: Duration) {
        std::fs::write(path, contents).unwrap();
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn guard_is_exclusive_and_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.guard");

        let guard = PathGuard::acquire(&path, 1, Duration::from_secs(10)).unwrap();
        assert!(path.exists());

        let err = PathGuard::acquire(&path, 2, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, StoreError::Contended { .. }));

        drop(guard);
        assert!(!path.exists());
        PathGuard::acquire(&path, 1, Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn abandoned_guard_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.guard");
        std::fs::write(&path, b"999999\n").unwrap();

        // Zero staleness bound: any existing guard counts as abandoned.
        let guard = PathGuard::acquire(&path, 1, Duration::ZERO).unwrap();
        assert_eq!(guard.path(), path.as_path());
        assert!(!breaker_path(&path).exists());
    }

    #[test]
    fn fresh_guard_of_another_holder_is_not_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.guard");
        std::fs::write(&path, b"999999 other\n").unwrap();

        let err = PathGuard::acquire(&path, 1, Duration::from_secs(3600)).unwrap_err();
        assert!(matches!(err, StoreError::Contended { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "999999 other\n");
    }

    #[test]
    fn drop_leaves_a_guard_retaken_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.guard");
        let guard = PathGuard::acquire(&path, 1, Duration::from_secs(10)).unwrap();

        // Broken as stale and retaken by another process.
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"4242 newcomer\n").unwrap();

        drop(guard);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242 newcomer\n");
    }

    #[test]
    fn concurrent_breakers_admit_one_holder_at_a_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.guard");
        let stale_after = Duration::from_secs(3600);
        write_aged(&path, "999999 crashed\n", stale_after * 2);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let inside = Arc::new(AtomicUsize::new(0));
        let most_inside = Arc::new(AtomicUsize::new(0));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (path, barrier) = (path.clone(), barrier.clone());
                let (inside, most_inside, winners) =
                    (inside.clone(), most_inside.clone(), winners.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    if let Ok(guard) = PathGuard::acquire(&path, 1, stale_after) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        most_inside.fetch_max(now_inside, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(winners.load(Ordering::SeqCst) >= 1);
        assert_eq!(most_inside.load(Ordering::SeqCst), 1);
        assert!(!breaker_path(&path).exists());
    }
}
