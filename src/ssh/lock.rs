//! Cross-process leases over files in the state directory.
//!
//! Acquisition waits a bounded time and never fails: if the lock is still held
//! at the deadline, or the platform cannot lock the file at all, the caller gets
//! [`LeaseOutcome::DegradedUnprotected`] and proceeds without mutual exclusion.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a lease was not obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
    /// Another process held the lock for the whole wait
    TimedOut(Duration),
    /// The lock file could not be opened or locked
    Unavailable(String),
}

/// Outcome of a lease acquisition
#[derive(Debug)]
pub enum LeaseOutcome {
    Acquired(LeaseGuard),
    DegradedUnprotected { reason: DegradeReason },
}

impl LeaseOutcome {
    pub fn is_protected(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }
}

/// Holds an exclusive lock until dropped
#[derive(Debug)]
pub struct LeaseGuard {
    file: File,
    path: PathBuf,
}

impl LeaseGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.file) {
            tracing::warn!("Failed to release lease {}: {}", self.path.display(), e);
        } else {
            tracing::trace!("Released lease {}", self.path.display());
        }
    }
}

/// Acquire an exclusive lease on `path`, waiting at most `timeout`
pub async fn acquire(path: &Path, timeout: Duration) -> LeaseOutcome {
    let file = match open_lock_file(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(
                "Lease {} unavailable ({}); proceeding unprotected",
                path.display(),
                e
            );
            return LeaseOutcome::DegradedUnprotected {
                reason: DegradeReason::Unavailable(e.to_string()),
            };
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match try_flock_exclusive(&file) {
            Ok(true) => {
                tracing::debug!("Acquired lease {}", path.display());
                return LeaseOutcome::Acquired(LeaseGuard {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    "Locking {} failed ({}); proceeding unprotected",
                    path.display(),
                    e
                );
                return LeaseOutcome::DegradedUnprotected {
                    reason: DegradeReason::Unavailable(e.to_string()),
                };
            }
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                "Timed out after {:?} waiting for lease {}; proceeding unprotected",
                timeout,
                path.display()
            );
            return LeaseOutcome::DegradedUnprotected {
                reason: DegradeReason::TimedOut(timeout),
            };
        }
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if the file is
/// already locked by another process.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking is not supported on this platform",
        ))
    }
}

fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is a valid descriptor owned by `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("known_hosts.lock");

        let first = acquire(&path, Duration::from_millis(100)).await;
        assert!(first.is_protected());
        drop(first);

        let second = acquire(&path, Duration::from_millis(100)).await;
        assert!(second.is_protected());
    }

    #[tokio::test]
    async fn test_contended_lease_degrades_after_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts.lock");

        let held = acquire(&path, Duration::from_millis(100)).await;
        assert!(held.is_protected());

        let contended = acquire(&path, Duration::from_millis(150)).await;
        match contended {
            LeaseOutcome::DegradedUnprotected {
                reason: DegradeReason::TimedOut(waited),
            } => assert_eq!(waited, Duration::from_millis(150)),
            other => panic!("expected timeout degradation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ports.lock");

        let held = acquire(&path, Duration::from_millis(100)).await;
        let path_clone = path.clone();
        let waiter = tokio::spawn(async move {
            acquire(&path_clone, Duration::from_secs(5)).await.is_protected()
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_unopenable_path_degrades() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let outcome = acquire(&blocker.join("x.lock"), Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            LeaseOutcome::DegradedUnprotected {
                reason: DegradeReason::Unavailable(_)
            }
        ));
    }
}
