//! Advisory per-(target, stage) lock files.
//!
//! Two orchestrator runs pointed at the same run directory would otherwise
//! race between probing an artifact and invoking its tool. The lock is a file
//! created with `create_new`, so acquisition is atomic on local filesystems.
//!
//! A lock older than `stale_after` is removed only by the waiter holding the
//! `<stage>.lock.break` file, which re-checks the age first. Each lock records
//! a unique token so a holder never removes a lock that has changed hands.

use crate::cancellation::{remove_on_drop, CancellationToken};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Timing for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// How long to wait for another holder.
    pub timeout: Duration,
    /// Age after which an existing lock is treated as abandoned.
    pub stale_after: Duration,
    /// Delay between attempts.
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            stale_after: Duration::from_secs(86_400),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Errors raised while acquiring a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder kept the lock past the timeout.
    #[error("timed out after {waited:?} waiting for {}", path.display())]
    Timeout {
        /// The lock path.
        path: PathBuf,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The run was cancelled while waiting.
    #[error("cancelled while waiting for {}", path.display())]
    Cancelled {
        /// The lock path.
        path: PathBuf,
    },

    /// The lock file could not be created or inspected.
    #[error("lock {} failed: {source}", path.display())]
    Io {
        /// The lock path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Returns the lock path for a stage under a target directory.
#[must_use]
pub fn lock_path(lock_dir: &Path, stage: &str) -> PathBuf {
    lock_dir.join(format!("{stage}.lock"))
}

/// Returns the path of the file serializing stale-lock removal for `lock`.
#[must_use]
pub fn breaker_path(lock: &Path) -> PathBuf {
    let mut name = lock.file_name().unwrap_or_default().to_os_string();
    name.push(".break");
    lock.with_file_name(name)
}

/// A held lock; the file is removed on drop if it is still ours.
#[derive(Debug)]
pub struct StageLock {
    path: PathBuf,
    token: String,
}

impl StageLock {
    /// Acquires the lock at `path`, waiting for other holders.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, cancellation, or filesystem failure.
    pub async fn acquire(
        path: PathBuf,
        owner: &str,
        settings: LockSettings,
        cancel: &CancellationToken,
    ) -> Result<Self, LockError> {
        let started = Instant::now();
        let token = Uuid::new_v4().simple().to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = write!(file, "{owner}\n{token}\n") {
                        warn!(lock = %path.display(), error = %e, "Failed to record lock owner");
                    }
                    debug!(lock = %path.display(), "Lock acquired");
                    return Ok(Self { path, token });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(LockError::Io { path, source }),
            }

            if is_stale(&path, settings.stale_after) {
                match break_stale(&path, settings.stale_after) {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(source) => return Err(LockError::Io { path, source }),
                }
            }

            let waited = started.elapsed();
            if waited >= settings.timeout {
                return Err(LockError::Timeout { path, waited });
            }
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled { path });
            }

            let delay = settings.poll_interval.min(settings.timeout - waited);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(LockError::Cancelled { path }),
            }
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StageLock {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path)
            .is_ok_and(|text| text.lines().any(|line| line == self.token));
        if !ours {
            warn!(lock = %self.path.display(), "Lock was taken over; leaving it in place");
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %e, "Failed to release lock");
            }
        }
    }
}

/// Removes the stale lock at `path` while holding its breaker file.
///
/// Returns true when the caller should retry `create_new` at once, and false
/// when another waiter is already breaking the lock.
fn break_stale(path: &Path, stale_after: Duration) -> std::io::Result<bool> {
    let breaker = breaker_path(path);
    let _breaker = match OpenOptions::new().write(true).create_new(true).open(&breaker) {
        Ok(_) => remove_on_drop(breaker),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if is_stale(&breaker, stale_after) {
                warn!(breaker = %breaker.display(), "Removing abandoned lock breaker");
                remove_if_present(&breaker)?;
                return Ok(true);
            }
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    // The lock may have been released and taken again since it was checked.
    if !is_stale(path, stale_after) {
        return Ok(true);
    }
    let holder = std::fs::read_to_string(path).unwrap_or_default();
    warn!(
        lock = %path.display(),
        holder = %holder.lines().next().unwrap_or_default(),
        "Breaking stale lock"
    );
    remove_if_present(path)?;
    Ok(true)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= stale_after)
}
