//! Scope-bound cleanup.

use std::path::PathBuf;
use tracing::{debug, warn};

/// Runs a cleanup closure when dropped, unless disarmed.
///
/// Used to remove partial tool output whenever a stage attempt ends early:
/// nonzero exit, cancellation, or a panic unwinding through the runner.
pub struct CleanupGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> CleanupGuard<F> {
    /// Creates an armed guard.
    #[must_use]
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Disarms the guard; the cleanup will not run.
    pub fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl<F: FnOnce()> std::fmt::Debug for CleanupGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("armed", &self.cleanup.is_some())
            .finish()
    }
}

/// Returns a guard that deletes `path` on drop.
///
/// Missing files are ignored; other failures are logged.
pub fn remove_on_drop(path: PathBuf) -> CleanupGuard<impl FnOnce()> {
    CleanupGuard::new(move || match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_guard_runs_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            let _guard = CleanupGuard::new(move || ran.store(true, Ordering::SeqCst));
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disarmed_guard_does_not_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let guard = {
            let ran = ran.clone();
            CleanupGuard::new(move || ran.store(true, Ordering::SeqCst))
        };
        guard.disarm();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_remove_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("S1.aligned.sam.partial");
        std::fs::write(&path, b"@HD").unwrap();

        drop(remove_on_drop(path.clone()));
        assert!(!path.exists());

        // Already gone: no panic.
        drop(remove_on_drop(path));
    }
}
