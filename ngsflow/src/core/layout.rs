//! On-disk layout of a run directory.
//!
//! ```text
//! <datadir>/
//!   <sample>/BAM  VCF  QC  Metrics  .locks
//!   _run/        .locks
//! ```

use std::path::{Path, PathBuf};

/// Subdirectories created under every sample directory.
pub const SAMPLE_SUBDIRS: [&str; 4] = ["BAM", "VCF", "QC", "Metrics"];

/// Directory holding advisory lock files.
pub const LOCK_DIR: &str = ".locks";

/// Directory holding per-run artifacts.
pub const RUN_DIR: &str = "_run";

/// Resolves where artifacts live for a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    datadir: PathBuf,
}

impl RunLayout {
    /// Creates a layout rooted at the run directory.
    #[must_use]
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            datadir: datadir.into(),
        }
    }

    /// Returns the run directory.
    #[must_use]
    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    /// Returns the directory holding one sample's artifacts.
    #[must_use]
    pub fn sample_dir(&self, sample: &str) -> PathBuf {
        self.datadir.join(sample)
    }

    /// Returns the directory holding per-run artifacts.
    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.datadir.join(RUN_DIR)
    }

    /// Returns the lock directory under a target's working directory.
    #[must_use]
    pub fn lock_dir(target_dir: &Path) -> PathBuf {
        target_dir.join(LOCK_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new("/runs/240101");
        assert_eq!(layout.sample_dir("S1"), PathBuf::from("/runs/240101/S1"));
        assert_eq!(layout.run_dir(), PathBuf::from("/runs/240101/_run"));
        assert_eq!(
            RunLayout::lock_dir(&layout.sample_dir("S1")),
            PathBuf::from("/runs/240101/S1/.locks")
        );
    }
}
