//! Creation of the per-sample and per-run directory trees.

use crate::core::{RunLayout, LOCK_DIR, RUN_DIR, SAMPLE_SUBDIRS};
use crate::errors::DiscoveryError;
use std::path::PathBuf;
use tracing::debug;

/// Creates the on-disk layout stages write into.
///
/// Creation is idempotent and never removes or truncates anything. Each
/// sample owns its own subtree, so concurrent calls for different samples
/// do not interfere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryProvisioner {
    layout: RunLayout,
}

impl DirectoryProvisioner {
    /// Creates a provisioner for a run directory.
    #[must_use]
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        Self {
            layout: RunLayout::new(datadir),
        }
    }

    /// Returns the layout.
    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Ensures a sample's directory tree exists and returns the sample directory.
    pub fn provision(&self, sample: &str) -> Result<PathBuf, DiscoveryError> {
        let fail = |message: String| DiscoveryError::Provision {
            sample: sample.to_string(),
            message,
        };
        if sample.is_empty()
            || sample.starts_with('.')
            || sample == RUN_DIR
            || sample.contains(['/', '\\'])
        {
            return Err(fail(format!("'{sample}' cannot be used as a directory name")));
        }

        let dir = self.layout.sample_dir(sample);
        for sub in SAMPLE_SUBDIRS.iter().chain(std::iter::once(&LOCK_DIR)) {
            std::fs::create_dir_all(dir.join(sub)).map_err(|e| fail(e.to_string()))?;
        }
        debug!(sample = %sample, dir = %dir.display(), "Provisioned sample directory");
        Ok(dir)
    }

    /// Ensures the per-run directory exists and returns it.
    pub fn provision_run(&self) -> std::io::Result<PathBuf> {
        let dir = self.layout.run_dir();
        std::fs::create_dir_all(RunLayout::lock_dir(&dir))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_provision_creates_tree() {
        let dir = TempDir::new().unwrap();
        let provisioner = DirectoryProvisioner::new(dir.path());

        let sample_dir = provisioner.provision("S1").unwrap();
        assert_eq!(sample_dir, dir.path().join("S1"));
        for sub in ["BAM", "VCF", "QC", "Metrics", ".locks"] {
            assert!(sample_dir.join(sub).is_dir(), "{sub} missing");
        }
    }

    #[test]
    fn test_provision_keeps_existing_artifacts() {
        let dir = TempDir::new().unwrap();
        let provisioner = DirectoryProvisioner::new(dir.path());
        provisioner.provision("S1").unwrap();

        let bam = dir.path().join("S1/BAM/S1.dedup.bam");
        std::fs::write(&bam, b"BAM\x01").unwrap();
        provisioner.provision("S1").unwrap();

        assert_eq!(std::fs::read(&bam).unwrap(), b"BAM\x01");
    }

    #[test]
    fn test_provision_rejects_reserved_names() {
        let provisioner = DirectoryProvisioner::new("/tmp/unused");
        for bad in ["_run", "..", ".hidden", ""] {
            let err = provisioner.provision(bad).unwrap_err();
            assert_eq!(err.kind(), "ProvisionError");
            assert_eq!(err.sample(), Some(bad));
        }
    }

    #[test]
    fn test_provision_blocked_by_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("S1"), b"not a dir").unwrap();

        let err = DirectoryProvisioner::new(dir.path()).provision("S1").unwrap_err();
        assert!(matches!(err, DiscoveryError::Provision { .. }));
    }

    #[test]
    fn test_provision_run_dir() {
        let dir = TempDir::new().unwrap();
        let run_dir = DirectoryProvisioner::new(dir.path()).provision_run().unwrap();
        assert_eq!(run_dir, dir.path().join("_run"));
        assert!(run_dir.join(".locks").is_dir());
    }
}
