//! Artifact presence checks.
//!
//! The filesystem is the only record of past progress: a stage is considered
//! done when its artifact exists and is large enough to not be a leftover
//! from a crashed run.

use std::path::Path;

/// Result of probing a stage artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The artifact exists and is usable.
    Present {
        /// Size of the artifact in bytes.
        bytes: u64,
    },
    /// The artifact is missing, not a file, or too small.
    Absent,
}

impl ProbeResult {
    /// Returns true if the artifact is usable.
    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }
}

/// Side-effect free check for stage artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactProbe {
    min_bytes: u64,
}

impl Default for ArtifactProbe {
    fn default() -> Self {
        Self { min_bytes: 1 }
    }
}

impl ArtifactProbe {
    /// Creates a probe requiring at least `min_bytes` (never less than one).
    #[must_use]
    pub fn new(min_bytes: u64) -> Self {
        Self {
            min_bytes: min_bytes.max(1),
        }
    }

    /// Returns the minimum accepted artifact size.
    #[must_use]
    pub fn min_bytes(&self) -> u64 {
        self.min_bytes
    }

    /// Probes a single artifact path.
    #[must_use]
    pub fn probe(&self, path: &Path) -> ProbeResult {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() >= self.min_bytes => {
                ProbeResult::Present { bytes: meta.len() }
            }
            _ => ProbeResult::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let probe = ArtifactProbe::default();
        assert_eq!(probe.probe(&dir.path().join("S1.bam")), ProbeResult::Absent);
    }

    #[test]
    fn test_empty_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("S1.bam");
        std::fs::write(&path, b"").unwrap();

        assert!(!ArtifactProbe::default().probe(&path).is_present());
    }

    #[test]
    fn test_non_empty_file_is_present() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("S1.bam");
        std::fs::write(&path, b"BAM\x01").unwrap();

        assert_eq!(
            ArtifactProbe::default().probe(&path),
            ProbeResult::Present { bytes: 4 }
        );
    }

    #[test]
    fn test_threshold_guards_truncated_artifacts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("S1_merged.vcf");
        std::fs::write(&path, b"##fileformat").unwrap();

        let probe = ArtifactProbe::new(64);
        assert_eq!(probe.min_bytes(), 64);
        assert!(!probe.probe(&path).is_present());
    }

    #[test]
    fn test_directory_is_absent() {
        let dir = TempDir::new().unwrap();
        assert!(!ArtifactProbe::default().probe(dir.path()).is_present());
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        assert_eq!(ArtifactProbe::new(0).min_bytes(), 1);
    }
}
