//! Samples and the targets stages run against.

use super::StageOutcome;
use crate::pipeline::StageScope;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One subject's sequencing data for the duration of a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    id: String,
    reads: Vec<PathBuf>,
    statuses: HashMap<String, StageOutcome>,
}

impl Sample {
    /// Creates a sample from its identifier and ordered read files.
    #[must_use]
    pub fn new(id: impl Into<String>, reads: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            reads,
            statuses: HashMap::new(),
        }
    }

    /// Returns the run-scoped identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the read files, mates adjacent (R1, R2, R1, R2, ...).
    #[must_use]
    pub fn reads(&self) -> &[PathBuf] {
        &self.reads
    }

    /// Records a terminal outcome for a stage.
    ///
    /// Returns false and keeps the first outcome if the stage already
    /// reached a terminal state; stages are never re-entered within a run.
    pub fn record(&mut self, stage: impl Into<String>, outcome: StageOutcome) -> bool {
        let stage = stage.into();
        if self.statuses.contains_key(&stage) {
            return false;
        }
        self.statuses.insert(stage, outcome);
        true
    }

    /// Returns the recorded outcome for a stage.
    #[must_use]
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.statuses.get(stage)
    }

    /// Returns every recorded outcome.
    #[must_use]
    pub fn statuses(&self) -> &HashMap<String, StageOutcome> {
        &self.statuses
    }

    /// Builds the target used to run this sample's stages.
    #[must_use]
    pub fn target(&self, dir: impl Into<PathBuf>) -> StageTarget {
        StageTarget {
            id: self.id.clone(),
            dir: dir.into(),
            scope: StageScope::Sample,
            reads: self.reads.clone(),
            members: Vec::new(),
        }
    }
}

/// What a stage runs against: one sample, or the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTarget {
    /// Sample identifier, or the run label for run-scoped stages.
    pub id: String,
    /// Working directory for the stage's tool.
    pub dir: PathBuf,
    /// Whether this is a sample or the run.
    pub scope: StageScope,
    /// Input reads (sample scope only).
    pub reads: Vec<PathBuf>,
    /// Samples taking part in the run (run scope only), in discovery order.
    pub members: Vec<String>,
}

impl StageTarget {
    /// Label used for run-scoped targets in logs, locks and reports.
    pub const RUN_LABEL: &'static str = "run";

    /// Creates a run-scoped target.
    #[must_use]
    pub fn run(dir: impl Into<PathBuf>, members: Vec<String>) -> Self {
        Self {
            id: Self::RUN_LABEL.to_string(),
            dir: dir.into(),
            scope: StageScope::Run,
            reads: Vec::new(),
            members,
        }
    }

    /// Returns the working directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SkipReason, StageFailure};

    #[test]
    fn test_record_is_terminal() {
        let mut sample = Sample::new("S1", vec![PathBuf::from("S1_R1.fastq.gz")]);

        assert!(sample.record("alignment", StageOutcome::Success));
        assert!(!sample.record("alignment", StageOutcome::Error(StageFailure::Cancelled)));
        assert_eq!(sample.outcome("alignment"), Some(&StageOutcome::Success));
    }

    #[test]
    fn test_outcomes_are_per_stage() {
        let mut sample = Sample::new("S1", Vec::new());
        sample.record("alignment", StageOutcome::Exists);
        sample.record(
            "duplicate_removal",
            StageOutcome::Skipped(SkipReason::Cancelled),
        );

        assert_eq!(sample.statuses().len(), 2);
        assert!(sample.outcome("coverage").is_none());
    }

    #[test]
    fn test_targets() {
        let sample = Sample::new("S2", vec![PathBuf::from("a"), PathBuf::from("b")]);
        let target = sample.target("/runs/r1/S2");
        assert_eq!(target.id, "S2");
        assert_eq!(target.scope, StageScope::Sample);
        assert_eq!(target.reads.len(), 2);

        let run = StageTarget::run("/runs/r1/_run", vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(run.id, StageTarget::RUN_LABEL);
        assert_eq!(run.scope, StageScope::Run);
        assert_eq!(run.dir(), Path::new("/runs/r1/_run"));
    }
}
