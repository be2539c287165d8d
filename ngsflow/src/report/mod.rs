//! Pipeline report and its aggregation.
//!
//! The aggregator is pure data collection: it orders what the orchestrator
//! recorded and makes no control decisions. The command-line layer decides the
//! exit code from [`PipelineReport::is_success`].

use crate::core::StageOutcome;
use crate::errors::DiscoveryError;
use crate::pipeline::StageGraph;
use crate::tools::duration_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// The terminal outcome of one stage for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub stage: String,
    /// Terminal outcome.
    pub outcome: StageOutcome,
    /// When the runner picked the stage up.
    pub started_at: DateTime<Utc>,
    /// Time spent in the runner, including lock and worker waits.
    pub duration_ms: u64,
    /// SHA-256 of the command line or transform, when the stage ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_fingerprint: Option<String>,
}

impl StageRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn new(stage: impl Into<String>, outcome: StageOutcome) -> Self {
        Self {
            stage: stage.into(),
            outcome,
            started_at: Utc::now(),
            duration_ms: 0,
            command_fingerprint: None,
        }
    }

    /// Sets the start time and duration.
    #[must_use]
    pub fn with_timing(mut self, started_at: DateTime<Utc>, duration: Duration) -> Self {
        self.started_at = started_at;
        self.duration_ms = duration_millis(duration);
        self
    }

    /// Sets the command fingerprint.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.command_fingerprint = fingerprint;
        self
    }
}

/// Every stage outcome of one sample, in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleReport {
    /// Sample identifier.
    pub sample: String,
    /// Stage records.
    pub stages: Vec<StageRecord>,
}

impl SampleReport {
    /// Returns the outcome of a stage.
    #[must_use]
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|r| r.stage == stage).map(|r| &r.outcome)
    }

    /// Returns true if every stage made forward progress.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(|r| r.outcome.is_forward())
    }
}

/// A sample dropped during discovery or provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedSample {
    /// Sample identifier, when the error names one.
    pub sample: Option<String>,
    /// Stable error code.
    pub error: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&DiscoveryError> for RejectedSample {
    fn from(err: &DiscoveryError) -> Self {
        Self {
            sample: err.sample().map(ToString::to_string),
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One failed or skipped stage, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Sample identifier, or the run label.
    pub target: String,
    /// Stage name.
    pub stage: String,
    /// Stable error code.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// Counts over a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    /// Samples that ran.
    pub samples: usize,
    /// Samples rejected before running.
    pub rejected: usize,
    /// Stage records, sample and run scope.
    pub total_stages: usize,
    /// Stages whose artifact already existed.
    pub exists: usize,
    /// Stages whose tool ran successfully.
    pub success: usize,
    /// Stages that failed.
    pub errors: usize,
    /// Stages not attempted.
    pub skipped: usize,
}

impl ReportSummary {
    /// Returns the fraction of stages that made forward progress.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        (self.exists + self.success) as f64 / self.total_stages as f64
    }

    /// Returns true if any stage failed or was skipped, or any sample was rejected.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.errors > 0 || self.skipped > 0 || self.rejected > 0
    }
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sample(s), {} rejected; {} stage(s): {} exists, {} success, {} error, {} skipped",
            self.samples,
            self.rejected,
            self.total_stages,
            self.exists,
            self.success,
            self.errors,
            self.skipped
        )
    }
}

/// The structured result of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Unique invocation identifier.
    pub run_id: Uuid,
    /// Panel name.
    pub panel: String,
    /// Run directory.
    pub datadir: PathBuf,
    /// Invocation start.
    pub started_at: DateTime<Utc>,
    /// Invocation end.
    pub finished_at: DateTime<Utc>,
    /// Samples in discovery order.
    pub samples: Vec<SampleReport>,
    /// Run-scoped stage records.
    pub run_stages: Vec<StageRecord>,
    /// Samples rejected during discovery or provisioning.
    pub rejected: Vec<RejectedSample>,
    /// Compiled identity file, when one exists.
    pub identity_file: Option<PathBuf>,
}

impl PipelineReport {
    /// Returns one sample's report.
    #[must_use]
    pub fn sample(&self, id: &str) -> Option<&SampleReport> {
        self.samples.iter().find(|s| s.sample == id)
    }

    /// Returns the outcome of a stage for a sample.
    #[must_use]
    pub fn outcome(&self, sample: &str, stage: &str) -> Option<&StageOutcome> {
        self.sample(sample).and_then(|s| s.outcome(stage))
    }

    /// Returns the outcome of a run-scoped stage.
    #[must_use]
    pub fn run_outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.run_stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    /// Returns true if every recorded stage made forward progress and no sample was rejected.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty()
            && self.samples.iter().all(SampleReport::is_success)
            && self.run_stages.iter().all(|r| r.outcome.is_forward())
    }

    /// Returns every failed or skipped stage.
    #[must_use]
    pub fn failures(&self) -> Vec<FailureRecord> {
        let sample_records = self
            .samples
            .iter()
            .flat_map(|s| s.stages.iter().map(move |r| (s.sample.as_str(), r)));
        let run_records = self
            .run_stages
            .iter()
            .map(|r| (crate::core::StageTarget::RUN_LABEL, r));

        sample_records
            .chain(run_records)
            .filter_map(|(target, record)| {
                record.outcome.reason_kind().map(|kind| FailureRecord {
                    target: target.to_string(),
                    stage: record.stage.clone(),
                    kind: kind.to_string(),
                    message: record.outcome.to_string(),
                })
            })
            .collect()
    }

    /// Returns counts over the report.
    #[must_use]
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary {
            samples: self.samples.len(),
            rejected: self.rejected.len(),
            ..ReportSummary::default()
        };
        let records = self
            .samples
            .iter()
            .flat_map(|s| s.stages.iter())
            .chain(self.run_stages.iter());
        for record in records {
            summary.total_stages += 1;
            match record.outcome {
                StageOutcome::Exists => summary.exists += 1,
                StageOutcome::Success => summary.success += 1,
                StageOutcome::Error(_) => summary.errors += 1,
                StageOutcome::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Writes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }
}

/// Everything the orchestrator recorded during one invocation.
#[derive(Debug, Clone)]
pub struct RunOutcomes {
    /// Unique invocation identifier.
    pub run_id: Uuid,
    /// Panel name.
    pub panel: String,
    /// Run directory.
    pub datadir: PathBuf,
    /// Invocation start.
    pub started_at: DateTime<Utc>,
    /// Per-sample records, samples in discovery order, records in completion order.
    pub samples: Vec<(String, Vec<StageRecord>)>,
    /// Run-scoped records.
    pub run_stages: Vec<StageRecord>,
    /// Rejected samples.
    pub rejected: Vec<RejectedSample>,
    /// Compiled identity file.
    pub identity_file: Option<PathBuf>,
}

/// Orders recorded outcomes into a [`PipelineReport`].
#[derive(Debug, Clone)]
pub struct ReportAggregator {
    positions: HashMap<String, usize>,
}

impl ReportAggregator {
    /// Creates an aggregator ordering stages by the graph's execution order.
    #[must_use]
    pub fn new(graph: &StageGraph) -> Self {
        Self {
            positions: graph
                .execution_order()
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect(),
        }
    }

    fn order(&self, records: Vec<StageRecord>) -> Vec<StageRecord> {
        let mut seen = HashSet::new();
        let mut records: Vec<_> = records
            .into_iter()
            .filter(|r| seen.insert(r.stage.clone()))
            .collect();
        records.sort_by_key(|r| self.positions.get(&r.stage).copied().unwrap_or(usize::MAX));
        records
    }

    /// Builds the report. Sample order is preserved; stage order follows the graph.
    #[must_use]
    pub fn aggregate(&self, outcomes: RunOutcomes) -> PipelineReport {
        PipelineReport {
            run_id: outcomes.run_id,
            panel: outcomes.panel,
            datadir: outcomes.datadir,
            started_at: outcomes.started_at,
            finished_at: Utc::now(),
            samples: outcomes
                .samples
                .into_iter()
                .map(|(sample, records)| SampleReport {
                    sample,
                    stages: self.order(records),
                })
                .collect(),
            run_stages: self.order(outcomes.run_stages),
            rejected: outcomes.rejected,
            identity_file: outcomes.identity_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SkipReason, StageFailure};
    use crate::pipeline::catalog::{self, standard_graph};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn outcomes(samples: Vec<(String, Vec<StageRecord>)>) -> RunOutcomes {
        RunOutcomes {
            run_id: Uuid::new_v4(),
            panel: "cardiac".to_string(),
            datadir: PathBuf::from("/runs/r1"),
            started_at: Utc::now(),
            samples,
            run_stages: Vec::new(),
            rejected: Vec::new(),
            identity_file: None,
        }
    }

    #[test]
    fn test_aggregate_orders_by_graph() {
        let graph = standard_graph().unwrap();
        let aggregator = ReportAggregator::new(&graph);

        let records = vec![
            StageRecord::new(catalog::VARIANTS_OCTOPUS, StageOutcome::Success),
            StageRecord::new(catalog::ALIGNMENT, StageOutcome::Exists),
            StageRecord::new(catalog::VARIANTS_GATK, StageOutcome::Success),
            StageRecord::new(catalog::ALIGNMENT, StageOutcome::Success),
        ];
        let report = aggregator.aggregate(outcomes(vec![
            ("S2".to_string(), records),
            ("S1".to_string(), Vec::new()),
        ]));

        let stages: Vec<_> = report.samples[0].stages.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![catalog::ALIGNMENT, catalog::VARIANTS_GATK, catalog::VARIANTS_OCTOPUS]
        );
        // First record wins.
        assert_eq!(report.outcome("S2", catalog::ALIGNMENT), Some(&StageOutcome::Exists));
        assert_eq!(report.samples[1].sample, "S1");
    }

    #[test]
    fn test_summary_and_success() {
        let graph = standard_graph().unwrap();
        let report = ReportAggregator::new(&graph).aggregate(outcomes(vec![(
            "S1".to_string(),
            vec![
                StageRecord::new(catalog::ALIGNMENT, StageOutcome::Exists),
                StageRecord::new(
                    catalog::DUPLICATE_REMOVAL,
                    StageOutcome::Error(StageFailure::MissingOutput {
                        artifact: "S1.dedup.bam".to_string(),
                    }),
                ),
                StageRecord::new(
                    catalog::RECALIBRATION_TABLE,
                    StageOutcome::Skipped(SkipReason::MissingDependency {
                        stages: vec![catalog::DUPLICATE_REMOVAL.to_string()],
                    }),
                ),
            ],
        )]));

        let summary = report.summary();
        assert_eq!(summary.total_stages, 3);
        assert_eq!(summary.exists, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.has_failures());
        assert!(!report.is_success());

        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind, "MissingOutputError");
        assert_eq!(failures[1].kind, "MissingInputError");
    }

    #[test]
    fn test_rejected_sample_fails_report() {
        let graph = standard_graph().unwrap();
        let mut run = outcomes(Vec::new());
        run.rejected.push(RejectedSample::from(&DiscoveryError::UnknownSample {
            sample: "S9".to_string(),
            datadir: PathBuf::from("/runs/r1"),
        }));
        let report = ReportAggregator::new(&graph).aggregate(run);

        assert!(!report.is_success());
        assert_eq!(report.rejected[0].error, "UnknownSampleError");
    }

    #[test]
    fn test_write_json() {
        let dir = TempDir::new().unwrap();
        let graph = standard_graph().unwrap();
        let mut run = outcomes(vec![(
            "S1".to_string(),
            vec![StageRecord::new(catalog::ALIGNMENT, StageOutcome::Success)
                .with_fingerprint(Some("ab".repeat(32)))],
        )]);
        run.run_stages.push(StageRecord::new(catalog::COPY_NUMBER, StageOutcome::Success));
        let report = ReportAggregator::new(&graph).aggregate(run);

        let path = dir.path().join("out/pipeline_report.json");
        report.write_json(&path).unwrap();

        let back: PipelineReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
        assert_eq!(back.run_outcome(catalog::COPY_NUMBER), Some(&StageOutcome::Success));
        assert!(back.is_success());
    }
}
