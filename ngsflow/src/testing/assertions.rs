//! Assertions over pipeline reports.

use crate::core::StageOutcome;
use crate::pipeline::StageGraph;
use crate::report::PipelineReport;

/// Asserts the status label (`exists`, `success`, `error`, `skipped`) of a sample stage.
pub fn assert_stage_status(report: &PipelineReport, sample: &str, stage: &str, expected: &str) {
    let outcome = report.outcome(sample, stage);
    assert_eq!(
        outcome.map(StageOutcome::label),
        Some(expected),
        "Expected {sample}.{stage} to be {expected}, got {outcome:?}"
    );
}

/// Asserts the failure or skip code of a sample stage.
pub fn assert_stage_reason(report: &PipelineReport, sample: &str, stage: &str, expected: &str) {
    let outcome = report.outcome(sample, stage);
    assert_eq!(
        outcome.and_then(StageOutcome::reason_kind),
        Some(expected),
        "Expected {sample}.{stage} to carry {expected}, got {outcome:?}"
    );
}

/// Asserts every sample stage of the graph is recorded exactly once per sample.
pub fn assert_every_stage_recorded(report: &PipelineReport, graph: &StageGraph) {
    let expected: Vec<&str> = graph.sample_stages().iter().map(|s| s.name.as_str()).collect();
    for sample in &report.samples {
        let recorded: Vec<&str> = sample.stages.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(
            recorded, expected,
            "Sample {} does not record every stage in execution order",
            sample.sample
        );
    }
}

/// Asserts no stage made forward progress while one of its dependencies did not.
pub fn assert_dependency_integrity(report: &PipelineReport, graph: &StageGraph) {
    for sample in &report.samples {
        for record in &sample.stages {
            let Some(descriptor) = graph.stage(&record.stage) else {
                continue;
            };
            if !record.outcome.is_forward() {
                continue;
            }
            for dep in &descriptor.dependencies {
                let upstream = sample.outcome(dep);
                assert!(
                    upstream.is_some_and(StageOutcome::is_forward),
                    "{}.{} is {} but dependency {dep} is {upstream:?}",
                    sample.sample,
                    record.stage,
                    record.outcome
                );
            }
        }
    }
}
