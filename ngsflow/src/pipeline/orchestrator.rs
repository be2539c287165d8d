//! Drives every sample through the stage graph.

use super::{catalog, StageAction, StageDescriptor, StageGraph, StageScope};
use crate::cancellation::CancellationToken;
use crate::config::RunConfig;
use crate::core::{RunLayout, Sample, SkipReason, StageFailure, StageOutcome, StageTarget};
use crate::discovery::{DirectoryProvisioner, SampleDiscovery};
use crate::errors::{ConfigurationError, PipelineError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::report::{PipelineReport, RejectedSample, ReportAggregator, RunOutcomes, StageRecord};
use crate::stages::{compile, DependencyState, GatherInput, LockSettings, StageRunner};
use crate::tools::{TemplateContext, TemplateError, ToolInvoker};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// File the per-sample identity pileups are compiled into, under the run directory.
pub const IDENTITY_FILE: &str = "identity.txt";

/// Runs a stage graph over the samples of one run directory.
///
/// Samples are driven independently and concurrently; within a sample a
/// stage starts as soon as all of its dependencies reached a terminal
/// outcome. Run-scoped stages start after every sample finished.
pub struct PipelineOrchestrator {
    graph: Arc<StageGraph>,
    config: Arc<RunConfig>,
    invoker: Arc<dyn ToolInvoker>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    locks: Option<LockSettings>,
    run_id: Uuid,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("run_id", &self.run_id)
            .field("stages", &self.graph.stage_count())
            .field("datadir", &self.config.datadir)
            .field("panel", &self.config.panel.name)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        graph: StageGraph,
        config: Arc<RunConfig>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            config,
            invoker,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            locks: None,
            run_id: Uuid::new_v4(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token shared with every stage.
    #[must_use]
    pub fn with_cancellation_token(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the lock timing derived from the configuration.
    #[must_use]
    pub fn with_lock_settings(mut self, locks: LockSettings) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Returns the invocation identifier.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the stage graph.
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Checks that every tool resolves and every template can be rendered.
    ///
    /// Nothing on disk is touched.
    pub fn preflight(&self) -> Result<(), ConfigurationError> {
        self.config.require_tools(&self.graph.required_tools())?;

        let layout = RunLayout::new(&self.config.datadir);
        let sample = Sample::new(
            "preflight",
            vec![PathBuf::from("preflight_R1.fastq.gz"), PathBuf::from("preflight_R2.fastq.gz")],
        )
        .target(layout.sample_dir("preflight"));
        let run = StageTarget::run(layout.run_dir(), vec!["preflight".to_string()]);

        let mut unset = BTreeSet::new();
        for stage in self.graph.stages() {
            let target = if stage.is_run_scoped() { &run } else { &sample };
            let mut ctx = TemplateContext::for_target(&self.config, target);
            if let Some(gather) = &stage.gather {
                match ctx.render_path(&gather.into) {
                    Ok(path) => ctx = ctx.with_path("gathered", &path),
                    Err(e) => self.note_template_error(stage, e, &mut unset)?,
                }
            }
            if let Err(e) = ctx.render(&stage.artifact) {
                self.note_template_error(stage, e, &mut unset)?;
            }
            let rendered = match &stage.action {
                StageAction::Tool(command) => command.render(&ctx).map(drop),
                StageAction::Transform(transform) => ctx.render(&transform.input).map(drop),
            };
            if let Err(e) = rendered {
                self.note_template_error(stage, e, &mut unset)?;
            }
        }

        if unset.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::missing_keys(unset.into_iter().collect()))
        }
    }

    fn note_template_error(
        &self,
        stage: &StageDescriptor,
        err: TemplateError,
        unset: &mut BTreeSet<String>,
    ) -> Result<(), ConfigurationError> {
        match err {
            TemplateError::Unset(name) => {
                let key = match name.as_str() {
                    "windows" | "baits" | "targets" => {
                        format!("panels.{}.{name}", self.config.panel.name)
                    }
                    _ => name,
                };
                unset.insert(key);
                Ok(())
            }
            other => Err(ConfigurationError::new(format!(
                "stage '{}' cannot be rendered: {other}",
                stage.name
            ))),
        }
    }

    /// Runs the pipeline.
    ///
    /// `explicit` restricts the run to the given samples; empty means every
    /// sample in the run directory.
    ///
    /// # Errors
    ///
    /// Only pre-flight failures are returned: configuration, an unreadable run
    /// directory, or an unwritable run-scope directory. Stage failures are
    /// recorded in the report.
    pub async fn run(&self, explicit: &[String]) -> Result<PipelineReport, PipelineError> {
        let span = info_span!("run", run_id = %self.run_id, panel = %self.config.panel.name);
        self.execute(explicit).instrument(span).await
    }

    async fn execute(&self, explicit: &[String]) -> Result<PipelineReport, PipelineError> {
        let started_at = Utc::now();
        let datadir = self.config.datadir.clone();

        self.preflight()?;

        let discovery = SampleDiscovery::new(&self.config.read_pattern)?
            .discover(&datadir, explicit)?;
        let mut rejected: Vec<RejectedSample> =
            discovery.rejected.iter().map(RejectedSample::from).collect();

        let provisioner = DirectoryProvisioner::new(&datadir);
        let mut targets = Vec::with_capacity(discovery.samples.len());
        for sample in &discovery.samples {
            match provisioner.provision(sample.id()) {
                Ok(dir) => targets.push(sample.target(dir)),
                Err(e) => {
                    warn!(sample = %sample.id(), error = %e, "Rejected sample");
                    rejected.push(RejectedSample::from(&e));
                }
            }
        }
        let run_dir = if self.graph.run_stages().is_empty() {
            None
        } else {
            Some(provisioner.provision_run()?)
        };

        self.events
            .emit(
                names::RUN_STARTED,
                Some(json!({
                    "run_id": self.run_id.to_string(),
                    "panel": self.config.panel.name,
                    "datadir": datadir.display().to_string(),
                    "samples": targets.len(),
                })),
            )
            .await;

        let runner = Arc::new(self.stage_runner());
        let samples = self.drive_samples(&runner, &targets).await;

        self.events.try_emit(names::RUN_BARRIER, Some(json!({ "samples": samples.len() })));
        let run_stages = match run_dir {
            Some(dir) => self.run_stages(&runner, dir, &targets, &samples).await,
            None => Vec::new(),
        };
        let identity_file = self.compile_identity(&targets, &samples);

        let report = ReportAggregator::new(&self.graph).aggregate(RunOutcomes {
            run_id: self.run_id,
            panel: self.config.panel.name.clone(),
            datadir,
            started_at,
            samples,
            run_stages,
            rejected,
            identity_file,
        });

        let summary = report.summary();
        info!(
            samples = summary.samples,
            rejected = summary.rejected,
            errors = summary.errors,
            skipped = summary.skipped,
            "Run finished"
        );
        self.events
            .emit(
                names::RUN_COMPLETED,
                Some(json!({
                    "run_id": self.run_id.to_string(),
                    "success": report.is_success(),
                })),
            )
            .await;
        Ok(report)
    }

    fn stage_runner(&self) -> StageRunner {
        let runner = StageRunner::new(self.config.clone(), self.invoker.clone())
            .with_event_sink(self.events.clone())
            .with_cancellation_token(self.cancel.clone())
            .with_owner(format!("run {} pid {}", self.run_id, std::process::id()));
        match self.locks {
            Some(locks) => runner.with_lock_settings(locks),
            None => runner,
        }
    }

    /// Drives every sample, at most `max_parallel_samples` at once.
    /// Results are in target order.
    async fn drive_samples(
        &self,
        runner: &Arc<StageRunner>,
        targets: &[StageTarget],
    ) -> Vec<(String, Vec<StageRecord>)> {
        let slots = Arc::new(Semaphore::new(self.config.max_parallel_samples));
        let drives = targets.iter().map(|target| {
            let slots = slots.clone();
            async move {
                let _slot = slots.acquire().await.ok();
                let records = drive_sample(
                    runner.clone(),
                    self.graph.clone(),
                    self.events.clone(),
                    target.clone(),
                )
                .await;
                (target.id.clone(), records)
            }
        });
        futures::future::join_all(drives).await
    }

    async fn run_stages(
        &self,
        runner: &StageRunner,
        run_dir: PathBuf,
        targets: &[StageTarget],
        samples: &[(String, Vec<StageRecord>)],
    ) -> Vec<StageRecord> {
        let members: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        let target = StageTarget::run(run_dir, members);
        let sample_outcomes: HashMap<&str, HashMap<&str, &StageOutcome>> = samples
            .iter()
            .map(|(id, records)| {
                (
                    id.as_str(),
                    records.iter().map(|r| (r.stage.as_str(), &r.outcome)).collect(),
                )
            })
            .collect();

        let mut records: Vec<StageRecord> = Vec::new();
        for stage in self.graph.run_stages() {
            let mut upstream = Vec::new();
            let mut sample_deps = Vec::new();
            for dep in &stage.dependencies {
                let run_scoped = self.graph.stage(dep).is_some_and(|d| d.scope == StageScope::Run);
                if run_scoped {
                    let outcome = records.iter().find(|r| &r.stage == dep).map(|r| r.outcome.clone());
                    upstream.push(DependencyState::new(dep.clone(), outcome));
                } else {
                    sample_deps.push(dep.clone());
                    for (id, _) in samples {
                        let outcome = sample_outcomes
                            .get(id.as_str())
                            .and_then(|o| o.get(dep.as_str()))
                            .map(|o| (*o).clone());
                        upstream.push(DependencyState::new(format!("{id}.{dep}"), outcome));
                    }
                }
            }

            let record = if !sample_deps.is_empty() && target.members.is_empty() {
                warn!(stage = %stage.name, "No samples reached the run barrier");
                StageRecord::new(
                    &stage.name,
                    StageOutcome::Skipped(SkipReason::MissingDependency { stages: sample_deps }),
                )
            } else {
                match self.gather_inputs(stage, targets) {
                    Ok(inputs) => runner.run(&target, stage, &upstream, &inputs).await,
                    Err(e) => StageRecord::new(&stage.name, StageOutcome::Error(StageFailure::io(e))),
                }
            };
            records.push(record);
        }
        records
    }

    /// Resolves the per-sample artifacts a run-scoped stage gathers.
    fn gather_inputs(
        &self,
        stage: &StageDescriptor,
        targets: &[StageTarget],
    ) -> Result<Vec<GatherInput>, TemplateError> {
        let Some(source) = stage
            .gather
            .as_ref()
            .and_then(|g| self.graph.stage(&g.stage))
        else {
            return Ok(Vec::new());
        };
        targets
            .iter()
            .map(|t| {
                TemplateContext::for_target(&self.config, t)
                    .render_path(&source.artifact)
                    .map(|path| GatherInput::new(&t.id, path))
            })
            .collect()
    }

    /// Compiles identity pileups into the run directory when absent.
    fn compile_identity(
        &self,
        targets: &[StageTarget],
        samples: &[(String, Vec<StageRecord>)],
    ) -> Option<PathBuf> {
        let stage = self.graph.stage(catalog::IDENTITY)?;
        let dest = self.config.datadir.join(IDENTITY_FILE);
        if dest.exists() {
            return Some(dest);
        }

        let mut inputs = Vec::new();
        for (target, (_, records)) in targets.iter().zip(samples) {
            let done = records
                .iter()
                .any(|r| r.stage == stage.name && r.outcome.is_forward());
            if !done {
                continue;
            }
            match TemplateContext::for_target(&self.config, target).render_path(&stage.artifact) {
                Ok(path) => inputs.push(GatherInput::new(&target.id, path)),
                Err(e) => warn!(sample = %target.id, error = %e, "Identity artifact path unavailable"),
            }
        }
        if inputs.is_empty() {
            return None;
        }

        match compile(&inputs, &dest) {
            Ok(()) => {
                info!(file = %dest.display(), samples = inputs.len(), "Compiled identity file");
                Some(dest)
            }
            Err(e) => {
                error!(file = %dest.display(), error = %e, "Failed to compile identity file");
                None
            }
        }
    }
}

/// Drives one sample's stage graph to completion.
///
/// Every sample stage ends with exactly one record: stages whose
/// dependencies did not all make forward progress are recorded as skipped.
async fn drive_sample(
    runner: Arc<StageRunner>,
    graph: Arc<StageGraph>,
    events: Arc<dyn EventSink>,
    target: StageTarget,
) -> Vec<StageRecord> {
    let span = info_span!("sample", sample = %target.id);
    async move {
        events.try_emit(names::SAMPLE_STARTED, Some(json!({ "sample": target.id })));
        let target = Arc::new(target);

        let stages = graph.sample_stages();
        let mut in_degree: HashMap<&str, usize> = stages
            .iter()
            .map(|s| (s.name.as_str(), s.dependencies.len()))
            .collect();
        let mut outcomes: HashMap<String, StageOutcome> = HashMap::new();
        let mut records = Vec::with_capacity(stages.len());
        let mut active = FuturesUnordered::new();

        for stage in stages.iter().filter(|s| s.dependencies.is_empty()) {
            active.push(spawn_stage(&runner, &target, stage, Vec::new()));
        }

        while let Some((name, joined)) = active.next().await {
            let record = joined.unwrap_or_else(|e| {
                error!(stage = %name, error = %e, "Stage task failed");
                StageRecord::new(&name, StageOutcome::Error(StageFailure::io(e)))
            });
            outcomes.insert(name.clone(), record.outcome.clone());
            records.push(record);

            for child in graph.dependents(&name) {
                let Some(count) = in_degree.get_mut(child) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }
                let Some(descriptor) = graph.stage(child) else {
                    continue;
                };
                let upstream = descriptor
                    .dependencies
                    .iter()
                    .map(|dep| DependencyState::new(dep.clone(), outcomes.get(dep).cloned()))
                    .collect();
                active.push(spawn_stage(&runner, &target, descriptor, upstream));
            }
        }

        let success = records.iter().all(|r| r.outcome.is_forward());
        events.try_emit(
            names::SAMPLE_COMPLETED,
            Some(json!({ "sample": target.id, "success": success })),
        );
        records
    }
    .instrument(span)
    .await
}

/// Spawns one stage and tags the join result with the stage name.
fn spawn_stage(
    runner: &Arc<StageRunner>,
    target: &Arc<StageTarget>,
    descriptor: &StageDescriptor,
    upstream: Vec<DependencyState>,
) -> impl Future<Output = (String, Result<StageRecord, tokio::task::JoinError>)> {
    let name = descriptor.name.clone();
    let runner = runner.clone();
    let target = target.clone();
    let descriptor = descriptor.clone();
    let handle = tokio::spawn(
        async move { runner.run(&target, &descriptor, &upstream, &[]).await }
            .in_current_span(),
    );
    async move { (name, handle.await) }
}

/// Returns where `stage` writes its artifact for `sample` (ignored for run-scoped stages).
pub fn artifact_path(
    config: &RunConfig,
    graph: &StageGraph,
    sample: &str,
    stage: &str,
) -> Option<PathBuf> {
    let descriptor = graph.stage(stage)?;
    let layout = RunLayout::new(&config.datadir);
    let target = if descriptor.is_run_scoped() {
        StageTarget::run(layout.run_dir(), Vec::new())
    } else {
        Sample::new(sample, Vec::new()).target(layout.sample_dir(sample))
    };
    TemplateContext::for_target(config, &target)
        .render_path(&descriptor.artifact)
        .ok()
}
