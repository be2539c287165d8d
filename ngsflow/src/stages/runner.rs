//! Runs one stage for one target.

use super::gather::{compile, members_match, members_path, write_members, GatherInput};
use super::lock::{lock_path, LockError, LockSettings, StageLock};
use super::transform::apply as apply_transform;
use crate::cancellation::CancellationToken;
use crate::config::RunConfig;
use crate::core::{ArtifactProbe, RunLayout, SkipReason, StageFailure, StageOutcome, StageTarget};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::pipeline::{StageAction, StageDescriptor, StageScope, TransformKind};
use crate::report::StageRecord;
use crate::tools::{
    duration_millis, CommandTemplate, InvokeError, Invocation, TemplateContext, ToolInvoker, ToolRun,
};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Lines of stderr kept in a `ToolInvocation` failure.
const STDERR_EXCERPT_LINES: usize = 20;

/// The state of one upstream dependency when a stage becomes runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyState {
    /// Label reported when the dependency is unmet (stage, or `sample.stage`).
    pub label: String,
    /// The dependency's terminal outcome, if it reached one.
    pub outcome: Option<StageOutcome>,
}

impl DependencyState {
    /// Creates a dependency state.
    #[must_use]
    pub fn new(label: impl Into<String>, outcome: Option<StageOutcome>) -> Self {
        Self {
            label: label.into(),
            outcome,
        }
    }

    /// Returns true if the dependency made forward progress.
    #[must_use]
    pub fn is_met(&self) -> bool {
        self.outcome.as_ref().is_some_and(StageOutcome::is_forward)
    }
}

/// Freshness of a stage artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactState {
    /// Missing or below the size threshold.
    Absent,
    /// Present, and for run targets built from the current samples.
    Current,
    /// A run artifact built from a different set of samples.
    Outdated,
}

/// Composes the artifact probe, the stage lock and the tool invoker.
///
/// The sequence for every stage is: dependencies met, else `Skipped`;
/// artifact present, else lock, re-probe, invoke, and classify. An artifact
/// that passes the probe is never touched again, except a run artifact whose
/// member list no longer matches the run's samples.
pub struct StageRunner {
    config: Arc<RunConfig>,
    invoker: Arc<dyn ToolInvoker>,
    events: Arc<dyn EventSink>,
    probe: ArtifactProbe,
    workers: Arc<Semaphore>,
    cancel: Arc<CancellationToken>,
    locks: LockSettings,
    owner: String,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("probe", &self.probe)
            .field("available_workers", &self.workers.available_permits())
            .field("locks", &self.locks)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Creates a runner with a worker pool sized from the configuration.
    #[must_use]
    pub fn new(config: Arc<RunConfig>, invoker: Arc<dyn ToolInvoker>) -> Self {
        let locks = LockSettings {
            timeout: config.lock_timeout,
            stale_after: config.stale_lock_after,
            ..LockSettings::default()
        };
        Self {
            probe: ArtifactProbe::new(config.min_artifact_bytes),
            workers: Arc::new(Semaphore::new(config.workers)),
            invoker,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            locks,
            owner: format!("pid {}", std::process::id()),
            config,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation_token(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the lock timing.
    #[must_use]
    pub fn with_lock_settings(mut self, locks: LockSettings) -> Self {
        self.locks = locks;
        self
    }

    /// Sets the identity written into lock files.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Returns the artifact probe.
    #[must_use]
    pub fn probe(&self) -> ArtifactProbe {
        self.probe
    }

    /// Runs one stage for one target and returns its terminal record.
    ///
    /// `gather_inputs` is only consulted when the descriptor declares a gather step.
    pub async fn run(
        &self,
        target: &StageTarget,
        descriptor: &StageDescriptor,
        upstream: &[DependencyState],
        gather_inputs: &[GatherInput],
    ) -> StageRecord {
        let span = info_span!("stage", sample = %target.id, stage = %descriptor.name);
        let started_at = Utc::now();
        let timer = Instant::now();

        let (outcome, fingerprint) = self
            .execute(target, descriptor, upstream, gather_inputs)
            .instrument(span)
            .await;

        self.emit_outcome(target, descriptor, &outcome, timer.elapsed().as_millis());
        StageRecord::new(&descriptor.name, outcome)
            .with_timing(started_at, timer.elapsed())
            .with_fingerprint(fingerprint)
    }

    async fn execute(
        &self,
        target: &StageTarget,
        descriptor: &StageDescriptor,
        upstream: &[DependencyState],
        gather_inputs: &[GatherInput],
    ) -> (StageOutcome, Option<String>) {
        let unmet: Vec<String> = upstream
            .iter()
            .filter(|d| !d.is_met())
            .map(|d| d.label.clone())
            .collect();
        if !unmet.is_empty() {
            debug!(missing = ?unmet, "Dependencies not met");
            return (
                StageOutcome::Skipped(SkipReason::MissingDependency { stages: unmet }),
                None,
            );
        }
        if self.cancel.is_cancelled() {
            return (StageOutcome::Skipped(SkipReason::Cancelled), None);
        }

        let mut ctx = TemplateContext::for_target(&self.config, target);
        let gathered = match &descriptor.gather {
            Some(gather) => match ctx.render_path(&gather.into) {
                Ok(path) => {
                    ctx = ctx.with_path("gathered", &path);
                    Some(path)
                }
                Err(e) => return (StageOutcome::Error(StageFailure::io(e)), None),
            },
            None => None,
        };
        let artifact = match ctx.render_path(&descriptor.artifact) {
            Ok(path) => path,
            Err(e) => return (StageOutcome::Error(StageFailure::io(e)), None),
        };

        let members = (target.scope == StageScope::Run).then_some(target.members.as_slice());

        match self.artifact_state(&artifact, members) {
            ArtifactState::Current => {
                info!(artifact = %artifact.display(), "Artifact exists");
                return (StageOutcome::Exists, None);
            }
            ArtifactState::Outdated => {
                warn!(artifact = %artifact.display(), "Run artifact covers a different sample set");
            }
            ArtifactState::Absent => {}
        }

        let lock = lock_path(&RunLayout::lock_dir(target.dir()), &descriptor.name);
        let _lock = match StageLock::acquire(lock, &self.owner, self.locks, &self.cancel).await {
            Ok(lock) => lock,
            Err(LockError::Cancelled { .. }) => {
                return (StageOutcome::Skipped(SkipReason::Cancelled), None)
            }
            Err(LockError::Timeout { path, .. }) => {
                return (
                    StageOutcome::Error(StageFailure::LockTimeout {
                        lock: path.display().to_string(),
                    }),
                    None,
                )
            }
            Err(e @ LockError::Io { .. }) => return (StageOutcome::Error(StageFailure::io(e)), None),
        };

        // Another run may have produced the artifact while we waited.
        match self.artifact_state(&artifact, members) {
            ArtifactState::Current => {
                info!(artifact = %artifact.display(), "Artifact produced by another run");
                return (StageOutcome::Exists, None);
            }
            ArtifactState::Outdated => {
                if let Err(e) = remove_outdated(&artifact) {
                    error!(artifact = %artifact.display(), error = %e, "Failed to remove outdated run artifact");
                    return (StageOutcome::Error(StageFailure::io(e)), None);
                }
            }
            ArtifactState::Absent => {}
        }

        if let Some(gathered) = &gathered {
            if let Err(e) = compile(gather_inputs, gathered) {
                error!(gathered = %gathered.display(), error = %e, "Failed to compile run file");
                return (StageOutcome::Error(StageFailure::io(e)), None);
            }
            info!(
                gathered = %gathered.display(),
                samples = gather_inputs.len(),
                "Compiled run file"
            );
        }

        let (outcome, fingerprint) = match &descriptor.action {
            StageAction::Tool(command) => {
                let invocation = match self.prepare(target, descriptor, command, &ctx, &artifact) {
                    Ok(invocation) => invocation,
                    Err(failure) => return (StageOutcome::Error(failure), None),
                };
                let fingerprint = invocation.fingerprint();
                let _permit = match self.worker().await {
                    Ok(permit) => permit,
                    Err(outcome) => return (outcome, None),
                };
                self.emit_started(target, descriptor);

                let result = self.invoker.invoke(&invocation, &self.cancel).await;
                (self.classify(&invocation, result), fingerprint)
            }
            StageAction::Transform(transform) => {
                let input = match ctx.render_path(&transform.input) {
                    Ok(path) => path,
                    Err(e) => return (StageOutcome::Error(StageFailure::io(e)), None),
                };
                let fingerprint = transform_fingerprint(transform.kind, &input, &artifact);
                let _permit = match self.worker().await {
                    Ok(permit) => permit,
                    Err(outcome) => return (outcome, None),
                };
                self.emit_started(target, descriptor);

                (self.transform(transform.kind, input, &artifact).await, fingerprint)
            }
        };

        if outcome.is_error() {
            discard_artifact(&artifact);
        } else if let Some(members) = members {
            if let Err(e) = write_members(&artifact, members) {
                error!(artifact = %artifact.display(), error = %e, "Failed to record run members");
                discard_artifact(&artifact);
                return (StageOutcome::Error(StageFailure::io(e)), Some(fingerprint));
            }
        }
        (outcome, Some(fingerprint))
    }

    /// Checks the artifact, and for run targets the samples it was built from.
    fn artifact_state(&self, artifact: &Path, members: Option<&[String]>) -> ArtifactState {
        if !self.probe.probe(artifact).is_present() {
            return ArtifactState::Absent;
        }
        match members {
            Some(members) if !members_match(artifact, members) => ArtifactState::Outdated,
            _ => ArtifactState::Current,
        }
    }

    async fn worker(&self) -> Result<SemaphorePermit<'_>, StageOutcome> {
        tokio::select! {
            permit = self.workers.acquire() => {
                permit.map_err(|e| StageOutcome::Error(StageFailure::io(e)))
            }
            () = self.cancel.cancelled() => Err(StageOutcome::Skipped(SkipReason::Cancelled)),
        }
    }

    fn emit_started(&self, target: &StageTarget, descriptor: &StageDescriptor) {
        self.events.try_emit(
            names::STAGE_STARTED,
            Some(json!({
                "sample": target.id,
                "stage": descriptor.name,
                "tool": descriptor.action.label(),
            })),
        );
    }

    fn prepare(
        &self,
        target: &StageTarget,
        descriptor: &StageDescriptor,
        command: &CommandTemplate,
        ctx: &TemplateContext,
        artifact: &Path,
    ) -> Result<Invocation, StageFailure> {
        let tool = command.tool();
        let program = self
            .config
            .tool(tool)
            .ok_or_else(|| StageFailure::ExecutableNotFound {
                tool: tool.key().to_string(),
                program: format!("<unset ${}>", tool.env_var()),
            })?
            .to_path_buf();
        let rendered = command.render(ctx).map_err(StageFailure::io)?;

        for path in std::iter::once(artifact).chain(rendered.stdout.as_deref()) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(StageFailure::io)?;
            }
        }

        Ok(Invocation {
            stage: descriptor.name.clone(),
            target: target.id.clone(),
            tool,
            program,
            args: rendered.args,
            working_dir: target.dir.clone(),
            stdout_to: rendered.stdout,
            artifact: artifact.to_path_buf(),
        })
    }

    async fn transform(&self, kind: TransformKind, input: PathBuf, artifact: &Path) -> StageOutcome {
        let timer = Instant::now();
        let dest = artifact.to_path_buf();
        let result = tokio::task::spawn_blocking(move || apply_transform(kind, &input, &dest)).await;

        match result {
            Ok(Ok(())) if self.probe.probe(artifact).is_present() => {
                info!(
                    transform = kind.key(),
                    duration_ms = duration_millis(timer.elapsed()),
                    "Stage succeeded"
                );
                StageOutcome::Success
            }
            Ok(Ok(())) => {
                warn!(transform = kind.key(), artifact = %artifact.display(), "Transform produced an empty artifact");
                StageOutcome::Error(StageFailure::MissingOutput {
                    artifact: artifact.display().to_string(),
                })
            }
            Ok(Err(e)) => {
                error!(transform = kind.key(), error = %e, "Transform failed");
                StageOutcome::Error(StageFailure::io(e))
            }
            Err(e) => {
                error!(transform = kind.key(), error = %e, "Transform task aborted");
                StageOutcome::Error(StageFailure::io(e))
            }
        }
    }

    fn classify(&self, invocation: &Invocation, result: Result<ToolRun, InvokeError>) -> StageOutcome {
        let tool = invocation.tool.key().to_string();
        match result {
            Ok(run) if run.succeeded() => {
                if self.probe.probe(&invocation.artifact).is_present() {
                    info!(
                        tool = %tool,
                        duration_ms = duration_millis(run.duration),
                        "Stage succeeded"
                    );
                    StageOutcome::Success
                } else {
                    warn!(
                        tool = %tool,
                        artifact = %invocation.artifact.display(),
                        "Tool exited cleanly without producing its artifact"
                    );
                    StageOutcome::Error(StageFailure::MissingOutput {
                        artifact: invocation.artifact.display().to_string(),
                    })
                }
            }
            Ok(run) => {
                let stderr_tail = stderr_excerpt(&run.stderr);
                error!(tool = %tool, exit_code = ?run.exit_code, stderr = %stderr_tail, "Tool failed");
                StageOutcome::Error(StageFailure::ToolInvocation {
                    tool,
                    exit_code: run.exit_code,
                    stderr_tail,
                })
            }
            Err(InvokeError::ExecutableNotFound { program }) => {
                error!(tool = %tool, program = %program.display(), "Executable not found");
                StageOutcome::Error(StageFailure::ExecutableNotFound {
                    tool,
                    program: program.display().to_string(),
                })
            }
            Err(InvokeError::Cancelled) => {
                warn!(tool = %tool, "Tool killed on cancellation");
                StageOutcome::Error(StageFailure::Cancelled)
            }
            Err(e) => {
                error!(tool = %tool, error = %e, "Tool could not run");
                StageOutcome::Error(StageFailure::io(e))
            }
        }
    }

    fn emit_outcome(
        &self,
        target: &StageTarget,
        descriptor: &StageDescriptor,
        outcome: &StageOutcome,
        duration_ms: u128,
    ) {
        let (event, data) = match outcome {
            StageOutcome::Exists | StageOutcome::Success => (
                names::STAGE_COMPLETED,
                json!({
                    "sample": target.id,
                    "stage": descriptor.name,
                    "status": outcome.label(),
                    "duration_ms": u64::try_from(duration_ms).unwrap_or(u64::MAX),
                }),
            ),
            StageOutcome::Skipped(reason) => (
                names::STAGE_SKIPPED,
                json!({
                    "sample": target.id,
                    "stage": descriptor.name,
                    "reason": reason.kind(),
                }),
            ),
            StageOutcome::Error(failure) => (
                names::STAGE_FAILED,
                json!({
                    "sample": target.id,
                    "stage": descriptor.name,
                    "error": failure.kind(),
                    "message": failure.to_string(),
                }),
            ),
        };
        self.events.try_emit(event, Some(data));
    }
}

fn stderr_excerpt(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
    lines[start..].join("\n")
}

fn transform_fingerprint(kind: TransformKind, input: &Path, artifact: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.key().as_bytes());
    hasher.update([0u8]);
    hasher.update(input.display().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(artifact.display().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Removes a run artifact and its member list before it is rebuilt.
fn remove_outdated(artifact: &Path) -> std::io::Result<()> {
    for path in [artifact.to_path_buf(), members_path(artifact)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    warn!(artifact = %artifact.display(), "Removed outdated run artifact");
    Ok(())
}

fn discard_artifact(artifact: &Path) {
    match std::fs::remove_file(artifact) {
        Ok(()) => warn!(artifact = %artifact.display(), "Removed output of failed attempt"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(artifact = %artifact.display(), error = %e, "Failed to remove output of failed attempt"),
    }
}
