//! Stage descriptors.

use crate::config::ToolKind;
use crate::tools::CommandTemplate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a stage runs once per sample or once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// Runs for every sample independently.
    #[default]
    Sample,
    /// Runs once, after every sample has finished its per-sample stages.
    Run,
}

impl fmt::Display for StageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sample => f.write_str("sample"),
            Self::Run => f.write_str("run"),
        }
    }
}

/// Compiles one per-sample artifact from every sample into a single run file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gather {
    /// The per-sample stage whose artifacts are gathered.
    pub stage: String,
    /// Path template of the compiled file; available to the command as `{gathered}`.
    pub into: String,
}

/// An in-process rewrite of one upstream artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Copies a VCF without its `##contig=<ID` header lines.
    StripContigHeaders,
    /// Turns a samtools pileup into `chrom pos A C G T` base counts.
    BaseCounts,
}

impl TransformKind {
    /// Returns the name used in logs and plans.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::StripContigHeaders => "strip_contig_headers",
            Self::BaseCounts => "base_counts",
        }
    }
}

/// A transform and the path template of the file it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// What the transform does.
    pub kind: TransformKind,
    /// Path template of the input file.
    pub input: String,
}

impl Transform {
    /// Creates a transform reading `input`.
    #[must_use]
    pub fn new(kind: TransformKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
        }
    }
}

/// What a stage does to produce its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    /// Runs an external tool.
    Tool(CommandTemplate),
    /// Rewrites an upstream file in-process.
    Transform(Transform),
}

impl StageAction {
    /// Returns the external tool, if any.
    #[must_use]
    pub fn tool(&self) -> Option<ToolKind> {
        match self {
            Self::Tool(command) => Some(command.tool()),
            Self::Transform(_) => None,
        }
    }

    /// Returns the tool or transform name.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tool(command) => command.tool().key(),
            Self::Transform(transform) => transform.kind.key(),
        }
    }
}

impl From<CommandTemplate> for StageAction {
    fn from(command: CommandTemplate) -> Self {
        Self::Tool(command)
    }
}

impl From<Transform> for StageAction {
    fn from(transform: Transform) -> Self {
        Self::Transform(transform)
    }
}

/// Declarative description of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    /// The unique name of the stage.
    pub name: String,
    /// Upstream stages, in declaration order.
    pub dependencies: Vec<String>,
    /// Sample or run scope.
    pub scope: StageScope,
    /// Path template of the artifact the stage produces.
    pub artifact: String,
    /// What runs when the artifact is absent.
    pub action: StageAction,
    /// Optional gather step run before the command.
    pub gather: Option<Gather>,
}

impl StageDescriptor {
    /// Creates a per-sample stage with no dependencies.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        artifact: impl Into<String>,
        action: impl Into<StageAction>,
    ) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            scope: StageScope::Sample,
            artifact: artifact.into(),
            action: action.into(),
            gather: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Makes the stage run once per run.
    #[must_use]
    pub fn run_scoped(mut self) -> Self {
        self.scope = StageScope::Run;
        self
    }

    /// Gathers `stage` from every sample into `into` before running.
    #[must_use]
    pub fn with_gather(mut self, stage: impl Into<String>, into: impl Into<String>) -> Self {
        self.gather = Some(Gather {
            stage: stage.into(),
            into: into.into(),
        });
        self
    }

    /// Returns true if the stage runs once per run.
    #[must_use]
    pub fn is_run_scoped(&self) -> bool {
        self.scope == StageScope::Run
    }
}
