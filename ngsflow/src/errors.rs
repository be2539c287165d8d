//! Error types for the ngsflow orchestration engine.
//!
//! Pre-flight errors (configuration, stage graph, run directory I/O) abort an
//! invocation before any sample is touched. Discovery errors are scoped to one
//! sample. Per-stage failures are not errors at all at this level: they are
//! captured as [`crate::core::StageOutcome`] values in the report.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for pipeline invocations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run configuration is incomplete or invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The stage graph failed validation.
    #[error("{0}")]
    Graph(#[from] GraphValidationError),

    /// The run directory could not be scanned.
    #[error("{0}")]
    Discovery(#[from] DiscoveryError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns the stable error code used in logs and reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Graph(err) => err.code,
            Self::Discovery(err) => err.kind(),
            Self::Io(_) => "IoError",
        }
    }
}

/// Error raised when the configuration cannot produce a usable [`crate::config::RunConfig`].
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The configuration keys involved.
    pub keys: Vec<String>,
    /// The configuration file, when one was read.
    pub source_path: Option<PathBuf>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            keys: Vec::new(),
            source_path: None,
        }
    }

    /// Creates an error listing every missing required key.
    #[must_use]
    pub fn missing_keys(keys: Vec<String>) -> Self {
        Self {
            message: format!("missing required key(s): {}", keys.join(", ")),
            keys,
            source_path: None,
        }
    }

    /// Sets the configuration file path.
    #[must_use]
    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}

/// Errors raised while turning the run directory into samples.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// An explicitly requested sample has no input files.
    #[error("Unknown sample '{sample}': no input reads found in {}", datadir.display())]
    UnknownSample {
        /// The requested sample identifier.
        sample: String,
        /// The run directory that was scanned.
        datadir: PathBuf,
    },

    /// A sample's read files do not form complete R1/R2 pairs.
    #[error("Unpaired input for sample '{sample}': {r1} R1 file(s), {r2} R2 file(s), unmatched: {}", unmatched.join(", "))]
    UnpairedInput {
        /// The sample identifier.
        sample: String,
        /// Number of R1 files found.
        r1: usize,
        /// Number of R2 files found.
        r2: usize,
        /// File names with no mate.
        unmatched: Vec<String>,
    },

    /// The sample's output directory could not be created.
    #[error("Cannot provision directories for sample '{sample}': {message}")]
    Provision {
        /// The sample identifier.
        sample: String,
        /// The underlying error message.
        message: String,
    },

    /// The run directory itself could not be read.
    #[error("Cannot read run directory {}: {message}", path.display())]
    Io {
        /// The directory that failed.
        path: PathBuf,
        /// The underlying error message.
        message: String,
    },
}

impl DiscoveryError {
    /// Returns the stable error code.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownSample { .. } => "UnknownSampleError",
            Self::UnpairedInput { .. } => "UnpairedInputError",
            Self::Provision { .. } => "ProvisionError",
            Self::Io { .. } => "DiscoveryIoError",
        }
    }

    /// Returns the affected sample, if the error is scoped to one.
    #[must_use]
    pub fn sample(&self) -> Option<&str> {
        match self {
            Self::UnknownSample { sample, .. }
            | Self::UnpairedInput { sample, .. }
            | Self::Provision { sample, .. } => Some(sample),
            Self::Io { .. } => None,
        }
    }
}

/// Error raised when a stage graph is rejected.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Stable error code (e.g. "GRAPH-CYCLE").
    pub code: &'static str,
}

impl GraphValidationError {
    /// Creates a new graph validation error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            code,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// The graph has no stages.
    #[must_use]
    pub fn empty() -> Self {
        Self::new("GRAPH-EMPTY", "Stage graph must declare at least one stage")
    }

    /// Two stages share a name.
    #[must_use]
    pub fn duplicate_stage(name: &str) -> Self {
        Self::new("GRAPH-DUPLICATE", format!("Stage '{name}' is declared more than once"))
            .with_stages(vec![name.to_string()])
    }

    /// A stage depends on itself.
    #[must_use]
    pub fn self_dependency(name: &str) -> Self {
        Self::new("GRAPH-SELF-DEP", format!("Stage '{name}' cannot depend on itself"))
            .with_stages(vec![name.to_string()])
    }

    /// A stage depends on a stage that is not declared.
    #[must_use]
    pub fn unknown_dependency(stage: &str, dependency: &str) -> Self {
        Self::new(
            "GRAPH-MISSING-DEP",
            format!("Stage '{stage}' depends on undeclared stage '{dependency}'"),
        )
        .with_stages(vec![stage.to_string(), dependency.to_string()])
    }

    /// A per-sample stage depends on a per-run stage, or a gather names a
    /// stage that is not per-sample.
    #[must_use]
    pub fn scope_violation(stage: &str, other: &str) -> Self {
        Self::new(
            "GRAPH-SCOPE",
            format!("Stage '{stage}' cannot consume run-scoped or unknown stage '{other}'"),
        )
        .with_stages(vec![stage.to_string(), other.to_string()])
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for GraphValidationError {
    fn from(err: CycleDetectedError) -> Self {
        GraphValidationError {
            message: err.to_string(),
            stages: err.cycle_path,
            code: "GRAPH-CYCLE",
        }
    }
}
