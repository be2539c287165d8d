//! Stage outcome types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Terminal outcome of one stage for one sample (or for the run).
///
/// `Exists` and `Success` are forward progress. `Error` and `Skipped` halt
/// only the stages that depend on this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The artifact was already present; the tool was not invoked.
    Exists,
    /// The tool ran and produced its artifact.
    Success,
    /// The stage was attempted and failed.
    Error(StageFailure),
    /// The stage was not attempted.
    Skipped(SkipReason),
}

impl StageOutcome {
    /// Returns true for `Exists` and `Success`.
    #[must_use]
    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Exists | Self::Success)
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns true if the stage was not attempted.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Returns the short status label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Success => "success",
            Self::Error(_) => "error",
            Self::Skipped(_) => "skipped",
        }
    }

    /// Returns the stable code of the failure or skip reason, if any.
    #[must_use]
    pub fn reason_kind(&self) -> Option<&'static str> {
        match self {
            Self::Exists | Self::Success => None,
            Self::Error(failure) => Some(failure.kind()),
            Self::Skipped(reason) => Some(reason.kind()),
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exists | Self::Success => write!(f, "{}", self.label()),
            Self::Error(failure) => write!(f, "error ({failure})"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

/// Why an attempted stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// The tool binary is missing or not executable.
    #[error("executable for {tool} not found: {program}")]
    ExecutableNotFound {
        /// The tool key.
        tool: String,
        /// The program that could not be started.
        program: String,
    },

    /// The tool exited with a nonzero status.
    #[error("{tool} exited with {}: {stderr_tail}", exit_label(.exit_code))]
    ToolInvocation {
        /// The tool key.
        tool: String,
        /// Exit code, or `None` when killed by a signal.
        exit_code: Option<i32>,
        /// Tail of the captured stderr.
        stderr_tail: String,
    },

    /// The tool exited cleanly but left no usable artifact.
    #[error("tool finished but artifact {artifact} is missing or empty")]
    MissingOutput {
        /// The expected artifact path.
        artifact: String,
    },

    /// Another run held the stage lock for too long.
    #[error("timed out waiting for lock {lock}")]
    LockTimeout {
        /// The lock file path.
        lock: String,
    },

    /// Filesystem or process plumbing failed.
    #[error("I/O error: {message}")]
    Io {
        /// The error message.
        message: String,
    },

    /// The tool was killed because the run was cancelled.
    #[error("cancelled while running")]
    Cancelled,
}

impl StageFailure {
    /// Returns the stable error code.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound { .. } => "ExecutableNotFoundError",
            Self::ToolInvocation { .. } => "ToolInvocationError",
            Self::MissingOutput { .. } => "MissingOutputError",
            Self::LockTimeout { .. } => "LockTimeoutError",
            Self::Io { .. } => "StageIoError",
            Self::Cancelled => "CancelledError",
        }
    }

    /// Creates an I/O failure from any displayable error.
    #[must_use]
    pub fn io(err: impl fmt::Display) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("status {c}"))
}

/// Why a stage was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// One or more dependencies did not reach `Exists` or `Success`.
    #[error("missing input from {}", stages.join(", "))]
    MissingDependency {
        /// The unmet dependencies.
        stages: Vec<String>,
    },

    /// The run was cancelled before the stage started.
    #[error("run cancelled")]
    Cancelled,
}

impl SkipReason {
    /// Returns the stable error code.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingDependency { .. } => "MissingInputError",
            Self::Cancelled => "Cancelled",
        }
    }
}
