//! # ngsflow
//!
//! Resumable orchestration of multi-stage NGS panel processing.
//!
//! Every sample in a run directory is driven through a declarative stage
//! graph (alignment, recalibration, four independent variant callers merged
//! into one VCF, annotation, QC) and the run finishes with copy-number
//! analysis across all samples. Each stage invokes one external tool; a
//! stage whose artifact already exists is never re-run, so re-running the
//! same command resumes an interrupted run.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ngsflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = RunConfig::load("ngsflow.yaml".as_ref(), "/runs/240101", "cardiac")?;
//! let orchestrator = PipelineOrchestrator::new(
//!     standard_graph()?,
//!     Arc::new(config),
//!     Arc::new(ProcessInvoker::new()),
//! );
//! let report = orchestrator.run(&[]).await?;
//! println!("{}", report.summary());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cli;
pub mod config;
pub mod core;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod report;
pub mod stages;
pub mod testing;
pub mod tools;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{RunConfig, ToolKind};
    pub use crate::core::{ArtifactProbe, Sample, SkipReason, StageFailure, StageOutcome};
    pub use crate::discovery::{DirectoryProvisioner, SampleDiscovery};
    pub use crate::errors::{
        ConfigurationError, DiscoveryError, GraphValidationError, PipelineError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::catalog::standard_graph;
    pub use crate::pipeline::{PipelineOrchestrator, StageDescriptor, StageGraph, StageScope};
    pub use crate::report::{PipelineReport, StageRecord};
    pub use crate::stages::StageRunner;
    pub use crate::tools::{CommandTemplate, ProcessInvoker, ToolInvoker};
}
