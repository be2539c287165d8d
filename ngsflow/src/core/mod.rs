//! Core domain model types.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage outcomes with structured failure and skip reasons
//! - Samples and stage targets
//! - Artifact probing and the run directory layout

mod artifact;
mod layout;
mod sample;
mod status;

pub use artifact::{ArtifactProbe, ProbeResult};
pub use layout::{RunLayout, LOCK_DIR, RUN_DIR, SAMPLE_SUBDIRS};
pub use sample::{Sample, StageTarget};
pub use status::{SkipReason, StageFailure, StageOutcome};
