//! Stage graph declaration and execution.
//!
//! This module provides:
//! - Stage descriptors and their scope
//! - The validated stage graph
//! - The standard NGS stage catalog
//! - The orchestrator driving samples through the graph

pub mod catalog;
mod graph;
mod orchestrator;
mod spec;

pub use graph::StageGraph;
pub use orchestrator::{artifact_path, PipelineOrchestrator, IDENTITY_FILE};
pub use spec::{Gather, StageAction, StageDescriptor, StageScope, Transform, TransformKind};
