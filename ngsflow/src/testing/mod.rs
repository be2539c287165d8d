//! Testing utilities for ngsflow pipelines.
//!
//! This module provides:
//! - A scripted tool invoker that records calls instead of spawning processes
//! - Configuration and run directory fixtures
//! - Assertions over pipeline reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_dependency_integrity, assert_every_stage_recorded, assert_stage_reason,
    assert_stage_status,
};
pub use fixtures::{
    test_config, test_config_file, write_artifact, write_paired_reads, TEST_CONFIG_YAML,
    TEST_PANEL,
};
pub use mocks::{ScriptedBehavior, ScriptedCall, ScriptedInvoker};
