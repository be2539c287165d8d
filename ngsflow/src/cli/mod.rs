//! Command-line interface for ngsflow.
//!
//! Provides the `run` command, which drives a run directory through the
//! stage graph, and the `plan` command, which prints the graph.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, PlanArgs, RunArgs};
