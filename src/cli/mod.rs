//! Command-line interface for ritual-bench.
//!
//! Provides the `run` and `preflight` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, select_models, Cli, Commands, PreflightArgs, RunArgs};
