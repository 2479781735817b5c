//! ritual-bench: benchmark for the OpenClaw first-run identity ritual.
//!
//! Each trial provisions an isolated OpenClaw install, drives the agent
//! through its bootstrap conversation, verifies the workspace files it
//! leaves behind and aggregates the scores per model and prompt variant.

// Core modules
pub mod cli;
pub mod error;
pub mod preflight;
pub mod report;
pub mod runner;

// Re-export commonly used error types
pub use error::{BenchError, ConfigError, EnvironmentError, ReportError};
