//! Error types for ritual-bench operations.
//!
//! Defines error types for the major subsystems:
//! - Configuration loading and validation
//! - Environment provisioning and agent transport
//! - Report persistence
//! - Batch-level fatal preconditions
//!
//! Trial-scoped failures are deliberately absent here: a failed turn or a
//! failed provisioning step is recorded inside the trial's `RunRecord`
//! and never propagated as an `Err`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an [`Environment`](crate::runner::Environment).
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("Install failed: {0}")]
    Install(String),

    #[error("Onboarding failed (exit {code}): {stderr}")]
    Onboard { code: i32, stderr: String },

    #[error("Failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Environment is not provisioned")]
    NotProvisioned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while persisting or loading reports.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

/// Batch-level errors. These are the only errors that stop a benchmark
/// invocation before every trial has run.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("No models configured")]
    NoModels,

    #[error("No matching models found for: {0}")]
    NoMatchingModels(String),

    #[error("{0} pre-flight check(s) failed")]
    PreflightFailed(usize),

    #[error("Benchmark interrupted")]
    Interrupted,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Report(#[from] ReportError),
}
