//! Benchmark runner.
//!
//! This module holds everything that happens inside a trial and the loop
//! that schedules trials.
//!
//! # Architecture
//!
//! ```text
//! OrchestrationController → Environment → ConversationDriver → VerificationEngine → aggregate
//! ```
//!
//! For every (model, variant, run) the controller:
//! 1. Creates and provisions a fresh [`Environment`]
//! 2. Drives the variant's prompts through it with the [`ConversationDriver`]
//! 3. Verifies the workspace with the [`VerificationEngine`]
//! 4. Classifies the trial and retries infrastructure failures
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ritual_bench::runner::{load_config, OpenClawFactory, OpenClawOptions, OrchestrationController};
//!
//! let config = load_config(None)?;
//! let factory = Arc::new(OpenClawFactory::new(OpenClawOptions::new(config.gateway.clone())));
//! let report = OrchestrationController::new(factory, config).run().await?;
//!
//! println!("All perfect: {}", report.all_perfect());
//! ```

pub mod config;
pub mod driver;
pub mod environment;
pub mod matcher;
pub mod orchestrator;
pub mod result;
pub mod verifier;

pub use config::{load_config, BenchmarkConfig, BootstrapFields, GatewayConfig, ModelConfig, PromptVariant};
pub use driver::{ConversationDriver, DEADLINE_EXCEEDED};
pub use environment::{
    AgentReply, Environment, EnvironmentFactory, OpenClawEnvironment, OpenClawFactory, OpenClawOptions,
};
pub use matcher::{ExpectedFields, FieldMatcher, FieldQuery, MatcherChain};
pub use orchestrator::OrchestrationController;
pub use result::{
    CheckKind, ConversationResult, ConversationTurn, FileCheck, RunRecord, TrialClass, VerificationResult,
};
pub use verifier::VerificationEngine;
