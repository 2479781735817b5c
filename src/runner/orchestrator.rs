//! Benchmark orchestration.
//!
//! The [`OrchestrationController`] walks every model, variant and run in
//! sequence. Each trial goes through
//! `Provision -> Converse -> Verify -> Classify -> {Accept | Retry}`:
//!
//! - a trial whose conversation carries an error, or has any failed turn,
//!   is an infrastructure failure and is retried up to `retries` times;
//! - a trial whose turns all went through is a behavioral outcome and is
//!   accepted whatever it scored.
//!
//! Only one environment is alive at a time. It is owned by an
//! [`ActiveTrial`] guard that tears it down on every exit path, including
//! an external shutdown signal.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::config::{BenchmarkConfig, ModelConfig, PromptVariant};
use super::driver::ConversationDriver;
use super::environment::{Environment, EnvironmentFactory};
use super::result::{ConversationResult, RunRecord, TrialClass, VerificationResult};
use super::verifier::VerificationEngine;
use crate::error::BenchError;
use crate::preflight::warm_up_model;
use crate::report::{aggregate, BenchmarkReport, ReportEntry};

// ---------------------------------------------------------------------------
// Active trial guard
// ---------------------------------------------------------------------------

/// Owns the single live environment. `release` tears it down once; a
/// guard dropped without release aborts the environment instead.
struct ActiveTrial {
    env: Box<dyn Environment>,
    released: bool,
}

impl ActiveTrial {
    fn new(env: Box<dyn Environment>) -> Self {
        Self { env, released: false }
    }

    fn env_mut(&mut self) -> &mut dyn Environment {
        self.env.as_mut()
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.env.teardown().await {
            warn!(model = %self.env.model_id(), "Teardown failed: {}", e);
            self.env.abort();
        }
        self.released = true;
    }
}

impl Drop for ActiveTrial {
    fn drop(&mut self) {
        if !self.released {
            warn!(model = %self.env.model_id(), "Trial dropped before teardown, aborting environment");
            self.env.abort();
        }
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender
/// is gone without having set it.
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let stopped = rx.wait_for(|stop| *stop).await.is_ok();
    if !stopped {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Runs the whole benchmark and produces the report.
pub struct OrchestrationController {
    factory: Arc<dyn EnvironmentFactory>,
    config: BenchmarkConfig,
    driver: ConversationDriver,
    verifier: VerificationEngine,
    prior: Option<BenchmarkReport>,
    shutdown: watch::Receiver<bool>,
    warm_up: Option<reqwest::Client>,
}

impl OrchestrationController {
    pub fn new(factory: Arc<dyn EnvironmentFactory>, config: BenchmarkConfig) -> Self {
        let fields = &config.bootstrap_fields;
        let verifier = VerificationEngine::new(fields.identity_expected(), fields.user_expected());
        let driver = ConversationDriver::new(config.agent_turn_timeout);
        // A receiver whose sender is already gone never reports shutdown.
        let (_, shutdown) = watch::channel(false);
        Self {
            factory,
            config,
            driver,
            verifier,
            prior: None,
            shutdown,
            warm_up: None,
        }
    }

    /// Enables skip-completed against `prior`.
    pub fn with_prior_report(mut self, prior: Option<BenchmarkReport>) -> Self {
        self.prior = prior;
        self
    }

    /// Stops the batch when the flag behind `shutdown` becomes true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Sends a tiny completion to each model before its first trial.
    pub fn with_warm_up(mut self, enabled: bool) -> Self {
        self.warm_up = enabled.then(reqwest::Client::new);
        self
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Runs every (model, variant, run) trial in order.
    ///
    /// Trial failures never surface here; they are recorded in the
    /// report. The only errors are an empty model list and an interrupt,
    /// in which case the active environment has already been torn down.
    pub async fn run(&self) -> Result<BenchmarkReport, BenchError> {
        if self.config.models.is_empty() {
            return Err(BenchError::NoModels);
        }

        let tool_version = self.factory.tool_version().await;
        let variants = self.config.variants();
        let runs = self.config.runs_per_model.max(1);

        info!(
            version = %tool_version,
            models = self.config.models.len(),
            variants = %variants.iter().map(|v| v.name.as_str()).collect::<Vec<_>>().join(", "),
            runs,
            retries = self.config.retries,
            "Starting OpenClaw bootstrap benchmark"
        );

        let mut entries = Vec::new();
        for model in &self.config.models {
            self.check_shutdown()?;

            let reused: Vec<Option<ReportEntry>> = variants
                .iter()
                .map(|variant| self.reusable_entry(model, variant, &tool_version))
                .collect();
            if reused.iter().any(Option::is_none) {
                self.warm_up(model).await;
            }

            for (variant, reused) in variants.iter().zip(reused) {
                if let Some(entry) = reused {
                    entries.push(entry);
                    continue;
                }

                let mut records = Vec::with_capacity(runs as usize);
                for run_idx in 1..=runs {
                    info!(
                        model = %model.name,
                        variant = %variant.name,
                        "Run {}/{}",
                        run_idx,
                        runs
                    );
                    let record = self.run_with_retries(model, variant, run_idx).await?;
                    info!(model = %model.name, "Run {} score: {:.0}%", run_idx, record.score() * 100.0);
                    records.push(record);
                }

                let summary = aggregate(&model.model_id, &variant.name, &variant.prompts, &records);
                entries.push(ReportEntry::fresh(summary, &records));
            }
        }

        Ok(BenchmarkReport::new(tool_version, entries))
    }

    fn check_shutdown(&self) -> Result<(), BenchError> {
        if *self.shutdown.borrow() {
            return Err(BenchError::Interrupted);
        }
        Ok(())
    }

    async fn warm_up(&self, model: &ModelConfig) {
        let Some(http) = &self.warm_up else {
            return;
        };
        info!(model = %model.model_id, "Warming up model");
        if warm_up_model(http, model).await {
            info!(model = %model.model_id, "Model is loaded and responding");
        } else {
            warn!(
                model = %model.model_id,
                "Warm-up failed, the model may not be available. Proceeding anyway"
            );
        }
    }

    /// Prior entry for the pair, if it was produced with the same tool
    /// version and the same prompt text.
    fn reusable_entry(&self, model: &ModelConfig, variant: &PromptVariant, version: &str) -> Option<ReportEntry> {
        let prior = self.prior.as_ref()?.prior(&model.model_id, &variant.name)?;
        let reasons = prior.mismatch_reasons(version, &variant.prompts);
        if reasons.is_empty() {
            info!(
                model = %model.model_id,
                variant = %variant.name,
                "Skipping, already in latest results (same version and prompts)"
            );
            Some(prior.entry.clone())
        } else {
            warn!(
                model = %model.model_id,
                variant = %variant.name,
                "Exists in latest results but {}; re-running",
                reasons.join(" and ")
            );
            None
        }
    }

    /// Runs one trial, retrying infrastructure failures. The last record
    /// is kept once retries are exhausted.
    async fn run_with_retries(
        &self,
        model: &ModelConfig,
        variant: &PromptVariant,
        run_idx: u32,
    ) -> Result<RunRecord, BenchError> {
        let retries = self.config.retries;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                warn!(
                    model = %model.name,
                    variant = %variant.name,
                    run = run_idx,
                    "Retry {}/{}",
                    attempt,
                    retries
                );
            }

            let record = self.run_trial(model, variant).await?;
            match record.classify() {
                TrialClass::Behavioral => return Ok(record),
                TrialClass::Infrastructure if attempt < retries => {
                    warn!(model = %model.name, "Infrastructure issue detected, will retry");
                }
                TrialClass::Infrastructure => {
                    if retries > 0 {
                        warn!(model = %model.name, "All retries exhausted, keeping last result");
                    }
                    return Ok(record);
                }
            }
            attempt += 1;
        }
    }

    /// One attempt with a fresh environment. Returns `Interrupted` if the
    /// shutdown flag fires while the trial is running.
    async fn run_trial(&self, model: &ModelConfig, variant: &PromptVariant) -> Result<RunRecord, BenchError> {
        self.check_shutdown()?;

        let env = match self.factory.create(model) {
            Ok(env) => env,
            Err(e) => {
                error!(model = %model.model_id, "Failed to create environment: {}", e);
                return Ok(RunRecord::new(
                    ConversationResult::failed(model.model_id.as_str(), e.to_string()),
                    VerificationResult::not_run(model.model_id.as_str(), "environment not created"),
                ));
            }
        };

        let mut trial = ActiveTrial::new(env);
        let outcome = tokio::select! {
            record = self.execute(trial.env_mut(), variant) => Some(record),
            _ = wait_for_shutdown(self.shutdown.clone()) => None,
        };
        if outcome.is_none() {
            warn!(model = %model.model_id, "Interrupted, cleaning up active environment");
        }
        trial.release().await;
        outcome.ok_or(BenchError::Interrupted)
    }

    async fn execute(&self, env: &mut dyn Environment, variant: &PromptVariant) -> RunRecord {
        let model_id = env.model_id().to_string();

        if let Err(e) = env.provision().await {
            error!(model = %model_id, "Provisioning failed: {}", e);
            return RunRecord::new(
                ConversationResult::failed(model_id.as_str(), e.to_string()),
                VerificationResult::not_run(model_id.as_str(), "provisioning failed"),
            );
        }

        let deadline = Instant::now() + self.config.bootstrap_timeout;
        let conversation = self.driver.run(&*env, &variant.prompts, deadline).await;
        let verification = self.verifier.verify(&env.workspace_path(), &model_id);
        RunRecord::new(conversation, verification)
    }
}
