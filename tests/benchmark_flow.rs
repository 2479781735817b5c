//! End-to-end tests of the benchmark flow against an in-memory agent.
//!
//! The fake environment plays the agent: depending on its behavior it
//! completes the ritual, chats without touching the workspace, or fails
//! at the transport level.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use ritual_bench::report::{
    inject_results, render_markdown, BenchmarkReport, ReportStore, RESULTS_END, RESULTS_START,
};
use ritual_bench::runner::{
    AgentReply, BenchmarkConfig, BootstrapFields, CheckKind, Environment, EnvironmentFactory, ModelConfig,
    OrchestrationController, PromptVariant, VerificationEngine,
};
use ritual_bench::EnvironmentError;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Complete,
    Chat,
    Offline,
}

struct FakeEnv {
    model_id: String,
    home: TempDir,
    behavior: Behavior,
}

impl FakeEnv {
    fn workspace(&self) -> PathBuf {
        self.home.path().join("workspace")
    }
}

#[async_trait]
impl Environment for FakeEnv {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn workspace_path(&self) -> PathBuf {
        self.workspace()
    }

    async fn provision(&mut self) -> Result<(), EnvironmentError> {
        let ws = self.workspace();
        fs::create_dir_all(&ws)?;
        fs::write(ws.join("BOOTSTRAP.md"), "# BOOTSTRAP\n\nAsk the user who they are.\n")?;
        fs::write(ws.join("IDENTITY.md"), "- **Name:**\n  _(pick something you like)_\n")?;
        fs::write(
            ws.join("SOUL.md"),
            "You're not a chatbot. You're becoming someone.\nFill this in during your first conversation.\n",
        )?;
        Ok(())
    }

    async fn send_message(&self, _message: &str, _timeout: Duration) -> Result<AgentReply, EnvironmentError> {
        match self.behavior {
            Behavior::Offline => Err(EnvironmentError::Transport("connection refused".into())),
            Behavior::Chat => Ok(AgentReply::ok("Nice to meet you!", Duration::from_millis(3))),
            Behavior::Complete => {
                let ws = self.workspace();
                let _ = fs::remove_file(ws.join("BOOTSTRAP.md"));
                fs::write(
                    ws.join("IDENTITY.md"),
                    "- **Name:** Coral\n- **Creature:** space lobster\n- **Vibe:** warm and casual\n- **Emoji:** \u{1f99e}",
                )?;
                fs::write(ws.join("USER.md"), "The user's name is Alex. Their time zone is Europe/Rome.\n")?;
                fs::write(ws.join("SOUL.md"), "# Soul\n\nI am Coral, a warm space lobster.\n")?;
                Ok(AgentReply::ok("All set!", Duration::from_millis(3)))
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), EnvironmentError> {
        Ok(())
    }

    fn abort(&mut self) {}
}

struct FakeFactory {
    behaviors: Mutex<VecDeque<Behavior>>,
    created: AtomicUsize,
}

impl FakeFactory {
    fn new(behaviors: Vec<Behavior>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(behaviors.into()),
            created: AtomicUsize::new(0),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentFactory for FakeFactory {
    fn create(&self, model: &ModelConfig) -> Result<Box<dyn Environment>, EnvironmentError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Complete);
        Ok(Box::new(FakeEnv {
            model_id: model.model_id.clone(),
            home: TempDir::new()?,
            behavior,
        }))
    }

    async fn tool_version(&self) -> String {
        "2026.1.0".to_string()
    }
}

fn config() -> BenchmarkConfig {
    BenchmarkConfig::default()
        .with_runs(2)
        .with_retries(1)
        .with_turn_timeout(Duration::from_secs(5))
        .with_bootstrap_timeout(Duration::from_secs(60))
        .with_model(ModelConfig::new("qwen3-8b", "qwen3:8b", "http://localhost:11434/v1"))
        .with_variant(PromptVariant::new(
            "natural-guided",
            vec!["Hey! I'm Alex.".to_string(), "Call yourself Coral.".to_string()],
        ))
        .with_variant(PromptVariant::new("structured-unguided", vec!["name: Alex".to_string()]))
}

#[tokio::test]
async fn test_full_batch_report_and_skip_completed() {
    // natural-guided: run 1 offline then retried, run 2 chats only.
    // structured-unguided: both runs complete.
    let factory = FakeFactory::new(vec![Behavior::Offline, Behavior::Complete, Behavior::Chat]);
    let report = OrchestrationController::new(factory.clone(), config())
        .run()
        .await
        .unwrap();

    assert_eq!(factory.created(), 5);
    assert_eq!(report.tool_version, "2026.1.0");
    assert_eq!(report.models.len(), 2);

    let natural = &report.models[0];
    assert_eq!(natural.summary.prompt_variant, "natural-guided");
    assert_eq!(natural.summary.num_runs, 2);
    assert_eq!(natural.summary.perfect_rate, 0.5);
    assert_eq!(natural.summary.per_check_rates.get(CheckKind::Trigger), 0.5);
    assert_eq!(natural.runs[1].score, 0.0);
    assert!(natural.runs[1].turns.iter().all(|t| t.success));

    let structured = &report.models[1];
    assert!(structured.summary.is_perfect());
    assert!(!report.all_perfect());

    let results = TempDir::new().unwrap();
    let store = ReportStore::new(results.path());
    store.save(&report).unwrap();
    let latest = store.load_latest().unwrap();
    assert_eq!(latest.tool_version, report.tool_version);
    assert_eq!(latest.models.len(), 2);
    assert_eq!(latest.models[1].summary.prompt_variant_prompts, vec!["name: Alex".to_string()]);
    assert_eq!(latest.models[0].runs.len(), 2);

    // Same version and prompts: nothing is re-run.
    let factory = FakeFactory::new(Vec::new());
    let rerun = OrchestrationController::new(factory.clone(), config())
        .with_prior_report(Some(latest.clone()))
        .run()
        .await
        .unwrap();
    assert_eq!(factory.created(), 0);
    assert_eq!(rerun.models, latest.models);

    // A changed prompt re-runs only that variant.
    let mut edited = config();
    edited.prompt_variants[1].prompts[0] = "name: Alex.".to_string();
    let factory = FakeFactory::new(Vec::new());
    let partial = OrchestrationController::new(factory.clone(), edited)
        .with_prior_report(Some(latest.clone()))
        .run()
        .await
        .unwrap();
    assert_eq!(factory.created(), 2);
    assert_eq!(partial.models[0], latest.models[0]);
    assert_eq!(partial.models[1].summary.prompt_variant_prompts, vec!["name: Alex.".to_string()]);
}

#[tokio::test]
async fn test_markdown_for_batch_goes_into_readme() {
    let factory = FakeFactory::new(Vec::new());
    let report: BenchmarkReport = OrchestrationController::new(factory, config()).run().await.unwrap();

    let table = render_markdown(&report);
    assert!(table.contains("| Model | Variant |"));
    assert!(table.contains("| qwen3:8b | natural-guided | 2 | 100% |"));
    assert!(table.contains("**2/2** models"));

    let readme = format!("# Bench\n\n{}\nstale\n{}\n", RESULTS_START, RESULTS_END);
    let updated = inject_results(&readme, &table).unwrap();
    assert!(!updated.contains("stale"));
    assert!(updated.contains("OpenClaw **2026.1.0**"));
}

#[test]
fn test_verification_scenarios() {
    let fields = BootstrapFields::default();
    let engine = VerificationEngine::new(fields.identity_expected(), fields.user_expected());
    let dir = TempDir::new().unwrap();
    let ws = dir.path();

    fs::write(
        ws.join("IDENTITY.md"),
        "- **Name:** Coral\n- **Creature:** space lobster\n- **Vibe:** warm and casual\n- **Emoji:** \u{1f99e}",
    )
    .unwrap();
    let result = engine.verify(ws, "m");
    assert!(result.check(CheckKind::Identity).unwrap().passed);
    assert!(result.check(CheckKind::Trigger).unwrap().passed);
    assert!(!result.check(CheckKind::User).unwrap().passed);
    assert_eq!(result.score, 0.5);

    fs::write(ws.join("IDENTITY.md"), "- **Name:**\n  _(pick something you like)_").unwrap();
    let result = engine.verify(ws, "m");
    let identity = result.check(CheckKind::Identity).unwrap();
    assert!(!identity.passed);
    assert!(identity.details.starts_with("Missing fields: name"));
}
