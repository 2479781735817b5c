//! Conversation driver.
//!
//! Sends the variant's prompts to an [`Environment`] one turn at a time,
//! bounded by a per-turn timeout and a global deadline, and records every
//! turn. A failed turn does not stop the conversation; the agent may still
//! recover on a later prompt.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::environment::Environment;
use super::result::{CheckKind, ConversationResult, ConversationTurn, ERROR_PAYLOAD_PREFIX};
use super::verifier::trigger_present;

/// Error recorded for turns that never ran because the deadline passed.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Drives one conversation.
#[derive(Debug, Clone, Copy)]
pub struct ConversationDriver {
    per_turn_timeout: Duration,
}

impl ConversationDriver {
    pub fn new(per_turn_timeout: Duration) -> Self {
        Self { per_turn_timeout }
    }

    /// Runs every prompt in order until they are exhausted or `deadline`
    /// passes, then checks the trigger file once.
    pub async fn run(&self, env: &dyn Environment, prompts: &[String], deadline: Instant) -> ConversationResult {
        let started = Instant::now();
        let mut result = ConversationResult::new(env.model_id());

        for (idx, prompt) in prompts.iter().enumerate() {
            info!(turn = idx + 1, total = prompts.len(), "Conversation turn");

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(turn = idx + 1, "Global deadline reached, stopping conversation");
                result
                    .turns
                    .push(ConversationTurn::failed(prompt.as_str(), "", Duration::ZERO, DEADLINE_EXCEEDED));
                break;
            }

            let turn = self.run_turn(env, prompt, self.per_turn_timeout.min(remaining)).await;
            if !turn.success {
                warn!(
                    turn = idx + 1,
                    "Turn failed: {}",
                    turn.error.as_deref().unwrap_or_default()
                );
            }
            result.turns.push(turn);
        }

        result.total_duration = started.elapsed();
        result.ritual_completed = !trigger_present(&env.workspace_path());

        if result.ritual_completed {
            info!("{} was deleted; ritual completed", CheckKind::Trigger.filename());
        } else {
            warn!("{} still exists; ritual did not complete", CheckKind::Trigger.filename());
        }
        result
    }

    async fn run_turn(&self, env: &dyn Environment, prompt: &str, timeout: Duration) -> ConversationTurn {
        let started = Instant::now();
        // A turn never outlives its budget, whatever the environment does.
        let outcome = tokio::time::timeout(timeout, env.send_message(prompt, timeout)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(reply)) => {
                if reply.ok && !reply.text.starts_with(ERROR_PAYLOAD_PREFIX) {
                    ConversationTurn::succeeded(prompt, reply.text, reply.elapsed)
                } else {
                    let error = reply.text.clone();
                    ConversationTurn::failed(prompt, reply.text, reply.elapsed, error)
                }
            }
            Ok(Err(e)) => ConversationTurn::failed(prompt, "", elapsed, e.to_string()),
            Err(_) => ConversationTurn::failed(
                prompt,
                "",
                elapsed,
                format!("Turn timed out after {:.1?}", timeout),
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory environment shared by driver and controller tests.

    use std::collections::VecDeque;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::EnvironmentError;
    use crate::runner::config::ModelConfig;
    use crate::runner::environment::{AgentReply, Environment, EnvironmentFactory};
    use crate::runner::result::CheckKind;

    /// One scripted reaction to a message.
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Reply successfully.
        Reply(&'static str),
        /// Reply successfully after a delay.
        Slow(&'static str, Duration),
        /// Agent exited non-zero.
        AgentError(&'static str),
        /// Transport failure.
        Fail(&'static str),
        /// Reply and write workspace files as a completed ritual would.
        Complete,
    }

    /// Counters shared between a factory and the environments it creates.
    #[derive(Debug, Default)]
    pub struct Counters {
        pub created: AtomicUsize,
        pub provisioned: AtomicUsize,
        pub messages: AtomicUsize,
        pub teardowns: AtomicUsize,
        pub aborts: AtomicUsize,
    }

    impl Counters {
        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    pub struct ScriptedEnv {
        model_id: String,
        dir: TempDir,
        steps: Mutex<VecDeque<Step>>,
        provision_error: Option<&'static str>,
        counters: Arc<Counters>,
        released: bool,
    }

    impl ScriptedEnv {
        pub fn new(model_id: &str, steps: Vec<Step>) -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("workspace")).unwrap();
            fs::write(
                dir.path().join("workspace").join(CheckKind::Trigger.filename()),
                "# BOOTSTRAP\n",
            )
            .unwrap();
            Self {
                model_id: model_id.to_string(),
                dir,
                steps: Mutex::new(steps.into()),
                provision_error: None,
                counters: Arc::new(Counters::default()),
                released: false,
            }
        }

        pub fn with_provision_error(mut self, error: &'static str) -> Self {
            self.provision_error = Some(error);
            self
        }

        pub fn with_counters(mut self, counters: Arc<Counters>) -> Self {
            self.counters = counters;
            self
        }

        fn write_completed_workspace(&self) {
            let ws = self.workspace_path();
            let _ = fs::remove_file(ws.join(CheckKind::Trigger.filename()));
            fs::write(
                ws.join(CheckKind::Identity.filename()),
                "- **Name:** Coral\n- **Creature:** space lobster\n- **Vibe:** warm and casual\n- **Emoji:** \u{1f99e}\n",
            )
            .unwrap();
            fs::write(
                ws.join(CheckKind::User.filename()),
                "- **Name:** Alex\n- **Timezone:** Europe/Rome\n",
            )
            .unwrap();
            fs::write(ws.join(CheckKind::Persona.filename()), "# SOUL\n\nCoral, warm and curious.\n").unwrap();
        }
    }

    #[async_trait]
    impl Environment for ScriptedEnv {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn workspace_path(&self) -> PathBuf {
            self.dir.path().join("workspace")
        }

        async fn provision(&mut self) -> Result<(), EnvironmentError> {
            self.counters.provisioned.fetch_add(1, Ordering::SeqCst);
            match self.provision_error {
                Some(e) => Err(EnvironmentError::Install(e.to_string())),
                None => Ok(()),
            }
        }

        async fn send_message(&self, _message: &str, _timeout: Duration) -> Result<AgentReply, EnvironmentError> {
            self.counters.messages.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Reply("ok"));
            match step {
                Step::Reply(text) => Ok(AgentReply::ok(text, Duration::from_millis(5))),
                Step::Slow(text, delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(AgentReply::ok(text, delay))
                }
                Step::AgentError(stderr) => Ok(AgentReply::error(stderr, Duration::from_millis(5))),
                Step::Fail(reason) => Err(EnvironmentError::Transport(reason.to_string())),
                Step::Complete => {
                    self.write_completed_workspace();
                    Ok(AgentReply::ok("done", Duration::from_millis(5)))
                }
            }
        }

        async fn teardown(&mut self) -> Result<(), EnvironmentError> {
            if !self.released {
                self.released = true;
                self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn abort(&mut self) {
            if !self.released {
                self.released = true;
                self.counters.aborts.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// A scripted trial: provisioning outcome plus message steps.
    #[derive(Debug, Clone)]
    pub struct Script {
        pub provision_error: Option<&'static str>,
        pub steps: Vec<Step>,
    }

    impl Script {
        pub fn steps(steps: Vec<Step>) -> Self {
            Self {
                provision_error: None,
                steps,
            }
        }

        pub fn provision_fails(error: &'static str) -> Self {
            Self {
                provision_error: Some(error),
                steps: Vec::new(),
            }
        }
    }

    /// Hands out one script per created environment, in order. When the
    /// scripts run out, environments complete the ritual.
    pub struct ScriptedFactory {
        scripts: Mutex<VecDeque<Script>>,
        version: String,
        pub counters: Arc<Counters>,
    }

    impl ScriptedFactory {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                version: "1.0.0".to_string(),
                counters: Arc::new(Counters::default()),
            }
        }

        pub fn with_version(mut self, version: &str) -> Self {
            self.version = version.to_string();
            self
        }
    }

    #[async_trait]
    impl EnvironmentFactory for ScriptedFactory {
        fn create(&self, model: &ModelConfig) -> Result<Box<dyn Environment>, EnvironmentError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Script::steps(vec![Step::Complete]));
            let mut env = ScriptedEnv::new(&model.model_id, script.steps).with_counters(self.counters.clone());
            if let Some(e) = script.provision_error {
                env = env.with_provision_error(e);
            }
            Ok(Box::new(env))
        }

        async fn tool_version(&self) -> String {
            self.version.clone()
        }
    }
}
