//! Benchmark configuration.
//!
//! Reads `config.yaml` and provides typed access to every setting the
//! controller needs. String values that may carry secrets (`api_key`) are
//! expanded against the process environment at load time:
//!
//! ```text
//! $VAR   ${VAR}   ${VAR:-default}
//! ```
//!
//! An unset variable without a default is left verbatim, so harmless
//! dummy keys like `"ollama"` pass through untouched.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use super::matcher::ExpectedFields;
use crate::error::ConfigError;

/// Smallest context window the agent runtime accepts.
pub const MIN_CONTEXT_WINDOW: u32 = 16_000;

/// Upper clamp for the patched context window.
pub const MAX_CONTEXT_WINDOW: u32 = 128_000;

/// Used when neither the config nor the model server reports a value.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;

/// Name of the implicit variant built from a legacy `bootstrap_prompts` list.
pub const DEFAULT_VARIANT: &str = "default";

/// A single model under test. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Display name, used for `--models` filtering and temp dir prefixes.
    pub name: String,
    /// Provider label passed through to onboarding.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Onboarding auth choice.
    #[serde(default = "default_auth_choice")]
    pub auth_choice: String,
    /// OpenAI-compatible endpoint, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Model identifier on the server. Also the identity used in reports.
    pub model_id: String,
    /// API key (after env interpolation). Empty when not needed.
    #[serde(default)]
    pub api_key: String,
    /// API compatibility flavour.
    #[serde(default = "default_compatibility")]
    pub compatibility: String,
    /// Declared context window in tokens.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
}

impl ModelConfig {
    /// Creates a model entry with defaults for the optional fields.
    pub fn new(
        name: impl Into<String>,
        model_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider: default_provider(),
            auth_choice: default_auth_choice(),
            base_url: base_url.into(),
            model_id: model_id.into(),
            api_key: String::new(),
            compatibility: default_compatibility(),
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    /// Name safe for use in filesystem paths (no `:` or `/`).
    pub fn safe_name(&self) -> String {
        self.name.replace([':', '/'], "_")
    }

    /// True when the server runs on this machine.
    pub fn is_local(&self) -> bool {
        self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1")
    }
}

fn default_provider() -> String {
    "custom".to_string()
}

fn default_auth_choice() -> String {
    "custom-api-key".to_string()
}

fn default_compatibility() -> String {
    "openai".to_string()
}

fn default_context_window() -> u32 {
    DEFAULT_CONTEXT_WINDOW
}

/// Gateway service settings. The port is shared by every trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

fn default_port() -> u16 {
    18789
}

fn default_bind() -> String {
    "loopback".to_string()
}

/// Expected field values. They are injected into prompt templates and
/// checked by the verifier afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootstrapFields {
    pub user_name: String,
    pub user_timezone: String,
    pub user_preferences: String,
    pub agent_name: String,
    pub agent_creature: String,
    pub agent_vibe: String,
    pub agent_emoji: String,
}

impl Default for BootstrapFields {
    fn default() -> Self {
        Self {
            user_name: "Alex".to_string(),
            user_timezone: "Europe/Rome".to_string(),
            user_preferences: "concise answers, no filler, direct and helpful".to_string(),
            agent_name: "Coral".to_string(),
            agent_creature: "space lobster".to_string(),
            agent_vibe: "warm and casual".to_string(),
            agent_emoji: "\u{1f99e}".to_string(),
        }
    }
}

impl BootstrapFields {
    /// Variables available to prompt templates as `{name}`.
    pub fn template_vars(&self) -> HashMap<&'static str, &str> {
        HashMap::from([
            ("user_name", self.user_name.as_str()),
            ("user_timezone", self.user_timezone.as_str()),
            ("user_preferences", self.user_preferences.as_str()),
            ("agent_name", self.agent_name.as_str()),
            ("agent_creature", self.agent_creature.as_str()),
            ("agent_vibe", self.agent_vibe.as_str()),
            ("agent_emoji", self.agent_emoji.as_str()),
        ])
    }

    /// Expectations for the identity file.
    pub fn identity_expected(&self) -> ExpectedFields {
        ExpectedFields::new()
            .with("name", &self.agent_name)
            .with("creature", &self.agent_creature)
            .with("vibe", &self.agent_vibe)
            .with("emoji", &self.agent_emoji)
    }

    /// Expectations for the user file.
    pub fn user_expected(&self) -> ExpectedFields {
        ExpectedFields::new()
            .with("name", &self.user_name)
            .with("timezone", &self.user_timezone)
    }
}

/// A named, ordered set of prompts. Turn order follows prompt order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptVariant {
    pub name: String,
    pub prompts: Vec<String>,
}

impl PromptVariant {
    pub fn new(name: impl Into<String>, prompts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            prompts,
        }
    }
}

/// Top-level benchmark configuration.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Prompt variants in declaration order.
    pub prompt_variants: Vec<PromptVariant>,
    /// Timeout for a single agent turn.
    pub agent_turn_timeout: Duration,
    /// Deadline for the whole conversation.
    pub bootstrap_timeout: Duration,
    /// Extra attempts granted to infrastructure failures.
    pub retries: u32,
    /// Independent runs per (model, variant).
    pub runs_per_model: u32,
    /// Gateway settings.
    pub gateway: GatewayConfig,
    /// Parent directory for the per-trial temp homes. System temp dir when unset.
    pub openclaw_home: Option<PathBuf>,
    /// Models to benchmark, in order.
    pub models: Vec<ModelConfig>,
    /// Expected field values.
    pub bootstrap_fields: BootstrapFields,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            prompt_variants: Vec::new(),
            agent_turn_timeout: Duration::from_secs(120),
            bootstrap_timeout: Duration::from_secs(600),
            retries: 1,
            runs_per_model: 5,
            gateway: GatewayConfig::default(),
            openclaw_home: None,
            models: Vec::new(),
            bootstrap_fields: BootstrapFields::default(),
        }
    }
}

impl BenchmarkConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        raw.into_config()
    }

    /// Sets the number of runs per (model, variant). Clamped to at least one.
    pub fn with_runs(mut self, runs: u32) -> Self {
        self.runs_per_model = runs.max(1);
        self
    }

    /// Sets the retry bound.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the per-turn timeout.
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.agent_turn_timeout = timeout;
        self
    }

    /// Sets the conversation deadline.
    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    /// Adds a model.
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.models.push(model);
        self
    }

    /// Adds a prompt variant.
    pub fn with_variant(mut self, variant: PromptVariant) -> Self {
        self.prompt_variants.push(variant);
        self
    }

    /// Variants to run. An empty configuration yields a single empty
    /// `default` variant so every model still gets a (trivial) trial.
    pub fn variants(&self) -> Vec<PromptVariant> {
        if self.prompt_variants.is_empty() {
            vec![PromptVariant::new(DEFAULT_VARIANT, Vec::new())]
        } else {
            self.prompt_variants.clone()
        }
    }

    /// Keeps only the models whose name is listed. Returns the names that
    /// matched nothing.
    pub fn retain_models(&mut self, names: &[String]) -> Vec<String> {
        let unknown = names
            .iter()
            .filter(|n| !self.models.iter().any(|m| &m.name == *n))
            .cloned()
            .collect();
        self.models.retain(|m| names.contains(&m.name));
        unknown
    }
}

/// Loads configuration from a YAML file. Defaults to `./config.yaml`.
pub fn load_config(path: Option<&Path>) -> Result<BenchmarkConfig, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }
    let content = fs::read_to_string(&path)?;
    BenchmarkConfig::from_yaml_str(&content)
}

// ---------------------------------------------------------------------------
// Raw YAML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    prompt_variants: Option<serde_yaml::Mapping>,
    #[serde(default)]
    bootstrap_prompts: Option<Vec<String>>,
    #[serde(default = "default_turn_timeout_secs")]
    agent_turn_timeout: u64,
    #[serde(default = "default_bootstrap_timeout_secs")]
    bootstrap_timeout: u64,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default = "default_runs")]
    runs_per_model: u32,
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    openclaw_home: String,
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    bootstrap_fields: BootstrapFields,
}

fn default_turn_timeout_secs() -> u64 {
    120
}

fn default_bootstrap_timeout_secs() -> u64 {
    600
}

fn default_retries() -> u32 {
    1
}

fn default_runs() -> u32 {
    5
}

/// A variant's prompts may be a list or a single string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptList {
    Many(Vec<String>),
    One(String),
}

impl RawConfig {
    fn into_config(self) -> Result<BenchmarkConfig, ConfigError> {
        let vars = self.bootstrap_fields.template_vars();
        let mut variants = Vec::new();

        match (self.prompt_variants, self.bootstrap_prompts) {
            (Some(mapping), _) if !mapping.is_empty() => {
                for (key, value) in mapping {
                    let name = key.as_str().ok_or_else(|| ConfigError::InvalidValue {
                        key: "prompt_variants".to_string(),
                        message: format!("variant name must be a string, got {:?}", key),
                    })?;
                    let prompts = match serde_yaml::from_value::<PromptList>(value) {
                        Ok(PromptList::Many(list)) => list,
                        Ok(PromptList::One(single)) => vec![single],
                        Err(e) => {
                            return Err(ConfigError::InvalidValue {
                                key: format!("prompt_variants.{}", name),
                                message: e.to_string(),
                            })
                        }
                    };
                    variants.push(PromptVariant::new(
                        name,
                        prompts.iter().map(|p| render_prompt(p, &vars)).collect(),
                    ));
                }
            }
            (_, Some(legacy)) => {
                variants.push(PromptVariant::new(
                    DEFAULT_VARIANT,
                    legacy.iter().map(|p| render_prompt(p, &vars)).collect(),
                ));
            }
            _ => {}
        }

        let models = self
            .models
            .into_iter()
            .map(|mut m| {
                m.api_key = expand_env(&m.api_key);
                m
            })
            .collect();

        let openclaw_home = if self.openclaw_home.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(expand_env(&self.openclaw_home)))
        };

        Ok(BenchmarkConfig {
            prompt_variants: variants,
            agent_turn_timeout: Duration::from_secs(self.agent_turn_timeout),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout),
            retries: self.retries,
            runs_per_model: self.runs_per_model.max(1),
            gateway: self.gateway,
            openclaw_home,
            models,
            bootstrap_fields: self.bootstrap_fields,
        })
    }
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

fn env_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("env interpolation regex is valid")
    })
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("template regex is valid"))
}

/// Expands `$VAR`, `${VAR}` and `${VAR:-default}` from the process environment.
pub fn expand_env(value: &str) -> String {
    expand_env_with(value, |name| std::env::var(name).ok())
}

/// Expands variable references using `lookup`.
pub fn expand_env_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env_regex()
        .replace_all(value, |caps: &Captures| {
            let whole = caps[0].to_string();
            if let Some(name) = caps.get(1) {
                return lookup(name.as_str())
                    .or_else(|| caps.get(2).map(|d| d.as_str().to_string()))
                    .unwrap_or(whole);
            }
            match caps.get(3) {
                Some(name) => lookup(name.as_str()).unwrap_or(whole),
                None => whole,
            }
        })
        .into_owned()
}

/// Substitutes `{field}` placeholders. A prompt that references any
/// unknown placeholder is returned unchanged.
pub fn render_prompt(template: &str, vars: &HashMap<&'static str, &str>) -> String {
    let re = template_regex();
    let all_known = re
        .captures_iter(template)
        .all(|caps| vars.contains_key(&caps[1]));
    if !all_known {
        return template.to_string();
    }
    re.replace_all(template, |caps: &Captures| {
        vars.get(&caps[1]).copied().unwrap_or_default().to_string()
    })
    .into_owned()
}
