//! Pre-flight checks.
//!
//! Validates the external prerequisites before any trial runs. Each check
//! yields a pass/fail with a fix hint; any failure aborts the batch.
//!
//! 1. Node.js >= 22
//! 2. npm available
//! 3. Gateway port free
//! 4. Each model server reachable
//! 5. Each model listed by its server

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::runner::config::{BenchmarkConfig, ModelConfig};
use crate::runner::environment::run_with_timeout;

/// Minimum supported Node.js major version.
pub const MIN_NODE_MAJOR: u64 = 22;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const PORT_TIMEOUT: Duration = Duration::from_secs(2);
const SERVER_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const WARM_UP_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    /// What to do about a failure. Empty on success.
    pub fix_hint: String,
}

impl CheckResult {
    fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            fix_hint: String::new(),
        }
    }

    fn fail(name: impl Into<String>, message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }
}

/// All checks of one pre-flight pass.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

impl fmt::Display for PreflightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Pre-flight Checks ===")?;
        for check in &self.checks {
            let status = if check.passed { "\u{2705}" } else { "\u{274c}" };
            writeln!(f, "{} {:<28} {}", status, check.name, check.message)?;
            if !check.fix_hint.is_empty() {
                writeln!(f, "   fix: {}", check.fix_hint)?;
            }
        }
        if self.all_passed() {
            writeln!(f, "\nAll pre-flight checks passed, ready to benchmark")
        } else {
            writeln!(
                f,
                "\n{} check(s) failed, fix the issues above before running",
                self.failed().len()
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn command_output(program: &str) -> Result<String, String> {
    let mut cmd = Command::new(program);
    cmd.arg("--version").stdin(Stdio::null());
    match run_with_timeout(cmd, program, COMMAND_TIMEOUT).await {
        Ok(output) if output.status.success() => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(if stderr.is_empty() {
                format!("{} not found", program)
            } else {
                stderr
            })
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Judges `node --version` output.
pub fn node_version_check(output: &str) -> CheckResult {
    let raw = output.trim().trim_start_matches('v');
    let version = match semver::Version::parse(raw) {
        Ok(v) => v,
        Err(_) => {
            return CheckResult::fail(
                "Node.js",
                format!("Could not parse version from: {}", output.trim()),
                format!("Install Node.js >= {}", MIN_NODE_MAJOR),
            )
        }
    };
    if version.major < MIN_NODE_MAJOR {
        return CheckResult::fail(
            "Node.js",
            format!("Found v{}, need >= {}", version, MIN_NODE_MAJOR),
            format!("Upgrade Node.js: `nvm install {}`", MIN_NODE_MAJOR),
        );
    }
    CheckResult::pass("Node.js", format!("v{}", version))
}

pub async fn check_node() -> CheckResult {
    match command_output("node").await {
        Ok(output) => node_version_check(&output),
        Err(e) => CheckResult::fail(
            "Node.js",
            e,
            format!("Install Node.js >= {}: https://nodejs.org/", MIN_NODE_MAJOR),
        ),
    }
}

pub async fn check_npm() -> CheckResult {
    match command_output("npm").await {
        Ok(version) => CheckResult::pass("npm", format!("v{}", version)),
        Err(e) => CheckResult::fail(
            "npm",
            e,
            "npm ships with Node.js; reinstall Node or run `npm install -g npm`",
        ),
    }
}

/// The gateway port must not accept connections on loopback.
pub async fn check_port(port: u16) -> CheckResult {
    let name = format!("Port {}", port);
    match tokio::time::timeout(PORT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => CheckResult::fail(
            name,
            format!("Port {} is already in use", port),
            format!(
                "Free the port: `lsof -ti:{} | xargs kill` or change `gateway.port` in config.yaml",
                port
            ),
        ),
        Ok(Err(_)) => CheckResult::pass(name, "Available"),
        Err(_) => CheckResult::pass(name, "Assumed available (connect timed out)"),
    }
}

fn authorized(request: reqwest::RequestBuilder, model: &ModelConfig) -> reqwest::RequestBuilder {
    if model.api_key.is_empty() {
        request
    } else {
        request.bearer_auth(&model.api_key)
    }
}

/// The model server answers `GET {base_url}/models` or `GET {base_url}`.
pub async fn check_model_server(http: &reqwest::Client, model: &ModelConfig) -> CheckResult {
    let name = format!("Server [{}]", model.name);
    let base = model.base_url.trim_end_matches('/');
    for url in [format!("{}/models", base), base.to_string()] {
        let request = authorized(http.get(&url).timeout(SERVER_TIMEOUT), model);
        match request.send().await {
            Ok(resp) if resp.status().as_u16() < 400 => {
                return CheckResult::pass(name, format!("Reachable at {}", url));
            }
            Ok(resp) => debug!("Probe {} returned {}", url, resp.status()),
            Err(e) => debug!("Probe {} failed: {}", url, e),
        }
    }
    CheckResult::fail(
        name,
        format!("Cannot reach {}", base),
        format!(
            "Start your model server (e.g. `ollama serve`) and ensure it listens on {}",
            base
        ),
    )
}

/// Model identifiers from an OpenAI-style (`data[].id`) or Ollama-style
/// (`models[].model` / `models[].name`) listing. Ollama names are also
/// added without their `:tag`.
pub fn listed_model_ids(body: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    if let Some(data) = body.get("data").and_then(Value::as_array) {
        ids.extend(
            data.iter()
                .filter_map(|e| e.get("id").and_then(Value::as_str))
                .map(str::to_string),
        );
    } else if let Some(models) = body.get("models").and_then(Value::as_array) {
        for entry in models {
            let name = entry
                .get("model")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some((bare, _)) = name.split_once(':') {
                ids.insert(bare.to_string());
            }
            ids.insert(name.to_string());
        }
    }
    ids
}

/// Exact match, then without the tag, then with `:latest`.
pub fn model_is_listed(ids: &BTreeSet<String>, wanted: &str) -> bool {
    if ids.contains(wanted) {
        return true;
    }
    if let Some((bare, _)) = wanted.split_once(':') {
        if ids.contains(bare) {
            return true;
        }
    }
    ids.contains(&format!("{}:latest", wanted))
}

pub async fn check_model_available(http: &reqwest::Client, model: &ModelConfig) -> CheckResult {
    let name = format!("Model [{}]", model.name);
    let url = format!("{}/models", model.base_url.trim_end_matches('/'));

    let body = match authorized(http.get(&url).timeout(LIST_TIMEOUT), model).send().await {
        Ok(resp) => resp.json::<Value>().await.ok(),
        Err(e) => {
            debug!("Listing {} failed: {}", url, e);
            None
        }
    };
    let Some(body) = body else {
        return CheckResult::fail(
            name,
            format!("Could not list models from {}", url),
            format!("Ensure server is running at {}", model.base_url),
        );
    };

    let ids = listed_model_ids(&body);
    if model_is_listed(&ids, &model.model_id) {
        return CheckResult::pass(name, format!("'{}' available", model.model_id));
    }

    let available = ids.iter().take(10).cloned().collect::<Vec<_>>().join(", ");
    CheckResult::fail(
        name,
        format!("'{}' not found on server", model.model_id),
        format!(
            "Pull the model first: e.g. `ollama pull {}`. Available models: {}",
            model.model_id,
            if available.is_empty() { "(none)" } else { available.as_str() }
        ),
    )
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs every check. Node and npm are skipped when the tool is not being
/// installed; each distinct server is probed once.
pub async fn run_preflight(config: &BenchmarkConfig, skip_install: bool) -> PreflightReport {
    let http = reqwest::Client::new();
    let mut report = PreflightReport::default();

    if !skip_install {
        report.checks.push(check_node().await);
        report.checks.push(check_npm().await);
    }
    report.checks.push(check_port(config.gateway.port).await);

    let mut seen = HashSet::new();
    for model in &config.models {
        if seen.insert(model.base_url.as_str()) {
            report.checks.push(check_model_server(&http, model).await);
        }
        report.checks.push(check_model_available(&http, model).await);
    }
    report
}

/// Sends a four-token chat completion so lazily loaded models are hot
/// before the timed runs. True iff the reply carries any choices.
pub async fn warm_up_model(http: &reqwest::Client, model: &ModelConfig) -> bool {
    let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
    let payload = json!({
        "model": model.model_id,
        "messages": [{"role": "user", "content": "Hi"}],
        "max_tokens": 4,
    });

    let request = authorized(http.post(&url).json(&payload).timeout(WARM_UP_TIMEOUT), model);
    let response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(model = %model.model_id, "Warm-up failed: {}", e);
            return false;
        }
    };
    if !response.status().is_success() {
        warn!(model = %model.model_id, "Warm-up HTTP error: {}", response.status());
        return false;
    }
    match response.json::<Value>().await {
        Ok(body) => has_choices(&body),
        Err(e) => {
            warn!(model = %model.model_id, "Warm-up returned invalid JSON: {}", e);
            false
        }
    }
}

fn has_choices(body: &Value) -> bool {
    body.get("choices")
        .and_then(Value::as_array)
        .is_some_and(|choices| !choices.is_empty())
}
