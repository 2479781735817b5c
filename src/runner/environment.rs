//! Isolated agent environments.
//!
//! Every trial runs against a fresh [`Environment`]: its own home
//! directory, its own tool install, its own gateway process. The
//! controller only talks to the [`Environment`] and
//! [`EnvironmentFactory`] traits; [`OpenClawEnvironment`] is the
//! process-backed implementation.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{
    GatewayConfig, ModelConfig, DEFAULT_CONTEXT_WINDOW, MAX_CONTEXT_WINDOW, MIN_CONTEXT_WINDOW,
};
use super::result::ERROR_PAYLOAD_PREFIX;
use crate::error::EnvironmentError;

/// Name of the agent CLI.
pub const TOOL_BINARY: &str = "openclaw";

/// Package installed into the local npm prefix.
pub const TOOL_PACKAGE: &str = "openclaw@latest";

/// Slack added on top of the agent's own `--timeout`.
pub const AGENT_TIMEOUT_GRACE: Duration = Duration::from_secs(30);

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const ONBOARD_TIMEOUT: Duration = Duration::from_secs(180);
const VERSION_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const GATEWAY_READY_TIMEOUT: Duration = Duration::from_secs(30);
const GATEWAY_STOP_GRACE: Duration = Duration::from_secs(15);
const OLLAMA_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_MAX_TOKENS: u64 = 8192;

/// What the agent said back for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    /// Response text, or an `[ERROR] ...` payload when `ok` is false.
    pub text: String,
    /// Wall-clock time of the call.
    pub elapsed: Duration,
    /// True iff the agent process exited successfully.
    pub ok: bool,
}

impl AgentReply {
    pub fn ok(text: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            text: text.into(),
            elapsed,
            ok: true,
        }
    }

    pub fn error(detail: &str, elapsed: Duration) -> Self {
        Self {
            text: format!("{} {}", ERROR_PAYLOAD_PREFIX, detail),
            elapsed,
            ok: false,
        }
    }
}

/// A provisioned, isolated agent installation for one trial.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Model identifier this environment serves.
    fn model_id(&self) -> &str;

    /// Directory where the agent writes its workspace files.
    fn workspace_path(&self) -> PathBuf;

    /// Installs, configures and starts everything the agent needs.
    async fn provision(&mut self) -> Result<(), EnvironmentError>;

    /// Sends one message. Implementations bound their own work by `timeout`
    /// plus a fixed grace period; callers may cancel the call at `timeout`.
    /// A non-zero agent exit is an `Ok` reply with `ok = false`.
    async fn send_message(&self, message: &str, timeout: Duration) -> Result<AgentReply, EnvironmentError>;

    /// Stops services and removes the home directory. Calling it again is a no-op.
    async fn teardown(&mut self) -> Result<(), EnvironmentError>;

    /// Synchronous best-effort teardown for drop paths.
    fn abort(&mut self);
}

/// Creates environments and reports the tool version.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    /// Allocates a fresh, unprovisioned environment for `model`.
    fn create(&self, model: &ModelConfig) -> Result<Box<dyn Environment>, EnvironmentError>;

    /// Version of the agent tool, or `"unknown"`.
    async fn tool_version(&self) -> String;
}

/// Settings shared by every [`OpenClawEnvironment`].
#[derive(Debug, Clone, Default)]
pub struct OpenClawOptions {
    /// Gateway port and bind mode.
    pub gateway: GatewayConfig,
    /// Use the tool already on `PATH` instead of installing it.
    pub skip_install: bool,
    /// Leave home directories on disk after teardown.
    pub keep_env: bool,
    /// Parent directory for trial homes. Defaults to the system temp dir.
    pub home_root: Option<PathBuf>,
}

impl OpenClawOptions {
    pub fn new(gateway: GatewayConfig) -> Self {
        Self {
            gateway,
            ..Self::default()
        }
    }

    pub fn with_skip_install(mut self, skip: bool) -> Self {
        self.skip_install = skip;
        self
    }

    pub fn with_keep_env(mut self, keep: bool) -> Self {
        self.keep_env = keep;
        self
    }

    pub fn with_home_root(mut self, root: Option<PathBuf>) -> Self {
        self.home_root = root;
        self
    }
}

/// Factory for [`OpenClawEnvironment`]s.
#[derive(Debug, Clone)]
pub struct OpenClawFactory {
    options: OpenClawOptions,
    http: reqwest::Client,
}

impl OpenClawFactory {
    pub fn new(options: OpenClawOptions) -> Self {
        Self {
            options,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EnvironmentFactory for OpenClawFactory {
    fn create(&self, model: &ModelConfig) -> Result<Box<dyn Environment>, EnvironmentError> {
        let env = OpenClawEnvironment::new(model.clone(), self.options.clone(), self.http.clone())?;
        Ok(Box::new(env))
    }

    async fn tool_version(&self) -> String {
        let probe = match tempfile::Builder::new()
            .prefix("openclaw_bench_version_")
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Could not create version probe dir: {}", e);
                return "unknown".to_string();
            }
        };
        let prefix = probe.path().join("npm_prefix");
        if !self.options.skip_install {
            if let Err(e) = install_tool(&prefix).await {
                debug!("Version probe install failed: {}", e);
            }
        }
        detect_version(&prefix).await
    }
}

/// One isolated OpenClaw installation.
pub struct OpenClawEnvironment {
    model: ModelConfig,
    options: OpenClawOptions,
    http: reqwest::Client,
    home: Option<TempDir>,
    home_path: PathBuf,
    gateway_token: Option<String>,
    provider_id: Option<String>,
    gateway: Option<Child>,
}

impl OpenClawEnvironment {
    /// Creates the owner-only home directory. Nothing is installed yet.
    pub fn new(
        model: ModelConfig,
        options: OpenClawOptions,
        http: reqwest::Client,
    ) -> Result<Self, EnvironmentError> {
        let prefix = format!("openclaw_bench_{}_", model.safe_name());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let home = match &options.home_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        restrict_permissions(home.path());
        let home_path = home.path().to_path_buf();
        fs::create_dir_all(home_path.join("npm_prefix"))?;

        info!(model = %model.name, "Environment home: {}", home_path.display());

        Ok(Self {
            model,
            options,
            http,
            home: Some(home),
            home_path,
            gateway_token: None,
            provider_id: None,
            gateway: None,
        })
    }

    pub fn home_path(&self) -> &Path {
        &self.home_path
    }

    pub fn config_path(&self) -> PathBuf {
        self.home_path.join("openclaw.json")
    }

    /// Provider id onboarding assigned, once provisioned.
    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    fn npm_prefix(&self) -> PathBuf {
        self.home_path.join("npm_prefix")
    }

    /// A tool command with the isolated environment applied.
    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("OPENCLAW_HOME", &self.home_path)
            .env("OPENCLAW_CONFIG_PATH", self.config_path())
            .env("PATH", path_with_prefix(&self.npm_prefix()))
            .env("NO_COLOR", "1")
            .env("CI", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.model.api_key.is_empty() {
            cmd.env("CUSTOM_API_KEY", &self.model.api_key);
        }
        if let Some(token) = &self.gateway_token {
            cmd.env("OPENCLAW_GATEWAY_TOKEN", token);
        }
        cmd
    }

    /// Replaces the API key and gateway token with `***`.
    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        if !self.model.api_key.is_empty() {
            out = out.replace(&self.model.api_key, "***");
        }
        if let Some(token) = &self.gateway_token {
            out = out.replace(token, "***");
        }
        out
    }

    fn onboard_args(&self) -> Vec<String> {
        let workspace = self.workspace_path();
        let mut args: Vec<String> = vec![
            "onboard".into(),
            "--non-interactive".into(),
            "--accept-risk".into(),
            "--mode".into(),
            "local".into(),
            "--auth-choice".into(),
            self.model.auth_choice.clone(),
            "--custom-base-url".into(),
            self.model.base_url.clone(),
            "--custom-model-id".into(),
            self.model.model_id.clone(),
            "--custom-compatibility".into(),
            self.model.compatibility.clone(),
            "--gateway-port".into(),
            self.options.gateway.port.to_string(),
            "--gateway-bind".into(),
            self.options.gateway.bind.clone(),
            "--gateway-auth".into(),
            "token".into(),
            "--skip-skills".into(),
            "--skip-health".into(),
            "--skip-channels".into(),
            "--workspace".into(),
            workspace.to_string_lossy().into_owned(),
        ];
        if let Some(token) = &self.gateway_token {
            args.push("--gateway-token".to_string());
            args.push(token.clone());
        }
        if !self.model.api_key.is_empty() {
            args.push("--custom-api-key".to_string());
            args.push(self.model.api_key.clone());
        }
        args
    }

    async fn onboard(&mut self) -> Result<(), EnvironmentError> {
        let args = self.onboard_args();
        info!("Running onboard: {} {}", TOOL_BINARY, self.redact(&args.join(" ")));

        let mut cmd = self.command(TOOL_BINARY);
        cmd.args(&args);
        let output = run_with_timeout(cmd, TOOL_BINARY, ONBOARD_TIMEOUT).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = self.redact(stderr.trim()).chars().take(500).collect();
            return Err(EnvironmentError::Onboard {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        info!("Onboard completed successfully");
        Ok(())
    }

    /// Adopts the provider id and gateway token onboarding wrote.
    fn read_back_config(&mut self) {
        let config = match read_json(&self.config_path()) {
            Some(config) => config,
            None => {
                warn!("Config not readable after onboard: {}", self.config_path().display());
                return;
            }
        };
        self.provider_id = provider_id(&config);
        if let Some(token) = gateway_token(&config) {
            if self.gateway_token.as_deref() != Some(token.as_str()) {
                info!("Adopting onboard's gateway token");
                self.gateway_token = Some(token);
            }
        }
        info!(provider = ?self.provider_id, "Read back config");
    }

    /// Onboarding writes a context window far below what the agent
    /// runtime accepts. Overwrite it for our model.
    async fn patch_context_window(&self) {
        let path = self.config_path();
        let Some(mut config) = read_json(&path) else {
            return;
        };

        let mut window = self.model.context_window;
        if window == DEFAULT_CONTEXT_WINDOW && self.model.is_local() {
            if let Some(found) =
                query_ollama_context_window(&self.http, &self.model.base_url, &self.model.model_id).await
            {
                if found >= MIN_CONTEXT_WINDOW {
                    window = found;
                }
            }
        }
        let window = clamp_context_window(window);

        if !patch_model_entry(&mut config, &self.model.model_id, window) {
            debug!(model_id = %self.model.model_id, "No model entry found to patch");
            return;
        }
        info!(model_id = %self.model.model_id, "Patched contextWindow to {}", window);
        match serde_json::to_string_pretty(&config) {
            Ok(text) => {
                if let Err(e) = fs::write(&path, text) {
                    warn!("Failed to write patched config: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize patched config: {}", e),
        }
    }

    fn start_gateway(&mut self) -> Result<(), EnvironmentError> {
        let mut args = vec![
            "gateway".to_string(),
            "--port".to_string(),
            self.options.gateway.port.to_string(),
            "--auth".to_string(),
            "token".to_string(),
        ];
        if let Some(token) = &self.gateway_token {
            args.push("--token".to_string());
            args.push(token.clone());
        }
        info!("Starting gateway: {} {}", TOOL_BINARY, self.redact(&args.join(" ")));

        let mut cmd = self.command(TOOL_BINARY);
        cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| EnvironmentError::Spawn {
            command: format!("{} gateway", TOOL_BINARY),
            reason: e.to_string(),
        })?;
        self.gateway = Some(child);
        Ok(())
    }

    async fn wait_for_gateway(&self) -> bool {
        let deadline = Instant::now() + GATEWAY_READY_TIMEOUT;
        while Instant::now() < deadline {
            let mut cmd = self.command(TOOL_BINARY);
            cmd.args(["gateway", "status"]);
            if let Ok(output) = run_with_timeout(cmd, TOOL_BINARY, STATUS_TIMEOUT).await {
                if output.status.success() {
                    info!("Gateway is ready");
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    fn release_home(&mut self) {
        if let Some(home) = self.home.take() {
            if self.options.keep_env {
                let path = home.keep();
                info!("Keeping environment at {}", path.display());
            } else {
                let path = home.path().to_path_buf();
                match home.close() {
                    Ok(()) => info!("Cleaned up {}", path.display()),
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }
    }
}

#[async_trait]
impl Environment for OpenClawEnvironment {
    fn model_id(&self) -> &str {
        &self.model.model_id
    }

    fn workspace_path(&self) -> PathBuf {
        self.home_path.join("workspace")
    }

    async fn provision(&mut self) -> Result<(), EnvironmentError> {
        if self.options.skip_install {
            info!("Skipping install");
        } else {
            install_tool(&self.npm_prefix()).await?;
        }

        self.gateway_token = Some(Uuid::new_v4().simple().to_string());
        self.onboard().await?;
        self.read_back_config();
        self.patch_context_window().await;

        self.start_gateway()?;
        if !self.wait_for_gateway().await {
            warn!(
                "Gateway did not become ready within {}s; proceeding with local agent mode",
                GATEWAY_READY_TIMEOUT.as_secs()
            );
        }
        Ok(())
    }

    async fn send_message(&self, message: &str, timeout: Duration) -> Result<AgentReply, EnvironmentError> {
        if self.gateway_token.is_none() {
            return Err(EnvironmentError::NotProvisioned);
        }

        let secs = timeout.as_secs().max(1).to_string();
        let mut cmd = self.command(TOOL_BINARY);
        cmd.args(["agent", "--agent", "main", "--message", message, "--local", "--timeout", secs.as_str()]);

        info!("Sending: {}", message.chars().take(80).collect::<String>());
        let started = Instant::now();
        let output = run_with_timeout(cmd, TOOL_BINARY, timeout + AGENT_TIMEOUT_GRACE).await?;
        let elapsed = started.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = self.redact(stderr.trim());
            warn!(
                "Agent turn failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr
            );
            return Ok(AgentReply::error(&stderr, elapsed));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Got response ({:.1}s, {} chars)", elapsed.as_secs_f64(), text.chars().count());
        Ok(AgentReply::ok(text, elapsed))
    }

    async fn teardown(&mut self) -> Result<(), EnvironmentError> {
        if let Some(mut child) = self.gateway.take() {
            stop_gateway(&mut child).await;
        }
        self.release_home();
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(mut child) = self.gateway.take() {
            if let Err(e) = child.start_kill() {
                debug!("Gateway kill failed: {}", e);
            }
        }
        self.release_home();
    }
}

impl Drop for OpenClawEnvironment {
    fn drop(&mut self) {
        self.abort();
    }
}

// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

/// Runs `cmd` to completion. The child is killed if `timeout` elapses.
pub(crate) async fn run_with_timeout(mut cmd: Command, name: &str, timeout: Duration) -> Result<Output, EnvironmentError> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(EnvironmentError::Spawn {
            command: name.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(EnvironmentError::Timeout(timeout)),
    }
}

/// `npm install -g --prefix <prefix> openclaw@latest`. Never touches the
/// global npm tree.
async fn install_tool(prefix: &Path) -> Result<(), EnvironmentError> {
    info!("Installing {} into {}", TOOL_PACKAGE, prefix.display());
    fs::create_dir_all(prefix)?;
    let mut cmd = Command::new("npm");
    cmd.arg("install")
        .arg("-g")
        .arg("--prefix")
        .arg(prefix)
        .arg(TOOL_PACKAGE)
        .stdin(Stdio::null());
    let output = run_with_timeout(cmd, "npm", INSTALL_TIMEOUT)
        .await
        .map_err(|e| EnvironmentError::Install(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EnvironmentError::Install(stderr.trim().to_string()));
    }
    info!("{} installed (local prefix)", TOOL_BINARY);
    Ok(())
}

/// `openclaw --version`, falling back to `"unknown"`.
async fn detect_version(npm_prefix: &Path) -> String {
    let mut cmd = Command::new(TOOL_BINARY);
    cmd.arg("--version")
        .env("PATH", path_with_prefix(npm_prefix))
        .env("NO_COLOR", "1")
        .stdin(Stdio::null());
    match run_with_timeout(cmd, TOOL_BINARY, VERSION_TIMEOUT).await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if version.is_empty() {
                return "unknown".to_string();
            }
            info!("Detected {} version: {}", TOOL_BINARY, version);
            version
        }
        _ => {
            warn!("Could not detect {} version", TOOL_BINARY);
            "unknown".to_string()
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn stop_gateway(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            debug!(%pid, "Sending SIGTERM to gateway");
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(GATEWAY_STOP_GRACE, child.wait()).await.is_err() {
        warn!("Gateway ignored SIGTERM for {}s, killing", GATEWAY_STOP_GRACE.as_secs());
        if let Err(e) = child.kill().await {
            warn!("Failed to kill gateway: {}", e);
        }
    }
    info!("Gateway stopped");
}

fn path_with_prefix(npm_prefix: &Path) -> OsString {
    let bin = npm_prefix.join("bin");
    let current = std::env::var_os("PATH").unwrap_or_default();
    let paths = std::iter::once(bin).chain(std::env::split_paths(&current));
    std::env::join_paths(paths).unwrap_or(current)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
        debug!("chmod 700 {} failed: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

// ---------------------------------------------------------------------------
// Tool config helpers
// ---------------------------------------------------------------------------

fn read_json(path: &Path) -> Option<Value> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Provider id from `agents.defaults.model` (`"provider/model"`, either a
/// string or `{ primary: ... }`).
pub fn provider_id(config: &Value) -> Option<String> {
    let model = config.pointer("/agents/defaults/model")?;
    let reference = match model {
        Value::String(s) => s.as_str(),
        Value::Object(_) => model.get("primary")?.as_str()?,
        _ => return None,
    };
    reference.split_once('/').map(|(provider, _)| provider.to_string())
}

/// Gateway token from `gateway.auth.token`.
pub fn gateway_token(config: &Value) -> Option<String> {
    config
        .pointer("/gateway/auth/token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

pub fn clamp_context_window(window: u32) -> u32 {
    window.clamp(MIN_CONTEXT_WINDOW, MAX_CONTEXT_WINDOW)
}

/// Sets `contextWindow` (and raises `maxTokens` to at least 8192) on every
/// `models.providers.*.models[]` entry whose id is `model_id`.
pub fn patch_model_entry(config: &mut Value, model_id: &str, window: u32) -> bool {
    let Some(providers) = config
        .pointer_mut("/models/providers")
        .and_then(Value::as_object_mut)
    else {
        return false;
    };

    let mut patched = false;
    for provider in providers.values_mut() {
        let Some(models) = provider.get_mut("models").and_then(Value::as_array_mut) else {
            continue;
        };
        for entry in models.iter_mut() {
            if entry.get("id").and_then(Value::as_str) != Some(model_id) {
                continue;
            }
            let max_tokens = entry
                .get("maxTokens")
                .and_then(Value::as_u64)
                .unwrap_or(MIN_MAX_TOKENS)
                .max(MIN_MAX_TOKENS);
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("contextWindow".to_string(), Value::from(window));
                obj.insert("maxTokens".to_string(), Value::from(max_tokens));
                patched = true;
            }
        }
    }
    patched
}

/// Context length from an Ollama `/api/show` response: a
/// `model_info.<arch>.context_length` key, else `num_ctx` in `parameters`.
pub fn parse_ollama_context(show: &Value) -> Option<u32> {
    if let Some(info) = show.get("model_info").and_then(Value::as_object) {
        for (key, value) in info {
            if key.ends_with(".context_length") {
                if let Some(n) = value.as_f64().filter(|n| *n > 0.0) {
                    return Some(n as u32);
                }
            }
        }
    }
    show.get("parameters")
        .and_then(Value::as_str)?
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("num_ctx"), Some(n), None) => n.parse::<u32>().ok().filter(|n| *n > 0),
                _ => None,
            }
        })
}

/// Asks a local Ollama server for the model's real context window.
async fn query_ollama_context_window(http: &reqwest::Client, base_url: &str, model_id: &str) -> Option<u32> {
    let root = base_url.trim_end_matches('/');
    let root = root.strip_suffix("/v1").unwrap_or(root);
    let response = http
        .post(format!("{}/api/show", root))
        .json(&serde_json::json!({ "name": model_id }))
        .timeout(OLLAMA_TIMEOUT)
        .send()
        .await
        .ok()?;
    let body: Value = response.json().await.ok()?;
    let window = parse_ollama_context(&body)?;
    info!(model_id = %model_id, "Ollama reports context window {}", window);
    Some(window)
}
