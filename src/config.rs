//! Service configuration.
//!
//! Reads `patchgate.toml` (every field optional) and layers environment
//! overrides on top: file → environment → CLI flags.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3150
//!
//! [sandbox]
//! command_timeout_secs = 600
//! poll_interval_ms = 2000
//! clone_base = "https://github.com"
//!
//! [token]
//! issuer = "patchgate-sandbox-worker"
//! ttl_secs = 900
//!
//! [github]
//! api_base = "https://api.github.com"
//! app_id = "123456"
//! private_key_path = "/run/secrets/app.pem"
//! token_refresh_buffer_secs = 300
//!
//! [delivery]
//! branch_prefix = "patchgate"
//! title_prefix = "Patchgate Safe Edit"
//! labels = ["automated-edit", "sandbox-verified"]
//! max_rebase_attempts = 3
//!
//! [logging]
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Secret used when none is configured. Tokens signed with it are only fit
/// for local development.
pub const DEV_SECRET: &str = "patchgate-dev-secret-do-not-use-in-prod";

pub const DEFAULT_CONFIG_FILE: &str = "patchgate.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock limit for every shell invocation.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Worker tick interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Parent directory for per-job working directories.
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    #[serde(default = "default_clone_base")]
    pub clone_base: String,
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_clone_base() -> String {
    "https://github.com".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            work_root: None,
            clone_base: default_clone_base(),
        }
    }
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
}

fn default_issuer() -> String {
    crate::token::DEFAULT_ISSUER.to_string()
}

fn default_ttl_secs() -> i64 {
    crate::token::DEFAULT_TTL_SECS
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: default_issuer(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl TokenConfig {
    /// Configured secret, falling back to `PATCHGATE_SECRET`, then the
    /// development secret.
    pub fn secret(&self) -> String {
        self.secret
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("PATCHGATE_SECRET").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEV_SECRET.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub app_id: Option<String>,
    /// PEM body; `\n` escapes are expanded.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Static token used when no App is configured.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_refresh_buffer_secs")]
    pub token_refresh_buffer_secs: i64,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_refresh_buffer_secs() -> i64 {
    crate::auth::cache::DEFAULT_REFRESH_BUFFER_SECS
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            app_id: None,
            private_key: None,
            private_key_path: None,
            token: None,
            token_refresh_buffer_secs: default_refresh_buffer_secs(),
        }
    }
}

impl GitHubConfig {
    /// Resolve the App private key from the inline value or the key file.
    pub fn private_key(&self) -> Result<Option<String>> {
        if let Some(ref key) = self.private_key {
            return Ok(Some(key.clone()));
        }
        match self.private_key_path {
            Some(ref path) => std::fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("Failed to read GitHub App key {}", path.display())),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default = "default_max_rebase_attempts")]
    pub max_rebase_attempts: u32,
    #[serde(default = "default_committer_name")]
    pub committer_name: String,
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

fn default_branch_prefix() -> String {
    "patchgate".to_string()
}

fn default_title_prefix() -> String {
    "Patchgate Safe Edit".to_string()
}

fn default_labels() -> Vec<String> {
    vec!["automated-edit".to_string(), "sandbox-verified".to_string()]
}

fn default_max_rebase_attempts() -> u32 {
    3
}

fn default_committer_name() -> String {
    "patchgate-bot".to_string()
}

fn default_committer_email() -> String {
    "bot@patchgate.dev".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            title_prefix: default_title_prefix(),
            labels: default_labels(),
            max_rebase_attempts: default_max_rebase_attempts(),
            committer_name: default_committer_name(),
            committer_email: default_committer_email(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

/// Top-level `patchgate.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse patchgate.toml")
    }

    /// Load `path` if given (it must exist), otherwise `patchgate.toml` in the
    /// working directory if present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply environment overrides. Unset or empty variables are ignored.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).filter(|v| !v.is_empty());

        if let Some(port) = get("PATCHGATE_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(secret) = get("PATCHGATE_SECRET") {
            self.token.secret = Some(secret);
        }
        if let Some(json) = get("PATCHGATE_LOG_JSON") {
            self.logging.json = json != "0" && json != "false";
        }
        if let Some(api) = get("GITHUB_API_URL") {
            self.github.api_base = api;
        }
        if let Some(app_id) = get("GITHUB_APP_ID") {
            self.github.app_id = Some(app_id);
        }
        if let Some(key) = get("GITHUB_APP_PRIVATE_KEY") {
            self.github.private_key = Some(key);
        }
        if let Some(path) = get("GITHUB_APP_PRIVATE_KEY_PATH") {
            self.github.private_key_path = Some(PathBuf::from(path));
        }
        if let Some(token) = get("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.token.secret() == DEV_SECRET {
            warnings.push(
                "No token secret configured (PATCHGATE_SECRET); using the development secret"
                    .to_string(),
            );
        }
        if self.token.ttl_secs <= 0 {
            warnings.push(format!(
                "token.ttl_secs = {} makes every preview token expire immediately",
                self.token.ttl_secs
            ));
        }
        if self.sandbox.command_timeout_secs == 0 {
            warnings.push("sandbox.command_timeout_secs = 0 fails every sandbox step".to_string());
        }
        if self.sandbox.poll_interval_ms == 0 {
            warnings.push("sandbox.poll_interval_ms = 0 is treated as 1ms".to_string());
        }
        if self.github.app_id.is_some()
            && self.github.private_key.is_none()
            && self.github.private_key_path.is_none()
        {
            warnings.push("github.app_id is set but no private key is configured".to_string());
        }
        if self.github.app_id.is_none() && self.github.token.is_none() {
            warnings.push(
                "No GitHub credentials configured; apply requests will be refused".to_string(),
            );
        }
        if self.delivery.max_rebase_attempts == 0 {
            warnings.push("delivery.max_rebase_attempts = 0 disables automated rebase".to_string());
        }

        warnings
    }
}
