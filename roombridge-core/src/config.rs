// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates credentials and identities, fills defaults, and redacts secrets in Debug output
use crate::error::BridgeError;
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub home_server: String,
    /// Bot identity; derived from the host name when empty
    #[serde(default)]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Invited to every room and the only sender allowed to drive the agent
    #[serde(default)]
    pub admin_user: String,
    #[serde(default = "default_room_prefix")]
    pub room_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub encrypted_rooms: bool,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            home_server: String::new(),
            user_id: String::new(),
            password: None,
            access_token: None,
            device_name: default_device_name(),
            admin_user: String::new(),
            room_prefix: default_room_prefix(),
            display_name: None,
            encrypted_rooms: false,
        }
    }
}

impl std::fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixConfig")
            .field("home_server", &self.home_server)
            .field("user_id", &self.user_id)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("device_name", &self.device_name)
            .field("admin_user", &self.admin_user)
            .field("room_prefix", &self.room_prefix)
            .field("display_name", &self.display_name)
            .field("encrypted_rooms", &self.encrypted_rooms)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// External agent endpoint, handed to the CLI as --sdk-url
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            binary: default_agent_binary(),
            model: default_model(),
            endpoint: None,
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    /// Backend configuration blob understood by the agent registry factories
    pub fn backend_settings(&self, working_dir: &Path) -> Value {
        json!({
            "binary": self.binary,
            "sdk_url": self.endpoint,
            "working_dir": working_dir,
            "model": self.model,
        })
    }

    /// Prompt the agent session is primed with
    pub fn initial_prompt(&self, working_dir: &Path) -> String {
        self.system_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are a coding agent working in {}. The user talks to you from a chat \
                 room on their phone, so keep answers concise and readable on a small screen.",
                working_dir.display()
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    #[serde(default = "default_room_create_attempts")]
    pub room_create_attempts: u32,
    #[serde(default = "default_subscribe_attempts")]
    pub subscribe_attempts: u32,
    #[serde(default = "default_true")]
    pub dedupe_events: bool,
    #[serde(default = "default_true")]
    pub announce: bool,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            state_dir: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            send_attempts: default_send_attempts(),
            room_create_attempts: default_room_create_attempts(),
            subscribe_attempts: default_subscribe_attempts(),
            dedupe_events: true,
            announce: true,
            max_message_chars: default_max_message_chars(),
        }
    }
}

impl BridgeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Directory the databases and logs live in
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .as_ref()
            .map(|p| PathBuf::from(expand_tilde(&p.to_string_lossy())))
            .unwrap_or_else(paths::data_dir)
    }

    /// Working directory the bridge serves, before canonicalization
    pub fn working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(PathBuf::from(expand_tilde(&dir.to_string_lossy()))),
            None => std::env::current_dir().context("Failed to read current directory"),
        }
    }
}

fn default_device_name() -> String {
    "roombridge".to_string()
}

fn default_room_prefix() -> String {
    "Agent".to_string()
}

fn default_backend() -> String {
    "direct".to_string()
}

fn default_agent_binary() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_send_attempts() -> u32 {
    3
}

fn default_room_create_attempts() -> u32 {
    1
}

fn default_subscribe_attempts() -> u32 {
    5
}

fn default_max_message_chars() -> usize {
    8000
}

fn default_true() -> bool {
    true
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    let home = || directories::BaseDirs::new().map(|b| b.home_dir().to_path_buf());
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(stripped).to_string_lossy().to_string();
        }
        tracing::warn!(path = %path, "Could not expand ~: no home directory");
    } else if path == "~" {
        if let Some(home) = home() {
            return home.to_string_lossy().to_string();
        }
        tracing::warn!("Could not expand ~: no home directory");
    }
    path.to_string()
}

/// Command-line values that win over both the file and the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
}

/// Matrix ids look like `@local:server`
fn is_matrix_user_id(id: &str) -> bool {
    id.strip_prefix('@')
        .and_then(|rest| rest.split_once(':'))
        .map(|(local, server)| !local.is_empty() && !server.is_empty())
        .unwrap_or(false)
}

/// Per-machine bot id: `@bot-<hostname>:<admin's server>`
pub fn default_bot_user_id(hostname: &str, admin_user: &str) -> Option<String> {
    let (_, server) = admin_user.split_once(':')?;
    let slug: String = hostname
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() || server.is_empty() {
        return None;
    }
    Some(format!("@bot-{}:{}", slug, server))
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. the --config flag
    /// 2. ROOMBRIDGE_CONFIG_PATH env var
    /// 3. ./config.toml
    /// 4. ~/.config/roombridge/config.toml
    fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Ok(env_path) = std::env::var("ROOMBRIDGE_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str::<Config>(content).context("Failed to parse configuration")
    }

    /// Load, override and validate. Every failure is a configuration error.
    pub fn load(overrides: &Overrides) -> Result<Self, BridgeError> {
        let mut config = match Self::find_config_file(overrides.config_path.as_deref()) {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration from file");
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))
                    .map_err(BridgeError::configuration)?;
                toml::from_str::<Config>(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))
                    .map_err(BridgeError::configuration)?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };

        config.apply_env();
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Override with environment variables if present
    pub fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(val) = var("MATRIX_HOME_SERVER") {
            self.matrix.home_server = val;
        }
        if let Some(val) = var("MATRIX_USER_ID") {
            self.matrix.user_id = val;
        }
        if let Some(val) = var("MATRIX_PASSWORD") {
            self.matrix.password = Some(val);
        }
        if let Some(val) = var("MATRIX_ACCESS_TOKEN") {
            self.matrix.access_token = Some(val);
        }
        if let Some(val) = var("MATRIX_DEVICE_NAME") {
            self.matrix.device_name = val;
        }
        if let Some(val) = var("MATRIX_ADMIN_USER") {
            self.matrix.admin_user = val;
        }
        if let Some(val) = var("MATRIX_ROOM_PREFIX") {
            self.matrix.room_prefix = val;
        }
        if let Some(val) = var("AGENT_BACKEND") {
            self.agent.backend = val;
        }
        if let Some(val) = var("AGENT_BINARY") {
            self.agent.binary = val;
        }
        if let Some(val) = var("AGENT_MODEL") {
            self.agent.model = val;
        }
        if let Some(val) = var("AGENT_ENDPOINT") {
            self.agent.endpoint = Some(val);
        }
        if let Some(val) = var("AGENT_WORK_DIR") {
            self.bridge.working_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = var("ROOMBRIDGE_STATE_DIR") {
            self.bridge.state_dir = Some(PathBuf::from(val));
        }
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.working_dir {
            self.bridge.working_dir = Some(dir.clone());
        }
        if let Some(model) = &overrides.model {
            self.agent.model = model.clone();
        }
    }

    /// Check required fields and fill derived defaults
    pub fn validate(&mut self) -> Result<(), BridgeError> {
        let fail = |msg: String| Err(BridgeError::Configuration(msg));

        if self.matrix.home_server.trim().is_empty() {
            return fail(
                "matrix.home_server is required (set in config.toml or MATRIX_HOME_SERVER env var)"
                    .to_string(),
            );
        }
        let no_secret = |s: &Option<String>| s.as_deref().map(str::trim).unwrap_or("").is_empty();
        if no_secret(&self.matrix.password) && no_secret(&self.matrix.access_token) {
            return fail("Either matrix.password or matrix.access_token is required".to_string());
        }

        self.matrix.admin_user = self.matrix.admin_user.trim().to_string();
        if self.matrix.admin_user.is_empty() {
            return fail(
                "matrix.admin_user is required (set in config.toml or MATRIX_ADMIN_USER env var)"
                    .to_string(),
            );
        }
        if !is_matrix_user_id(&self.matrix.admin_user) {
            return fail(format!(
                "Invalid Matrix user ID in matrix.admin_user: {}",
                self.matrix.admin_user
            ));
        }

        if self.matrix.user_id.trim().is_empty() {
            let hostname = gethostname::gethostname().to_string_lossy().to_string();
            match default_bot_user_id(&hostname, &self.matrix.admin_user) {
                Some(id) => {
                    tracing::info!(user_id = %id, "Derived bot user id from host name");
                    self.matrix.user_id = id;
                }
                None => {
                    return fail(
                        "matrix.user_id is required (set in config.toml or MATRIX_USER_ID env var)"
                            .to_string(),
                    )
                }
            }
        }
        if !is_matrix_user_id(&self.matrix.user_id) {
            return fail(format!(
                "Invalid Matrix user ID in matrix.user_id: {}",
                self.matrix.user_id
            ));
        }
        if self.matrix.user_id == self.matrix.admin_user {
            return fail("matrix.admin_user must differ from the bot's matrix.user_id".to_string());
        }

        if self.agent.backend.trim().is_empty() || self.agent.model.trim().is_empty() {
            return fail("agent.backend and agent.model must not be empty".to_string());
        }

        let b = &self.bridge;
        if b.shutdown_grace_secs == 0
            || b.send_timeout_secs == 0
            || b.send_attempts == 0
            || b.room_create_attempts == 0
            || b.subscribe_attempts == 0
            || b.max_message_chars == 0
        {
            return fail("bridge timeouts, attempt counts and max_message_chars must be > 0".to_string());
        }

        Ok(())
    }
}
