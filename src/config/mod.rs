//! Configuration system (layered: file > env overrides > defaults).
//!
//! A config file is TOML or JSON:
//!
//! ```toml
//! [client]
//! init_timeout_ms = 10000
//! collision_policy = "prefix-on-collision"
//!
//! [agent]
//! max_steps = 8
//! [agent.task_types.weather]
//! step_timeout_ms = 20000
//!
//! [servers.math]
//! transport = "subprocess"
//! command = "toolmesh-demo-server"
//! args = ["--toolsets", "math"]
//!
//! [servers.weather]
//! transport = "http-stream"
//! url = "http://127.0.0.1:8000/mcp"
//! headers = { Authorization = "Bearer ${WEATHER_TOKEN}" }
//! ```
//!
//! Server entries are parsed one at a time; a malformed entry is reported as a
//! [`RejectedServer`] and degrades only that server.

pub mod servers;

pub use servers::{
    interpolate_env, parse_server_entry, RejectedServer, ServerConfig, TransportConfig,
    TransportKind,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ToolMeshError};
use crate::mcp::aggregate::CollisionPolicy;

pub const CONFIG_PATH_ENV: &str = "TOOLMESH_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "toolmesh.toml";

const DEFAULT_INIT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CATALOG_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_STEPS: usize = 8;
const DEFAULT_STEP_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_TASK_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_DECISION_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_DECISION_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_DECISION_KEY_ENV: &str = "GROQ_API_KEY";

/// Multi-server client behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct ClientSettings {
    /// Overall bound on opening every channel.
    #[builder(default = DEFAULT_INIT_TIMEOUT_MS)]
    pub init_timeout_ms: u64,
    /// Bound on one concurrent catalog refresh.
    #[builder(default = DEFAULT_CATALOG_TIMEOUT_MS)]
    pub catalog_timeout_ms: u64,
    /// Deadline for `call_tool` when the caller does not supply one.
    #[builder(default = DEFAULT_CALL_TIMEOUT_MS)]
    pub call_timeout_ms: u64,
    /// Bound on closing every channel during shutdown.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    pub shutdown_timeout_ms: u64,
    #[builder(default)]
    pub collision_policy: CollisionPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientSettings {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Overrides for one task type (e.g. `math`, `weather`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTypeLimits {
    pub max_steps: Option<usize>,
    pub step_timeout_ms: Option<u64>,
    pub task_timeout_ms: Option<u64>,
}

/// Invocation loop bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub step_timeout_ms: u64,
    pub task_timeout_ms: u64,
    pub task_types: BTreeMap<String, TaskTypeLimits>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            task_types: BTreeMap::new(),
        }
    }
}

/// OpenAI-compatible chat-completions decision-maker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub system_prompt: Option<String>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DECISION_BASE_URL.into(),
            model: DEFAULT_DECISION_MODEL.into(),
            api_key_env: DEFAULT_DECISION_KEY_ENV.into(),
            system_prompt: None,
        }
    }
}

impl DecisionConfig {
    /// Single load-or-fail credential check, done once at startup.
    pub fn resolve_api_key(&self) -> Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ToolMeshError::Configuration(format!(
                "{} is not set; the chat decision-maker needs an API key",
                self.api_key_env
            ))),
        }
    }
}

/// A task listed in the config file for `toolmesh run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    client: ClientSettings,
    agent: AgentSettings,
    decision: DecisionConfig,
    tasks: Vec<TaskSpec>,
    servers: BTreeMap<String, serde_json::Value>,
}

/// Fully loaded configuration.
///
/// Servers are kept in id order, which is also the merge order used by the
/// collision policy.
#[derive(Debug, Clone, Default)]
pub struct ToolMeshConfig {
    pub client: ClientSettings,
    pub agent: AgentSettings,
    pub decision: DecisionConfig,
    pub tasks: Vec<TaskSpec>,
    pub servers: Vec<ServerConfig>,
    pub rejected: Vec<RejectedServer>,
}

impl ToolMeshConfig {
    /// Load from a path, choosing the format from the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ToolMeshError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let lookup = |name: &str| std::env::var(name).ok();
        if is_json {
            Self::from_json_str(&content, &lookup)
        } else {
            Self::from_toml_str(&content, &lookup)
        }
    }

    /// Load from `TOOLMESH_CONFIG`, `./toolmesh.toml`, or the platform config dir.
    pub fn discover() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = Self::default_path().ok_or_else(|| {
            ToolMeshError::Configuration(format!(
                "no config file found; set {CONFIG_PATH_ENV} or create {DEFAULT_CONFIG_FILE}"
            ))
        })?;
        tracing::debug!(path = %path.display(), "loading toolmesh config");
        Self::load(path)
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Some(local);
        }
        directories::ProjectDirs::from("", "", "toolmesh")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.is_file())
    }

    pub fn from_toml_str(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|e| ToolMeshError::Configuration(format!("invalid TOML config: {e}")))?;
        Self::from_value(serde_json::to_value(table)?, lookup)
    }

    pub fn from_json_str(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| ToolMeshError::Configuration(format!("invalid JSON config: {e}")))?;
        Self::from_value(value, lookup)
    }

    fn from_value(value: serde_json::Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| ToolMeshError::Configuration(format!("invalid config: {e}")))?;

        let mut servers = Vec::with_capacity(raw.servers.len());
        let mut rejected = Vec::new();
        for (id, entry) in &raw.servers {
            match parse_server_entry(id, entry, lookup) {
                Ok(server) => servers.push(server),
                Err(rejection) => {
                    tracing::warn!(
                        server = %rejection.id,
                        reason = %rejection.reason,
                        "rejected server entry"
                    );
                    rejected.push(rejection);
                }
            }
        }

        let mut config = Self {
            client: raw.client,
            agent: raw.agent,
            decision: raw.decision,
            tasks: raw.tasks,
            servers,
            rejected,
        };
        config.apply_env_overrides(lookup);
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("TOOLMESH_INIT_TIMEOUT_MS").and_then(|v| parse_positive(&v)) {
            self.client.init_timeout_ms = ms;
        }
        if let Some(url) = lookup("TOOLMESH_DECISION_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.decision.base_url = url;
        }
        if let Some(model) = lookup("TOOLMESH_DECISION_MODEL").filter(|v| !v.trim().is_empty()) {
            self.decision.model = model;
        }
    }

    /// Fails when a `required` entry was rejected during parsing.
    pub fn ensure_required_servers_parsed(&self) -> Result<()> {
        match self.rejected.iter().find(|rejection| rejection.required) {
            Some(rejection) => Err(ToolMeshError::Configuration(format!(
                "required server '{}' is misconfigured: {}",
                rejection.id, rejection.reason
            ))),
            None => Ok(()),
        }
    }
}

fn parse_positive(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|parsed| *parsed > 0)
}
