//! FlowCron configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowCronConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl FlowCronConfig {
    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FlowError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the FlowCron home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowcron")
    }
}

/// Tick loop, worker pool and run policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Used when a schedule leaves its own timeout at 0.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// A due firing older than this counts as a misfire.
    #[serde(default = "default_misfire_threshold")]
    pub misfire_threshold_secs: u64,
    /// Identifies this process in log entries. Empty means hostname + pid.
    #[serde(default)]
    pub instance_id: String,
}

fn default_tick_interval() -> u64 { 5 }
fn default_max_workers() -> usize { 4 }
fn default_timeout() -> u64 { 300 }
fn default_retry_delay() -> u64 { 30 }
fn default_misfire_threshold() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_workers: default_max_workers(),
            default_timeout_secs: default_timeout(),
            retry_delay_secs: default_retry_delay(),
            misfire_threshold_secs: default_misfire_threshold(),
            instance_id: String::new(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve the instance identifier written into every log entry.
    pub fn resolved_instance_id(&self) -> String {
        if !self.instance_id.is_empty() {
            return self.instance_id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into());
        format!("{host}:{}", std::process::id())
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.flowcron/flowcron.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

impl StorageConfig {
    pub fn expanded_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

/// Language-model backends, addressed by the step's model reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// One named model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name referenced by workflow steps.
    pub name: String,
    /// Provider preset ("openai", "deepseek", "ollama", ...) or "custom".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier sent to the backend.
    pub model: String,
    /// Overrides the preset base URL.
    #[serde(default)]
    pub endpoint: String,
    /// Overrides the preset API key environment variables.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Other model names tried in order when this one fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

fn default_provider() -> String { "openai".into() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 2048 }
fn default_request_timeout() -> u64 { 120 }

impl ModelConfig {
    pub fn new(name: &str, provider: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            endpoint: String::new(),
            api_key: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
            fallbacks: Vec::new(),
        }
    }
}

/// Notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// POST target for failure events. Empty disables the webhook sink.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_history_size() -> usize { 100 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            headers: Vec::new(),
            history_size: default_history_size(),
        }
    }
}
