use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use topicbot_types::MissedPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Telegram transport configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token. The `TOPICBOT_BOT_TOKEN` environment variable (or a
    /// `.env` file) takes precedence over this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

/// Job store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `~/.topicbot/jobs.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

/// Scheduler loop and retry policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Upper bound on the loop's sleep, so it stays responsive to newly
    /// registered jobs even when nothing is pending.
    #[serde(default = "default_poll_interval_secs")]
    pub max_poll_interval_secs: u64,
    /// How many due jobs may dispatch concurrently.
    #[serde(default = "default_concurrency")]
    pub dispatch_concurrency: usize,
    /// Timeout for a single outbound send. A timeout counts as a
    /// transient failure.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Transient failures tolerated before a job is exhausted.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Cap on the retry backoff delay.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// How long shutdown waits for in-flight dispatches.
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// What to do with occurrences missed while the process was down.
    #[serde(default)]
    pub missed_policy: MissedPolicy,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    900
}

fn default_grace_secs() -> u64 {
    20
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_poll_interval_secs: default_poll_interval_secs(),
            dispatch_concurrency: default_concurrency(),
            send_timeout_secs: default_send_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            shutdown_grace_secs: default_grace_secs(),
            missed_policy: MissedPolicy::default(),
        }
    }
}

/// Fallback target values for job registration commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    /// Chat used when `--chat` is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    /// Topic used when `--topic` is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    /// Timezone for cron schedules registered without `--tz`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            chat_id: None,
            topic_id: None,
            timezone: default_timezone(),
        }
    }
}

/// Top-level topicbot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicBotConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub defaults: JobDefaults,
}

impl TopicBotConfig {
    /// Resolve the bot token: environment first, then config file.
    pub fn resolve_bot_token(&self) -> Option<String> {
        std::env::var("TOPICBOT_BOT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.telegram.bot_token.clone())
    }

    /// Resolve the job database path, defaulting under the config dir.
    pub fn resolve_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.db_path {
            Some(p) => Ok(p.clone()),
            None => Ok(ensure_config_dir()?.join("jobs.db")),
        }
    }
}

/// Resolve the topicbot config directory (~/.topicbot/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".topicbot"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.topicbot/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<TopicBotConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<TopicBotConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(TopicBotConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: TopicBotConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Save configuration to the default path.
pub fn save_config(config: &TopicBotConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
