use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::prompts::PromptSet;
use crate::task_client::TaskClientConfig;

const CONFIG_FILE_NAME: &str = "mentor_config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenApiConfig {
    #[serde(default = "default_submit_url")]
    pub submit_url: String,
    #[serde(default = "default_poll_url")]
    pub poll_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_submit_url() -> String {
    "https://api.gen-api.ru/api/v1/networks/gpt-4o".to_string()
}

fn default_poll_url() -> String {
    "https://api.gen-api.ru/api/v1/request/get/".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_max_attempts() -> u32 {
    15
}

fn default_submit_timeout_secs() -> u64 {
    10
}

fn default_poll_timeout_secs() -> u64 {
    5
}

impl Default for GenApiConfig {
    fn default() -> Self {
        Self {
            submit_url: default_submit_url(),
            poll_url: default_poll_url(),
            api_key: None,
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_max_attempts(),
            submit_timeout_secs: default_submit_timeout_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

/// Range the reflection threshold is sampled from (inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReinforcementConfig {
    #[serde(default = "default_min_exchanges")]
    pub min_exchanges: u32,
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges: u32,
}

fn default_min_exchanges() -> u32 {
    3
}

fn default_max_exchanges() -> u32 {
    5
}

impl Default for ReinforcementConfig {
    fn default() -> Self {
        Self {
            min_exchanges: default_min_exchanges(),
            max_exchanges: default_max_exchanges(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Restrict the bot to a single chat.
    #[serde(default)]
    pub allowed_chat_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BotConfig {
    // New sessions start in Working with this goal when set
    #[serde(default)]
    pub default_goal: Option<String>,

    #[serde(default)]
    pub genapi: GenApiConfig,

    #[serde(default)]
    pub prompts: PromptSet,

    #[serde(default)]
    pub reinforcement: ReinforcementConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Load config from mentor_config.toml (next to executable), then apply
    /// environment overrides. Falls back to defaults when the file is missing
    /// or broken.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("{:#}", e);
                    Self::default()
                }
            }
        } else {
            tracing::warn!("No config file found, using defaults + env vars");
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply `GENAPI_*`, `TELEGRAM_*` and `MENTOR_*` overrides. Blank values
    /// and unparsable numbers are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(key) = get("GENAPI_KEY") {
            self.genapi.api_key = Some(key);
        }
        if let Some(url) = get("GENAPI_SUBMIT_URL") {
            self.genapi.submit_url = url;
        }
        if let Some(url) = get("GENAPI_POLL_URL") {
            self.genapi.poll_url = url;
        }
        if let Some(secs) = get("GENAPI_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.genapi.poll_interval_secs = secs;
        }
        if let Some(attempts) = get("GENAPI_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.genapi.max_attempts = attempts;
        }
        if let Some(secs) = get("GENAPI_SUBMIT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.genapi.submit_timeout_secs = secs;
        }
        if let Some(secs) = get("GENAPI_POLL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.genapi.poll_timeout_secs = secs;
        }

        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(chat_id) = get("TELEGRAM_CHAT_ID").and_then(|v| v.parse().ok()) {
            self.telegram.allowed_chat_id = Some(chat_id);
        }

        if let Some(goal) = get("MENTOR_DEFAULT_GOAL") {
            self.default_goal = Some(goal);
        }
        if let Some(min) = get("MENTOR_REINFORCE_MIN").and_then(|v| v.parse().ok()) {
            self.reinforcement.min_exchanges = min;
        }
        if let Some(max) = get("MENTOR_REINFORCE_MAX").and_then(|v| v.parse().ok()) {
            self.reinforcement.max_exchanges = max;
        }
    }

    pub fn task_client_config(&self) -> TaskClientConfig {
        TaskClientConfig {
            submit_timeout: Duration::from_secs(self.genapi.submit_timeout_secs),
            poll_timeout: Duration::from_secs(self.genapi.poll_timeout_secs),
            poll_interval: Duration::from_secs(self.genapi.poll_interval_secs),
            max_attempts: self.genapi.max_attempts.max(1),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.genapi
            .api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}
