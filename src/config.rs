// src/config.rs
//! Application configuration
//!
//! Read from a JSON file (every field optional), then overridden by
//! environment variables. Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{info, LevelFilter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::moderation::default_safety_settings;
use crate::moderation::gemini::{GeminiSettings, DEFAULT_ENDPOINT, DEFAULT_MODEL};
use crate::moderation::SafetySetting;
use crate::session::{SessionOptions, DEFAULT_MODERATION_TIMEOUT};

pub const APP_DIR: &str = "chitchathub";
pub const CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "chitchat.db";
pub const LOG_FILE: &str = "chitchathub.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Could not determine the {0} directory")]
    NoDirectory(&'static str),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub safety_settings: Vec<SafetySetting>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_MODERATION_TIMEOUT.as_secs(),
            safety_settings: default_safety_settings(),
        }
    }
}

impl ModerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Classifier settings, or `None` when no API key is configured
    pub fn gemini_settings(&self) -> Option<GeminiSettings> {
        let api_key = self.api_key.as_deref().map(str::trim).filter(|key| !key.is_empty())?;
        Some(GeminiSettings {
            api_key: api_key.to_string(),
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            request_timeout: self.timeout(),
            safety_settings: self.safety_settings.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub moderation: ModerationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_file: None,
            log_level: "info".to_string(),
            moderation: ModerationConfig::default(),
        }
    }
}

pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoDirectory("config"))
}

pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoDirectory("data"))
}

impl AppConfig {
    /// Load `path` (or the default config file) and apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_dir()?.join(CONFIG_FILE),
        };
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a config file; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.moderation.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "moderation.timeout_secs",
                value: "0".to_string(),
            });
        }
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `CHITCHAT_*` / `GEMINI_API_KEY` style overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(path) = lookup("CHITCHAT_DB") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CHITCHAT_LOG") {
            self.log_file = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("CHITCHAT_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(key) = lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")) {
            self.moderation.api_key = Some(key);
        }
        if let Some(model) = lookup("CHITCHAT_MODERATION_MODEL") {
            self.moderation.model = model;
        }
        if let Some(timeout) = lookup("CHITCHAT_MODERATION_TIMEOUT") {
            // A zero timeout would fail every send
            self.moderation.timeout_secs = timeout
                .trim()
                .parse()
                .ok()
                .filter(|secs: &u64| *secs > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "CHITCHAT_MODERATION_TIMEOUT",
                    value: timeout.clone(),
                })?;
        }
        Ok(())
    }

    /// Place the database and log file under `dir` unless set explicitly.
    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        if self.database_path.is_none() {
            self.database_path = Some(dir.join(DATABASE_FILE));
        }
        if self.log_file.is_none() {
            self.log_file = Some(dir.join(LOG_FILE));
        }
        self
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(default_data_dir()?.join(DATABASE_FILE)),
        }
    }

    pub fn log_file(&self) -> Result<PathBuf, ConfigError> {
        match &self.log_file {
            Some(path) => Ok(path.clone()),
            None => Ok(default_data_dir()?.join(LOG_FILE)),
        }
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(self.log_level.trim()).map_err(|_| ConfigError::InvalidValue {
            key: "log_level",
            value: self.log_level.clone(),
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            moderation_timeout: self.moderation.timeout(),
        }
    }
}
