//! # Configuration Management Module
//!
//! Shard configuration lives in a single TOML file. Every section has defaults, so a
//! minimal file only needs the values that differ from them.
//!
//! ## Configuration Structure
//!
//! - [`ShardConfig`] - shard identity and file locations
//! - [`EngineConfig`] - per-character limits and chat length
//! - [`PersistenceConfig`] - save debounce and max-wait windows
//! - [`TimersConfig`] - tick interval, offline timeout, chat history retention
//! - [`LoggingConfig`] - log level and optional log files
//!
//! ## Usage
//!
//! ```rust,no_run
//! use roomshard::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("roomshard.toml").await?;
//!     config.validate()?;
//!     println!("Shard: {}", config.shard.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [shard]
//! id = "shard-1"
//! data_dir = "./data"
//! assets_file = "./assets.json"
//!
//! [persistence]
//! save_debounce_ms = 2000
//! save_max_wait_ms = 30000
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::engine::character::CharacterLimits;
use crate::engine::shard::ShardSettings;
use crate::engine::space::SpaceSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: String,
    pub data_dir: String,
    pub assets_file: String,
    /// Directory assignment applied once at startup (JSON `DirectoryUpdate`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_file: Option<String>,
}

impl ShardConfig {
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("store")
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            id: "shard-1".to_string(),
            data_dir: "./data".to_string(),
            assets_file: "./assets.json".to_string(),
            assignment_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_modifiers")]
    pub max_modifiers: usize,
    #[serde(default = "default_max_permission_overrides")]
    pub max_permission_overrides: usize,
    #[serde(default = "default_max_chat_length")]
    pub max_chat_length: usize,
}

fn default_max_modifiers() -> usize {
    32
}

fn default_max_permission_overrides() -> usize {
    64
}

fn default_max_chat_length() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_modifiers: default_max_modifiers(),
            max_permission_overrides: default_max_permission_overrides(),
            max_chat_length: default_max_chat_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Quiet period before a dirty entity is written (ms)
    pub save_debounce_ms: u64,
    /// Upper bound on how long an entity may stay dirty (ms)
    pub save_max_wait_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 2_000,
            save_max_wait_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersConfig {
    pub tick_ms: u64,
    /// Disconnected characters are saved and unloaded after this long (seconds)
    pub offline_timeout_secs: u64,
    pub chat_history_messages: usize,
    pub chat_history_max_age_secs: u64,
    #[serde(default = "default_chat_replay")]
    pub chat_replay: usize,
}

fn default_chat_replay() -> usize {
    50
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            offline_timeout_secs: 300,
            chat_history_messages: 200,
            chat_history_max_age_secs: 3_600,
            chat_replay: default_chat_replay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    /// Permission denials and prompts are also appended here
    #[serde(default)]
    pub security_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("roomshard.log".to_string()),
            security_file: Some("roomshard-security.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shard: ShardConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard.id.trim().is_empty() {
            return Err(anyhow!("shard.id must not be empty"));
        }
        if self.shard.data_dir.trim().is_empty() {
            return Err(anyhow!("shard.data_dir must not be empty"));
        }
        if self.engine.max_modifiers == 0 {
            return Err(anyhow!("engine.max_modifiers must be at least 1"));
        }
        if self.engine.max_chat_length == 0 {
            return Err(anyhow!("engine.max_chat_length must be at least 1"));
        }
        if self.persistence.save_max_wait_ms < self.persistence.save_debounce_ms {
            return Err(anyhow!(
                "persistence.save_max_wait_ms ({}) must be >= save_debounce_ms ({})",
                self.persistence.save_max_wait_ms,
                self.persistence.save_debounce_ms
            ));
        }
        if self.timers.tick_ms < 10 {
            return Err(anyhow!("timers.tick_ms must be >= 10"));
        }
        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(anyhow!("unknown logging.level '{}'", self.logging.level));
        }
        Ok(())
    }

    pub fn shard_settings(&self) -> ShardSettings {
        ShardSettings {
            id: self.shard.id.clone(),
            offline_timeout_ms: (self.timers.offline_timeout_secs as i64).saturating_mul(1000),
            save_debounce_ms: self.persistence.save_debounce_ms,
            save_max_wait_ms: self.persistence.save_max_wait_ms,
            tick_ms: self.timers.tick_ms,
            space: SpaceSettings {
                limits: CharacterLimits {
                    max_modifiers: self.engine.max_modifiers,
                    max_permission_overrides: self.engine.max_permission_overrides,
                },
                max_chat_length: self.engine.max_chat_length,
                chat_history_messages: self.timers.chat_history_messages,
                chat_history_max_age_ms: (self.timers.chat_history_max_age_secs as i64).saturating_mul(1000),
                chat_replay: self.timers.chat_replay,
            },
        }
    }
}
