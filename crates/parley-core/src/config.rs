//! Configuration management for parley.
//!
//! Loads configuration from ${PARLEY_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Layout version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Returns the default config template with comments.
///
/// This is embedded from default_config.toml at compile time.
/// To update, edit default_config.toml directly.
pub(crate) fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Recursively merges items from source table into target table.
pub(crate) fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

pub mod paths {
    //! Path resolution for parley configuration and data directories.
    //!
    //! PARLEY_HOME resolution order:
    //! 1. PARLEY_HOME environment variable (if set)
    //! 2. ~/.config/parley (default)

    use std::path::PathBuf;

    /// Returns the parley home directory.
    pub fn parley_home() -> PathBuf {
        if let Ok(home) = std::env::var("PARLEY_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".parley"),
            |h| h.join(".config").join("parley"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        parley_home().join("config.toml")
    }

    /// Returns the path to the secrets.toml file.
    pub fn secrets_path() -> PathBuf {
        parley_home().join("secrets.toml")
    }

    /// Returns the directory rolling log files are written to.
    pub fn logs_dir() -> PathBuf {
        parley_home().join("logs")
    }
}

/// Session service connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub secret_key: Option<String>,
    pub timeout_secs: u64,
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            secret_key: None,
            timeout_secs: 600,
        }
    }
}

/// Agent provider selection and session start behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Appended to the agent's system prompt after a session starts
    pub extra_prompt: Option<String>,
    /// Retries for transient failures during start/resume
    pub init_retries: u32,
    pub retry_delay_ms: u64,
}

impl AgentConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Provider and model, when both are set and non-empty.
    pub fn provider_and_model(&self) -> Option<(&str, &str)> {
        let provider = self.provider.as_deref().filter(|p| !p.trim().is_empty())?;
        let model = self.model.as_deref().filter(|m| !m.trim().is_empty())?;
        Some((provider, model))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            extra_prompt: None,
            init_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub continuation_delay_ms: u64,
    /// Fraction of `context_limit` that triggers automatic compaction
    pub auto_threshold: f64,
    pub context_limit: usize,
}

impl CompactionConfig {
    pub fn continuation_delay(&self) -> Duration {
        Duration::from_millis(self.continuation_delay_ms)
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            continuation_delay_ms: 100,
            auto_threshold: 0.8,
            context_limit: 128_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    pub enabled: bool,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `PARLEY_LOG` is unset
    pub level: String,
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stderr: false,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layout version of the file on disk
    pub schema_version: u32,

    /// Working directory sent when starting a session
    pub working_dir: Option<PathBuf>,

    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub compaction: CompactionConfig,
    pub interruption: InterruptionConfig,
    pub log: LogConfig,
}

impl Config {
    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Working directory for new sessions: configured value or the process cwd.
    pub fn effective_working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("Failed to resolve current directory"),
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        write_config(path, default_config_template())
    }

    /// Generates a fresh config TOML from Rust defaults.
    ///
    /// Used by `xtask update-default-config` to keep `default_config.toml` in
    /// sync with `Config::default()`. Comments come from the embedded template.
    pub fn generate() -> Result<String> {
        use toml_edit::DocumentMut;

        let generated_toml = toml::to_string(&Config::default())
            .context("Failed to serialize default config to TOML")?;

        let mut doc: DocumentMut = default_config_template()
            .parse()
            .context("Failed to parse default config template")?;
        let generated_doc: DocumentMut = generated_toml
            .parse()
            .context("Failed to parse generated config")?;

        merge_items(doc.as_table_mut(), generated_doc.as_table());

        Ok(doc.to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            working_dir: None,
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            compaction: CompactionConfig::default(),
            interruption: InterruptionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Writes config content to a file, creating parent directories as needed.
/// Uses atomic write (temp file + rename) to prevent corruption.
pub(crate) fn write_config(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
