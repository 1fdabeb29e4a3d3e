//! Persisted configuration store.
//!
//! The recovery coordinator only sees [`ConfigStore`]; [`FileConfigStore`]
//! backs it with `config.toml` / `secrets.toml` under `${PARLEY_HOME}`.
//! Every operation is idempotent.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use toml_edit::{DocumentMut, Item, Table};
use tracing::{debug, info, warn};

use crate::config::{
    CURRENT_SCHEMA_VERSION, Config, default_config_template, paths, write_config,
};

/// Schema version assumed for a file that predates the `schema_version` key.
const LEGACY_SCHEMA_VERSION: u32 = 1;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Looks up a dotted key (`agent.provider`). Missing file or key is `None`;
    /// a file that does not load is an error.
    async fn read(&self, key: &str, is_secret: bool) -> Result<Option<Value>>;

    /// Repairs the file in place, dropping whatever does not load.
    async fn validate_config(&self) -> Result<()>;

    /// Keeps a copy of the current file next to it.
    async fn backup_config(&self) -> Result<()>;

    /// Restores the file from the copy made by [`ConfigStore::backup_config`].
    async fn recover_config(&self) -> Result<()>;

    /// Replaces the file with the default template.
    async fn init_config(&self) -> Result<()>;

    /// Layout version of the persisted file.
    async fn schema_version(&self) -> Result<u32>;

    /// Upgrades the persisted layout from `from` to the current version.
    async fn migrate(&self, from: u32) -> Result<()>;
}

/// File-backed store.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    config_path: PathBuf,
    secrets_path: PathBuf,
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new(paths::config_path(), paths::secrets_path())
    }
}

impl FileConfigStore {
    pub fn new(config_path: PathBuf, secrets_path: PathBuf) -> Self {
        Self {
            config_path,
            secrets_path,
        }
    }

    /// Store rooted at `dir` (`dir/config.toml`, `dir/secrets.toml`).
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("config.toml"), dir.join("secrets.toml"))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.config_path, ".bak")
    }

    fn corrupt_path(&self) -> PathBuf {
        with_suffix(&self.config_path, ".corrupt")
    }

    fn read_optional(path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn loads_as_config(contents: &str) -> bool {
    toml::from_str::<Config>(contents).is_ok()
}

/// Keeps every line that still loads as [`Config`] when appended to the lines
/// kept so far. Returns the repaired text and the number of dropped lines.
fn strip_invalid_lines(contents: &str) -> (String, usize) {
    let mut kept = String::new();
    let mut dropped = 0;

    for line in contents.lines() {
        let candidate = format!("{kept}{line}\n");
        if loads_as_config(&candidate) {
            kept = candidate;
        } else {
            debug!(line, "dropping invalid config line");
            dropped += 1;
        }
    }

    (kept, dropped)
}

fn lookup<'a>(table: &'a toml::Table, key: &str) -> Option<&'a toml::Value> {
    let mut parts = key.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

/// Moves legacy top-level `provider` / `model` into `[agent]`, keeping
/// comments and any values already present under `[agent]`.
fn migrate_v1_to_v2(doc: &mut DocumentMut) {
    let root = doc.as_table_mut();
    let legacy: Vec<(String, Item)> = ["provider", "model"]
        .into_iter()
        .filter_map(|key| root.remove(key).map(|item| (key.to_string(), item)))
        .collect();

    if !legacy.is_empty() {
        if !root.contains_table("agent") {
            root.insert("agent", Item::Table(Table::new()));
        }
        if let Some(agent) = root.get_mut("agent").and_then(Item::as_table_mut) {
            for (key, item) in legacy {
                if !agent.contains_key(&key) {
                    agent.insert(&key, item);
                }
            }
        }
    }

    root.insert(
        "schema_version",
        toml_edit::value(i64::from(CURRENT_SCHEMA_VERSION)),
    );
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn read(&self, key: &str, is_secret: bool) -> Result<Option<Value>> {
        let path = if is_secret {
            &self.secrets_path
        } else {
            &self.config_path
        };
        let Some(contents) = Self::read_optional(path)? else {
            return Ok(None);
        };

        let table: toml::Table = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if !is_secret {
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
        }

        lookup(&table, key)
            .map(|value| serde_json::to_value(value).context("Config value is not representable"))
            .transpose()
    }

    async fn validate_config(&self) -> Result<()> {
        let Some(contents) = Self::read_optional(&self.config_path)? else {
            return Ok(());
        };
        if loads_as_config(&contents) {
            return Ok(());
        }

        let (repaired, dropped) = strip_invalid_lines(&contents);
        if !loads_as_config(&repaired) {
            bail!(
                "Config at {} is still invalid after repair",
                self.config_path.display()
            );
        }
        write_config(&self.config_path, &repaired)?;
        warn!(
            dropped,
            path = %self.config_path.display(),
            "removed invalid config lines"
        );
        Ok(())
    }

    async fn backup_config(&self) -> Result<()> {
        let Some(contents) = Self::read_optional(&self.config_path)? else {
            return Ok(());
        };

        // Never let a broken file replace a good backup; park it instead.
        let target = if loads_as_config(&contents) {
            self.backup_path()
        } else {
            self.corrupt_path()
        };
        fs::write(&target, contents)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        debug!(path = %target.display(), "config copied");
        Ok(())
    }

    async fn recover_config(&self) -> Result<()> {
        let backup = self.backup_path();
        let Some(contents) = Self::read_optional(&backup)? else {
            bail!("No config backup at {}", backup.display());
        };
        if !loads_as_config(&contents) {
            bail!("Config backup at {} is not valid", backup.display());
        }
        write_config(&self.config_path, &contents)?;
        info!(path = %self.config_path.display(), "config restored from backup");
        Ok(())
    }

    async fn init_config(&self) -> Result<()> {
        write_config(&self.config_path, default_config_template())?;
        info!(path = %self.config_path.display(), "config reinitialized");
        Ok(())
    }

    async fn schema_version(&self) -> Result<u32> {
        let Some(contents) = Self::read_optional(&self.config_path)? else {
            return Ok(CURRENT_SCHEMA_VERSION);
        };
        let table: toml::Table = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        match table.get("schema_version") {
            None => Ok(LEGACY_SCHEMA_VERSION),
            Some(value) => value
                .as_integer()
                .and_then(|v| u32::try_from(v).ok())
                .context("schema_version must be a non-negative integer"),
        }
    }

    async fn migrate(&self, from: u32) -> Result<()> {
        if from >= CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        let Some(contents) = Self::read_optional(&self.config_path)? else {
            return Ok(());
        };
        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        migrate_v1_to_v2(&mut doc);

        write_config(&self.config_path, &doc.to_string())?;
        info!(from, to = CURRENT_SCHEMA_VERSION, "config migrated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_read_dotted_key_and_secrets() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        fs::write(store.config_path(), "[agent]\nprovider = \"openai\"\n").unwrap();
        fs::write(dir.path().join("secrets.toml"), "api_key = \"sk-1\"\n").unwrap();

        assert_eq!(
            store.read("agent.provider", false).await.unwrap(),
            Some(json!("openai"))
        );
        assert_eq!(store.read("agent.model", false).await.unwrap(), None);
        assert_eq!(store.read("api_key", true).await.unwrap(), Some(json!("sk-1")));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        assert_eq!(store.read("agent.provider", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_fails_on_wrong_types() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        fs::write(store.config_path(), "[server]\ntimeout_secs = \"soon\"\n").unwrap();

        assert!(store.read("server.base_url", false).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_strips_only_broken_lines() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        fs::write(
            store.config_path(),
            "# keep me\n[agent]\nprovider = \"openai\"\nmodel = = broken\ninit_retries = \"x\"\n",
        )
        .unwrap();

        store.validate_config().await.unwrap();
        store.validate_config().await.unwrap();

        let repaired = fs::read_to_string(store.config_path()).unwrap();
        assert_eq!(repaired, "# keep me\n[agent]\nprovider = \"openai\"\n");
        let config = Config::load_from(store.config_path()).unwrap();
        assert_eq!(config.agent.provider.as_deref(), Some("openai"));
    }

    #[tokio::test]
    async fn test_backup_does_not_overwrite_good_copy_with_corrupt_file() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        fs::write(store.config_path(), "[agent]\nmodel = \"m\"\n").unwrap();
        store.backup_config().await.unwrap();

        fs::write(store.config_path(), "[agent\n").unwrap();
        store.backup_config().await.unwrap();

        let backup = fs::read_to_string(store.backup_path()).unwrap();
        assert_eq!(backup, "[agent]\nmodel = \"m\"\n");
        assert!(dir.path().join("config.toml.corrupt").exists());

        store.recover_config().await.unwrap();
        let config = Config::load_from(store.config_path()).unwrap();
        assert_eq!(config.agent.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_recover_without_backup_fails() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        assert!(store.recover_config().await.is_err());
    }

    #[tokio::test]
    async fn test_schema_version_defaults() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        assert_eq!(store.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);

        fs::write(store.config_path(), "provider = \"openai\"\n").unwrap();
        assert_eq!(store.schema_version().await.unwrap(), LEGACY_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_migrate_moves_legacy_keys_and_keeps_comments() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        fs::write(
            store.config_path(),
            "provider = \"anthropic\"\nmodel = \"claude\"\n\n# slow proxy\n[server]\ntimeout_secs = 30\n",
        )
        .unwrap();

        store.migrate(1).await.unwrap();

        let contents = fs::read_to_string(store.config_path()).unwrap();
        assert!(contents.contains("# slow proxy"));
        let config = Config::load_from(store.config_path()).unwrap();
        assert_eq!(
            config.agent.provider_and_model(),
            Some(("anthropic", "claude"))
        );
        assert_eq!(config.server.timeout_secs, 30);
        assert_eq!(store.schema_version().await.unwrap(), 2);

        // Second run is a no-op.
        store.migrate(2).await.unwrap();
        assert_eq!(fs::read_to_string(store.config_path()).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_init_overwrites_with_template() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        fs::write(store.config_path(), "garbage = = =").unwrap();

        store.init_config().await.unwrap();

        assert_eq!(
            Config::load_from(store.config_path()).unwrap(),
            Config::default()
        );
    }
}
