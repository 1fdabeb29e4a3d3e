//! Config command handlers.

use anyhow::{Context, Result};
use parley_core::config;
use parley_core::config_store::FileConfigStore;
use parley_core::recovery;

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}

pub fn generate() -> Result<()> {
    let toml = config::Config::generate()?;
    print!("{toml}");
    Ok(())
}

pub async fn check() -> Result<()> {
    let store = FileConfigStore::default();
    let outcome = recovery::ensure_config_ready(&store)
        .await
        .with_context(|| format!("recover config at {}", store.config_path().display()))?;
    println!("{outcome}");
    Ok(())
}
