use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "xtask", about = "parley maintainer tasks")]
struct Cli {
    #[command(subcommand)]
    command: Option<CommandName>,
}

#[derive(Debug, Default, Subcommand)]
enum CommandName {
    /// Update default_config.toml by running `parley config generate`.
    #[default]
    UpdateDefaultConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or_default() {
        CommandName::UpdateDefaultConfig => update_default_config(),
    }
}

fn update_default_config() -> Result<()> {
    let root = project_root()?;
    let dest = root
        .join("crates")
        .join("parley-core")
        .join("default_config.toml");
    // Keeps the run from reading or logging into the developer's own home.
    let home = tempfile::tempdir().context("create temp dir for PARLEY_HOME")?;

    let output = Command::new("cargo")
        .current_dir(&root)
        .env("PARLEY_HOME", home.path())
        .arg("run")
        .arg("-p")
        .arg("parley")
        .arg("--")
        .arg("config")
        .arg("generate")
        .output()
        .context("run `cargo run -p parley -- config generate`")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("config generate failed: {stderr}");
    }

    fs::write(&dest, &output.stdout)
        .with_context(|| format!("write config to {}", dest.display()))?;

    println!("Updated {}", dest.display());
    Ok(())
}

fn project_root() -> Result<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let root = manifest_dir
        .ancestors()
        .nth(2)
        .context("locate workspace root from CARGO_MANIFEST_DIR")?;
    Ok(root.to_path_buf())
}
