//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::config_store::FileConfigStore;
use parley_core::{config, logging, recovery};
use tracing::info;

mod commands;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Drive remote agent sessions from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session service URL (overrides `server.base_url`)
    #[arg(long, global = true, env = "PARLEY_BASE_URL", value_name = "URL")]
    base_url: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Start, resume or compact sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Classify text as an interruption of a running reply
    Detect {
        /// Text as the user typed it
        #[arg(value_name = "TEXT")]
        text: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Generate a fresh config from Rust defaults (for xtask)
    Generate,
    /// Run the recovery chain and report what it did
    Check,
}

#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Start a new session
    Start {
        /// Working directory for the agent (default: config or cwd)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// JSON recipe file to start from
        #[arg(long, value_name = "FILE")]
        recipe: Option<PathBuf>,
    },
    /// Resume an existing session
    Resume {
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },
    /// Summarize a session's history and print the replacement messages
    Compact {
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli { command, base_url } = cli;

    // A broken config must not keep `config check` from repairing it.
    let log_config = config::Config::load()
        .map(|c| c.log)
        .unwrap_or_default();
    let _log_guard = logging::init(&log_config).context("init logging")?;

    let command = match command {
        Commands::Config { command } => {
            return match command {
                ConfigCommands::Path => {
                    commands::config::path();
                    Ok(())
                }
                ConfigCommands::Init => commands::config::init(),
                ConfigCommands::Generate => commands::config::generate(),
                ConfigCommands::Check => commands::config::check().await,
            };
        }
        Commands::Detect { text } => return commands::detect::run(&text),
        Commands::Session { command } => command,
    };

    // Repair before the strict load so a corrupt file does not end the run.
    let store = FileConfigStore::default();
    let outcome = recovery::ensure_config_ready(&store)
        .await
        .with_context(|| format!("recover config at {}", store.config_path().display()))?;
    info!(%outcome, "configuration checked");

    let mut config = config::Config::load().context("load config")?;
    if let Some(url) = base_url {
        config.server.base_url = url;
    }

    match command {
        SessionCommands::Start { dir, recipe } => {
            commands::session::start(&config, dir, recipe.as_deref()).await
        }
        SessionCommands::Resume { id } => commands::session::resume(&config, &id).await,
        SessionCommands::Compact { id } => commands::session::compact(&config, &id).await,
    }
}
