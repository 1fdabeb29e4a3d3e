//! Session command handlers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use parley_core::client::{HttpSessionClient, SessionService};
use parley_core::compaction::{CompactionOutcome, CompactionSink, CompactionTrigger, ContextCompactor};
use parley_core::config::Config;
use parley_core::config_store::FileConfigStore;
use parley_core::lifecycle::AgentLifecycle;
use parley_types::{Message, Session};
use serde_json::Value;
use tracing::info;

fn lifecycle(config: &Config) -> Result<(AgentLifecycle, Arc<dyn SessionService>)> {
    let client: Arc<dyn SessionService> = Arc::new(
        HttpSessionClient::new(&config.server).context("create session client")?,
    );
    let lifecycle = AgentLifecycle::new(Arc::clone(&client), config.agent.clone())
        .with_config_store(Arc::new(FileConfigStore::default()));
    Ok((lifecycle, client))
}

fn print_session(session: &Session) -> Result<()> {
    let json = serde_json::to_string_pretty(session).context("serialize session")?;
    println!("{json}");
    Ok(())
}

fn read_recipe(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read recipe {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse recipe {}", path.display()))
}

pub async fn start(config: &Config, dir: Option<PathBuf>, recipe: Option<&Path>) -> Result<()> {
    let working_dir = match dir {
        Some(dir) => dir,
        None => config.effective_working_dir()?,
    };
    let recipe = recipe.map(read_recipe).transpose()?;

    let (lifecycle, _) = lifecycle(config)?;
    let session = lifecycle
        .start(working_dir, recipe)
        .await
        .context("start session")?;
    info!(session_id = %session.id, "session started");
    print_session(&session)
}

pub async fn resume(config: &Config, id: &str) -> Result<()> {
    let (lifecycle, _) = lifecycle(config)?;
    let session = lifecycle
        .resume(id)
        .await
        .with_context(|| format!("resume session {id}"))?;
    print_session(&session)
}

/// Keeps the last list the compactor wrote.
#[derive(Default)]
struct CollectSink {
    messages: Mutex<Vec<Message>>,
}

impl CompactionSink for CollectSink {
    fn set_messages(&self, messages: Vec<Message>) {
        *self.messages.lock().unwrap_or_else(PoisonError::into_inner) = messages;
    }

    fn append(&self, _message: Message) {}
}

pub async fn compact(config: &Config, id: &str) -> Result<()> {
    let (lifecycle, client) = lifecycle(config)?;
    let session = lifecycle
        .resume(id)
        .await
        .with_context(|| format!("resume session {id}"))?;

    let compactor = ContextCompactor::new(client, config.compaction.continuation_delay());
    let sink = Arc::new(CollectSink::default());
    let outcome = compactor
        .compact(
            &session.id,
            session.messages().to_vec(),
            CompactionTrigger::Manual,
            Arc::clone(&sink) as Arc<dyn CompactionSink>,
        )
        .await?;

    if let CompactionOutcome::Failed { error } = outcome {
        bail!("compaction of session {id} failed: {error}");
    }

    let messages = std::mem::take(&mut *sink.messages.lock().unwrap_or_else(PoisonError::into_inner));
    let json = serde_json::to_string_pretty(&messages).context("serialize messages")?;
    println!("{json}");
    Ok(())
}
