//! Error taxonomy for the orchestration core.

use parley_types::ServiceError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Recoverable: the caller should route the user to provider setup.
    #[error("provider not configured: {0}")]
    ProviderNotConfigured(String),
    #[error("configuration is corrupt and could not be recovered: {0}")]
    ConfigCorrupt(String),
    #[error("agent initialization failed: {0}")]
    AgentInit(String),
    #[error("compaction failed: {0}")]
    Compaction(String),
    #[error("a compaction is already in progress")]
    CompactionInProgress,
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("malformed session payload: {0}")]
    MalformedSession(String),
    #[error("unknown message id: {0}")]
    UnknownMessage(String),
    #[error("invalid queue reorder: {0}")]
    InvalidReorder(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Fatal errors halt session use until restart or reset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AgentInit(_) | Self::MalformedSession(_))
    }

    /// Wraps an `anyhow` chain, keeping every context layer in the message.
    pub fn config(err: &anyhow::Error) -> Self {
        Self::Config(format!("{err:#}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
