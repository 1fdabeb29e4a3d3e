//! Session-service seam.
//!
//! Every component that talks to the remote agent receives an
//! `Arc<dyn SessionService>` at construction; nothing reaches for a global
//! client.

mod http;

use std::path::Path;

use async_trait::async_trait;
use parley_types::{ManageAction, Message, ServiceError, Session, SummarizeResponse};
use serde_json::Value;

pub use http::HttpSessionClient;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Operations the core needs from the remote agent/session service.
///
/// Transport timeouts belong to the implementation, not to callers.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a new session rooted at `working_dir`.
    async fn start(&self, working_dir: &Path, recipe: Option<&Value>) -> ServiceResult<Session>;

    /// Loads an existing session, including its persisted conversation.
    async fn resume(&self, session_id: &str) -> ServiceResult<Session>;

    /// Asks the service to compact `messages`; returns the replacement history.
    async fn summarize(
        &self,
        session_id: &str,
        messages: &[Message],
        action: ManageAction,
    ) -> ServiceResult<SummarizeResponse>;

    /// Appends `text` to the agent's system prompt for this session.
    async fn extend_prompt(&self, session_id: &str, text: &str) -> ServiceResult<()>;

    async fn update_agent_provider(
        &self,
        session_id: &str,
        provider: &str,
        model: Option<&str>,
    ) -> ServiceResult<()>;
}
