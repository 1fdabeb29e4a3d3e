//! Session snapshots and compaction payloads.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// A conversation tracked by the remote agent service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Human-readable title.
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Recipe the session was started from, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<Value>,
    /// Persisted history; absent for a freshly started session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
}

impl Session {
    pub fn title(&self) -> &str {
        &self.description
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.as_deref().unwrap_or_default()
    }
}

/// What the service should do with the submitted history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManageAction {
    #[default]
    Summarize,
    Truncate,
}

/// Result of a summarize call: the replacement history, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub messages: Vec<Message>,
    #[serde(default, alias = "tokenCounts")]
    pub token_counts: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_session_tolerates_missing_optional_fields() {
        let session: Session = serde_json::from_value(json!({"id": "20250101_1"})).unwrap();
        assert_eq!(session.title(), "");
        assert!(session.messages().is_empty());
        assert!(session.recipe.is_none());
    }

    #[test]
    fn test_summarize_response_accepts_camel_case_counts() {
        let response: SummarizeResponse =
            serde_json::from_value(json!({"messages": [], "tokenCounts": [3, 4]})).unwrap();
        assert_eq!(response.token_counts, vec![3, 4]);
    }
}
