//! Conversation messages and their typed content items.
//!
//! Wire shape of a content item:
//!
//! ```text
//! { "type": "text" | "toolRequest" | "toolResponse" | "toolConfirmationRequest"
//!           | "summarizationRequested",
//!   ...type fields,
//!   "display": bool,     // optional, default true
//!   "sendToLLM": bool }  // optional, default true
//! ```
//!
//! `display` and `sendToLLM` are independent: a compaction marker is shown to
//! the user but never sent to the model, while a continuation prompt is sent
//! to the model and may stay hidden.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A tool invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Result payload of a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub output: Value,
}

impl ToolResult {
    /// Result recorded when a request was abandoned before it produced output.
    pub fn cancelled() -> Self {
        Self {
            is_error: true,
            output: Value::String("Tool call cancelled by user".to_string()),
        }
    }
}

/// Response to an earlier [`ToolRequest`], linked by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub id: String,
    pub result: ToolResult,
}

/// The agent asks the user to approve a tool call before running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfirmationRequest {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Content item kinds, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ContentKind {
    Text { text: String },
    ToolRequest(ToolRequest),
    ToolResponse(ToolResponse),
    ToolConfirmationRequest(ToolConfirmationRequest),
    SummarizationRequested { msg: String },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_true(value: &bool) -> bool {
    *value
}

fn default_true() -> bool {
    true
}

/// One content item plus its visibility flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(flatten)]
    pub kind: ContentKind,
    /// Show this item to the user.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub display: bool,
    /// Include this item in the context sent to the model.
    #[serde(
        rename = "sendToLLM",
        default = "default_true",
        skip_serializing_if = "is_true"
    )]
    pub send_to_llm: bool,
}

impl MessageContent {
    fn visible(kind: ContentKind) -> Self {
        Self {
            kind,
            display: true,
            send_to_llm: true,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::visible(ContentKind::Text { text: text.into() })
    }

    pub fn tool_request(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::visible(ContentKind::ToolRequest(ToolRequest {
            id: id.into(),
            name: name.into(),
            arguments,
        }))
    }

    pub fn tool_response(id: impl Into<String>, result: ToolResult) -> Self {
        Self::visible(ContentKind::ToolResponse(ToolResponse {
            id: id.into(),
            result,
        }))
    }

    pub fn tool_confirmation_request(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self::visible(ContentKind::ToolConfirmationRequest(
            ToolConfirmationRequest {
                id: id.into(),
                tool_name: tool_name.into(),
                arguments,
                prompt: None,
            },
        ))
    }

    pub fn summarization_requested(msg: impl Into<String>) -> Self {
        Self::visible(ContentKind::SummarizationRequested { msg: msg.into() })
    }

    /// Visible to the user, excluded from model context.
    #[must_use]
    pub fn user_only(mut self) -> Self {
        self.display = true;
        self.send_to_llm = false;
        self
    }

    /// Sent to the model, hidden from the user.
    #[must_use]
    pub fn agent_only(mut self) -> Self {
        self.display = false;
        self.send_to_llm = true;
        self
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.kind {
            ContentKind::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool_request(&self) -> Option<&ToolRequest> {
        match &self.kind {
            ContentKind::ToolRequest(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_tool_response(&self) -> Option<&ToolResponse> {
        match &self.kind {
            ContentKind::ToolResponse(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn as_tool_confirmation_request(&self) -> Option<&ToolConfirmationRequest> {
        match &self.kind {
            ContentKind::ToolConfirmationRequest(req) => Some(req),
            _ => None,
        }
    }
}

/// Out-of-band annotations the server attaches to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Marks the message a compaction response wants resubmitted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continuation: bool,
}

impl MessageMetadata {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Creation time, seconds since the Unix epoch.
    pub created: i64,
    pub content: Vec<MessageContent>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_default")]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, content: Vec<MessageContent>) -> Self {
        Self {
            id: new_message_id(),
            role,
            created: chrono::Utc::now().timestamp(),
            content,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessageContent::text(text)])
    }

    pub fn assistant(content: Vec<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    #[must_use]
    pub fn as_continuation(mut self) -> Self {
        self.metadata.continuation = true;
        self
    }

    /// Concatenated text of all text items, regardless of visibility.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// True when at least one displayed text item has non-whitespace text.
    pub fn has_visible_text(&self) -> bool {
        self.content
            .iter()
            .filter(|item| item.display)
            .filter_map(MessageContent::as_text)
            .any(|text| !text.trim().is_empty())
    }

    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolRequest> {
        self.content.iter().filter_map(MessageContent::as_tool_request)
    }

    pub fn tool_responses(&self) -> impl Iterator<Item = &ToolResponse> {
        self.content
            .iter()
            .filter_map(MessageContent::as_tool_response)
    }

    pub fn tool_confirmation_requests(&self) -> impl Iterator<Item = &ToolConfirmationRequest> {
        self.content
            .iter()
            .filter_map(MessageContent::as_tool_confirmation_request)
    }

    pub fn has_tool_requests(&self) -> bool {
        self.tool_requests().next().is_some()
    }

    /// A message that invokes tools and says nothing visible.
    pub fn is_tool_only(&self) -> bool {
        self.has_tool_requests() && !self.has_visible_text()
    }
}

/// Generates a fresh message id.
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_content_flags_default_to_true() {
        let item: MessageContent =
            serde_json::from_value(json!({"type": "text", "text": "hi"})).unwrap();
        assert!(item.display);
        assert!(item.send_to_llm);
        assert_eq!(item.as_text(), Some("hi"));
    }

    #[test]
    fn test_content_flags_are_decoupled_on_the_wire() {
        let marker = MessageContent::summarization_requested("Conversation compacted").user_only();
        let value = serde_json::to_value(&marker).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "summarizationRequested",
                "msg": "Conversation compacted",
                "sendToLLM": false
            })
        );

        let hidden: MessageContent = serde_json::from_value(json!({
            "type": "text",
            "text": "continue",
            "display": false
        }))
        .unwrap();
        assert!(!hidden.display);
        assert!(hidden.send_to_llm);
    }

    #[test]
    fn test_tool_items_use_camel_case_fields() {
        let value = json!({
            "type": "toolConfirmationRequest",
            "id": "call_1",
            "toolName": "shell",
            "arguments": {"command": "ls"},
            "prompt": "Allow?"
        });
        let item: MessageContent = serde_json::from_value(value).unwrap();
        let req = item.as_tool_confirmation_request().unwrap();
        assert_eq!(req.tool_name, "shell");
        assert_eq!(req.prompt.as_deref(), Some("Allow?"));

        let response = MessageContent::tool_response("call_1", ToolResult::cancelled());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "toolResponse");
        assert_eq!(value["result"]["isError"], true);
    }

    #[test]
    fn test_tool_only_requires_no_visible_text() {
        let tool_only = Message::assistant(vec![MessageContent::tool_request(
            "a",
            "shell",
            json!({}),
        )]);
        assert!(tool_only.is_tool_only());

        let hidden_text = tool_only
            .clone()
            .with_content(MessageContent::text("thinking").agent_only());
        assert!(hidden_text.is_tool_only());

        let with_text = tool_only.with_content(MessageContent::text("Running ls"));
        assert!(!with_text.is_tool_only());
    }

    #[test]
    fn test_metadata_omitted_unless_continuation() {
        let plain = Message::user("hello").with_id("m1");
        let value = serde_json::to_value(&plain).unwrap();
        assert!(value.get("metadata").is_none());

        let continuation = plain.as_continuation();
        let value = serde_json::to_value(&continuation).unwrap();
        assert_eq!(value["metadata"]["continuation"], true);
    }
}
