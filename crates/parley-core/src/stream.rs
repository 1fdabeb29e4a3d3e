//! Message stream engine.
//!
//! [`MessageList`] is the committed, ordered history: a sequence plus an
//! id -> position index rebuilt on every structural mutation, and a history
//! boundary kept by message id rather than by position.
//!
//! [`MessageStream`] layers generation tracking on top: each generation gets
//! an id and a cancellation token, and events from any generation other than
//! the active one are dropped.

use std::collections::{HashMap, HashSet};

use parley_types::{ContentKind, Message, MessageContent, Role, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

// ============================================================================
// Message list
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageList {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    /// Id of the last message loaded from persisted history.
    history_boundary: Option<String>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// List whose every message counts as history.
    pub fn from_history(messages: Vec<Message>) -> Self {
        let mut list = Self::default();
        list.replace_all(messages);
        list.mark_all_historical();
        list
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|pos| &self.messages[pos])
    }

    /// Number of messages at or before the history boundary.
    pub fn history_index(&self) -> usize {
        self.history_boundary
            .as_deref()
            .and_then(|id| self.position(id))
            .map_or(0, |pos| pos + 1)
    }

    pub fn history_boundary(&self) -> Option<&str> {
        self.history_boundary.as_deref()
    }

    pub fn mark_all_historical(&mut self) {
        self.history_boundary = self.messages.last().map(|m| m.id.clone());
    }

    fn reindex(&mut self) {
        self.index = self
            .messages
            .iter()
            .enumerate()
            .map(|(pos, message)| (message.id.clone(), pos))
            .collect();
    }

    /// Adds a message at the tail, or replaces the message with the same id
    /// in place.
    pub fn upsert(&mut self, message: Message) {
        if let Some(pos) = self.position(&message.id) {
            self.messages[pos] = message;
        } else {
            self.index.insert(message.id.clone(), self.messages.len());
            self.messages.push(message);
        }
    }

    /// Applies a streamed chunk: a chunk for the current tail message extends
    /// it (adjacent text items are concatenated), anything else is upserted.
    pub fn merge_streamed(&mut self, chunk: Message) {
        let Some(last) = self.messages.last_mut().filter(|m| m.id == chunk.id) else {
            self.upsert(chunk);
            return;
        };

        for item in chunk.content {
            let extended = match (item.as_text(), last.content.last_mut()) {
                (Some(text), Some(tail)) if tail.display == item.display => match &mut tail.kind {
                    ContentKind::Text { text: existing } => {
                        existing.push_str(text);
                        true
                    }
                    _ => false,
                },
                _ => false,
            };
            if !extended {
                last.content.push(item);
            }
        }
        if chunk.metadata.continuation {
            last.metadata.continuation = true;
        }
    }

    /// Replaces the whole list. The boundary survives only if its message
    /// does.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.reindex();
        if let Some(boundary) = &self.history_boundary
            && !self.index.contains_key(boundary)
        {
            self.history_boundary = None;
        }
    }

    /// Drops the message at `pos` and everything after it.
    fn truncate_at(&mut self, pos: usize) -> Vec<Message> {
        let removed = self.messages.split_off(pos);
        self.reindex();
        if let Some(boundary) = &self.history_boundary
            && !self.index.contains_key(boundary)
        {
            self.history_boundary = self.messages.last().map(|m| m.id.clone());
        }
        removed
    }
}

// ============================================================================
// Stream events
// ============================================================================

/// Events delivered by the remote reply stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    Message {
        message: Message,
    },
    Error {
        error: String,
    },
    Finish {
        reason: String,
    },
    ModelChange {
        model: String,
        mode: String,
    },
    Notification {
        request_id: String,
        message: Value,
    },
    Ping,
}

/// What applying a [`StreamEvent`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Event belonged to a generation that is no longer active.
    Stale,
    Updated { message_id: String },
    Finished { reason: String },
    Failed { error: String },
    /// Nothing to do with the message list.
    Noted,
}

/// A running generation: its id plus the token that cancels it.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u64,
    pub cancel: CancellationToken,
}

// ============================================================================
// Stream engine
// ============================================================================

#[derive(Debug, Default)]
pub struct MessageStream {
    list: MessageList,
    active: Option<Generation>,
    last_generation: u64,
    streaming_id: Option<String>,
}

impl MessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(messages: Vec<Message>) -> Self {
        Self {
            list: MessageList::from_history(messages),
            ..Self::default()
        }
    }

    pub fn list(&self) -> &MessageList {
        &self.list
    }

    pub fn messages(&self) -> &[Message] {
        self.list.messages()
    }

    pub fn is_generating(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_generation(&self) -> Option<&Generation> {
        self.active.as_ref()
    }

    /// Id of the assistant message currently receiving chunks.
    pub fn streaming_id(&self) -> Option<&str> {
        self.streaming_id.as_deref()
    }

    /// Appends a locally produced message at the live tail.
    pub fn append(&mut self, message: Message) {
        debug!(id = %message.id, role = message.role.as_str(), "append message");
        self.list.upsert(message);
    }

    /// Opens a new generation, superseding any previous one.
    pub fn begin_generation(&mut self) -> Generation {
        if let Some(previous) = self.active.take() {
            previous.cancel.cancel();
        }
        self.last_generation += 1;
        let generation = Generation {
            id: self.last_generation,
            cancel: CancellationToken::new(),
        };
        self.active = Some(generation.clone());
        self.streaming_id = None;
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active.as_ref().is_some_and(|g| g.id == generation)
    }

    /// Applies an event from `generation`; events from stale generations are
    /// dropped without touching the list.
    pub fn apply(&mut self, generation: u64, event: StreamEvent) -> StreamOutcome {
        if !self.is_current(generation) {
            debug!(generation, active = ?self.active.as_ref().map(|g| g.id), "dropping stale stream event");
            return StreamOutcome::Stale;
        }

        match event {
            StreamEvent::Message { message } => {
                let message_id = message.id.clone();
                if message.role == Role::Assistant {
                    self.streaming_id = Some(message_id.clone());
                }
                self.list.merge_streamed(message);
                StreamOutcome::Updated { message_id }
            }
            StreamEvent::Finish { reason } => {
                self.active = None;
                self.streaming_id = None;
                info!(generation, %reason, "generation finished");
                StreamOutcome::Finished { reason }
            }
            StreamEvent::Error { error } => {
                self.active = None;
                self.streaming_id = None;
                self.cancel_unanswered_tools();
                warn!(generation, %error, "generation failed");
                StreamOutcome::Failed { error }
            }
            StreamEvent::ModelChange { model, mode } => {
                debug!(%model, %mode, "model changed");
                StreamOutcome::Noted
            }
            StreamEvent::Notification { request_id, .. } => {
                debug!(%request_id, "tool notification");
                StreamOutcome::Noted
            }
            StreamEvent::Ping => StreamOutcome::Noted,
        }
    }

    /// Halts the active generation. Safe to call repeatedly: only the first
    /// call returns the token to cancel.
    pub fn stop(&mut self) -> Option<CancellationToken> {
        let generation = self.active.take()?;
        self.streaming_id = None;
        generation.cancel.cancel();
        self.cancel_unanswered_tools();
        info!(generation = generation.id, "generation stopped");
        Some(generation.cancel)
    }

    /// Replaces the message at `message_id` and everything after it with a
    /// single new message carrying `text`. Stops any active generation first.
    pub fn edit(&mut self, message_id: &str, text: &str) -> CoreResult<Message> {
        let pos = self
            .list
            .position(message_id)
            .ok_or_else(|| CoreError::UnknownMessage(message_id.to_string()))?;
        let role = self.list.messages()[pos].role;

        self.stop();
        let removed = self.list.truncate_at(pos);
        let edited = Message::new(role, vec![MessageContent::text(text)]);
        self.list.upsert(edited.clone());

        info!(
            message_id,
            new_id = %edited.id,
            discarded = removed.len(),
            "message edited"
        );
        Ok(edited)
    }

    /// Wholesale replacement (compaction). Cancels nothing.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.list.replace_all(messages);
    }

    pub fn mark_all_historical(&mut self) {
        self.list.mark_all_historical();
    }

    /// Pairs every unanswered tool request or confirmation request in the
    /// last assistant message with a synthetic cancellation, hidden from the
    /// user but sent to the model.
    fn cancel_unanswered_tools(&mut self) {
        let Some(pos) = self
            .list
            .messages()
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return;
        };

        let answered: HashSet<&str> = self.list.messages()[pos + 1..]
            .iter()
            .flat_map(Message::tool_responses)
            .map(|r| r.id.as_str())
            .collect();

        let assistant = &self.list.messages()[pos];
        let mut pending: Vec<String> = Vec::new();
        let ids = assistant
            .tool_requests()
            .map(|r| r.id.as_str())
            .chain(assistant.tool_confirmation_requests().map(|r| r.id.as_str()));
        for id in ids {
            if !answered.contains(id) && !pending.iter().any(|p| p == id) {
                pending.push(id.to_string());
            }
        }
        if pending.is_empty() {
            return;
        }

        let content = pending
            .iter()
            .map(|id| MessageContent::tool_response(id.clone(), ToolResult::cancelled()).agent_only())
            .collect();
        info!(count = pending.len(), "cancelling unanswered tool requests");
        self.list.upsert(Message::new(Role::User, content));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assistant_text, tool_call, tool_result, user};

    fn ids(stream: &MessageStream) -> Vec<&str> {
        stream.messages().iter().map(|m| m.id.as_str()).collect()
    }

    fn chunk(id: &str, text: &str) -> StreamEvent {
        StreamEvent::Message {
            message: assistant_text(id, text),
        }
    }

    #[test]
    fn test_streamed_chunks_extend_tail_message() {
        let mut stream = MessageStream::new();
        stream.append(user("u1", "hi"));
        let generation = stream.begin_generation();

        stream.apply(generation.id, chunk("a1", "Hel"));
        stream.apply(generation.id, chunk("a1", "lo"));

        assert_eq!(ids(&stream), vec!["u1", "a1"]);
        assert_eq!(stream.list().get("a1").unwrap().text(), "Hello");
        assert_eq!(stream.streaming_id(), Some("a1"));
    }

    #[test]
    fn test_stale_generation_events_are_dropped() {
        let mut stream = MessageStream::new();
        let old = stream.begin_generation();
        let new = stream.begin_generation();

        assert!(old.cancel.is_cancelled());
        assert_eq!(stream.apply(old.id, chunk("a1", "late")), StreamOutcome::Stale);
        assert!(stream.messages().is_empty());
        assert!(matches!(
            stream.apply(new.id, chunk("a2", "fresh")),
            StreamOutcome::Updated { .. }
        ));
    }

    #[test]
    fn test_edit_truncates_and_appends() {
        let mut stream = MessageStream::from_history(vec![
            user("u1", "one"),
            assistant_text("a1", "two"),
            user("u2", "three"),
            assistant_text("a2", "four"),
        ]);

        let edited = stream.edit("u2", "three, revised").unwrap();

        assert_eq!(ids(&stream), vec!["u1", "a1", edited.id.as_str()]);
        assert_eq!(stream.list().position(&edited.id), Some(2));
        assert_eq!(stream.list().get("a2"), None);
        assert_eq!(edited.text(), "three, revised");
        // Boundary pointed at a discarded message; it moves to the new tail
        // of surviving history.
        assert_eq!(stream.list().history_boundary(), Some("a1"));
        assert_eq!(stream.list().history_index(), 2);
    }

    #[test]
    fn test_edit_unknown_message_fails() {
        let mut stream = MessageStream::new();
        assert!(matches!(
            stream.edit("missing", "x"),
            Err(CoreError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_edit_stops_active_generation() {
        let mut stream = MessageStream::new();
        stream.append(user("u1", "hi"));
        let generation = stream.begin_generation();

        stream.edit("u1", "hello").unwrap();

        assert!(generation.cancel.is_cancelled());
        assert!(!stream.is_generating());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut stream = MessageStream::new();
        let generation = stream.begin_generation();

        let token = stream.stop().unwrap();
        assert!(token.is_cancelled());
        assert!(generation.cancel.is_cancelled());
        assert!(stream.stop().is_none());
        assert!(stream.stop().is_none());
    }

    #[test]
    fn test_stop_cancels_unanswered_tool_requests() {
        let mut stream = MessageStream::new();
        stream.append(user("u1", "list files"));
        let generation = stream.begin_generation();
        stream.apply(
            generation.id,
            StreamEvent::Message {
                message: tool_call("a1", &["call_1", "call_2"]),
            },
        );
        stream.apply(
            generation.id,
            StreamEvent::Message {
                message: tool_result("r1", &["call_1"]),
            },
        );

        stream.stop();

        let synthetic = stream.list().last().unwrap();
        assert_eq!(synthetic.role, Role::User);
        let responses: Vec<_> = synthetic.tool_responses().collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "call_2");
        assert!(responses[0].result.is_error);
        assert!(!synthetic.content[0].display);
        assert!(synthetic.content[0].send_to_llm);
    }

    #[test]
    fn test_stop_cancels_pending_confirmation() {
        let mut stream = MessageStream::new();
        stream.append(user("u1", "delete the build dir"));
        let generation = stream.begin_generation();
        let args = serde_json::json!({"command": "rm -rf build"});
        let asking = Message::assistant(vec![
            MessageContent::text("This needs approval."),
            MessageContent::tool_request("call_rm", "shell", args.clone()),
            MessageContent::tool_confirmation_request("call_rm", "shell", args),
        ])
        .with_id("a1");
        stream.apply(generation.id, StreamEvent::Message { message: asking });

        stream.stop();

        assert_eq!(stream.messages().len(), 3);
        let synthetic = stream.list().last().unwrap();
        assert_eq!(synthetic.role, Role::User);
        // Request and confirmation share an id: one cancellation answers both.
        let responses: Vec<_> = synthetic.tool_responses().collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "call_rm");
        assert!(responses[0].result.is_error);
        assert!(!synthetic.content[0].display);
        assert!(synthetic.content[0].send_to_llm);
    }

    #[test]
    fn test_stop_cancels_confirmation_only_message() {
        let mut stream = MessageStream::new();
        stream.append(user("u1", "deploy"));
        let generation = stream.begin_generation();
        let asking = Message::assistant(vec![MessageContent::tool_confirmation_request(
            "confirm_1",
            "deploy",
            serde_json::json!({}),
        )])
        .with_id("a1");
        stream.apply(generation.id, StreamEvent::Message { message: asking });

        stream.stop();

        let responses: Vec<String> = stream
            .list()
            .last()
            .unwrap()
            .tool_responses()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(responses, vec!["confirm_1".to_string()]);
    }

    #[test]
    fn test_stop_without_pending_tools_adds_nothing() {
        let mut stream = MessageStream::new();
        stream.append(user("u1", "hi"));
        let generation = stream.begin_generation();
        stream.apply(generation.id, chunk("a1", "hello"));

        stream.stop();
        assert_eq!(ids(&stream), vec!["u1", "a1"]);
    }

    #[test]
    fn test_finish_clears_generation() {
        let mut stream = MessageStream::new();
        let generation = stream.begin_generation();
        stream.apply(generation.id, chunk("a1", "done"));

        let outcome = stream.apply(
            generation.id,
            StreamEvent::Finish {
                reason: "stop".to_string(),
            },
        );

        assert_eq!(
            outcome,
            StreamOutcome::Finished {
                reason: "stop".to_string()
            }
        );
        assert!(!stream.is_generating());
        assert_eq!(stream.streaming_id(), None);
    }

    #[test]
    fn test_stream_event_wire_shape() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"Finish","reason":"stop"}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Finish {
                reason: "stop".to_string()
            }
        );
        let ping: StreamEvent = serde_json::from_str(r#"{"type":"Ping"}"#).unwrap();
        assert_eq!(ping, StreamEvent::Ping);
    }

    #[test]
    fn test_replace_all_rebuilds_index() {
        let mut list = MessageList::from_history(vec![user("u1", "a"), user("u2", "b")]);
        list.replace_all(vec![user("x", "summary")]);

        assert_eq!(list.position("x"), Some(0));
        assert_eq!(list.position("u1"), None);
        assert_eq!(list.history_boundary(), None);
        assert_eq!(list.history_index(), 0);
    }
}
