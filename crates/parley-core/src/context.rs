//! Builds the message list sent to the remote agent from the committed
//! history.

use std::collections::HashSet;

use parley_types::{ContentKind, Message};
use tracing::debug;

/// Sanitised context plus a description of everything that was repaired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelContext {
    pub messages: Vec<Message>,
    pub issues: Vec<String>,
}

/// Prepares `messages` for the model:
///
/// 1. items with `sendToLLM = false` are dropped, then messages left empty;
/// 2. tool responses with no earlier request and tool requests that never got
///    a later response are removed;
/// 3. consecutive messages with the same role are merged.
pub fn model_context(messages: &[Message]) -> ModelContext {
    let mut issues = Vec::new();

    let visible: Vec<Message> = messages
        .iter()
        .filter_map(|message| {
            let content: Vec<_> = message
                .content
                .iter()
                .filter(|item| item.send_to_llm)
                .cloned()
                .collect();
            (!content.is_empty()).then(|| Message {
                content,
                ..message.clone()
            })
        })
        .collect();

    let paired = drop_unpaired_tools(visible, &mut issues);
    let merged = merge_same_role(paired, &mut issues);

    if !issues.is_empty() {
        debug!(count = issues.len(), "model context repaired");
    }
    ModelContext {
        messages: merged,
        issues,
    }
}

fn drop_unpaired_tools(messages: Vec<Message>, issues: &mut Vec<String>) -> Vec<Message> {
    // A response pairs with a request in a strictly earlier message.
    let mut requested: HashSet<String> = HashSet::new();
    let mut answered: HashSet<String> = HashSet::new();
    for message in &messages {
        for response in message.tool_responses() {
            if requested.contains(&response.id) {
                answered.insert(response.id.clone());
            }
        }
        requested.extend(message.tool_requests().map(|r| r.id.clone()));
    }

    let mut seen_requests: HashSet<String> = HashSet::new();
    messages
        .into_iter()
        .filter_map(|mut message| {
            message.content.retain(|item| match &item.kind {
                ContentKind::ToolRequest(request) => {
                    let keep = answered.contains(&request.id);
                    if !keep {
                        issues.push(format!("removed unanswered tool request {}", request.id));
                    }
                    keep
                }
                ContentKind::ToolResponse(response) => {
                    let keep = seen_requests.contains(&response.id);
                    if !keep {
                        issues.push(format!("removed orphaned tool response {}", response.id));
                    }
                    keep
                }
                _ => true,
            });
            seen_requests.extend(message.tool_requests().map(|r| r.id.clone()));

            if message.content.is_empty() {
                issues.push(format!("removed empty message {}", message.id));
                return None;
            }
            Some(message)
        })
        .collect()
}

fn merge_same_role(messages: Vec<Message>, issues: &mut Vec<String>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                issues.push(format!(
                    "merged consecutive {} messages {} and {}",
                    message.role.as_str(),
                    last.id,
                    message.id
                ));
                last.content.extend(message.content);
                last.metadata.continuation |= message.metadata.continuation;
            }
            _ => merged.push(message),
        }
    }
    merged
}
