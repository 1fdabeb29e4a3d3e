//! Tool-call correlation and chain grouping.
//!
//! Both are derived views over an ordered message slice, recomputed from
//! scratch on every call. Nothing here mutates or caches state.

use std::collections::{HashMap, HashSet};

use parley_types::{Message, ToolRequest, ToolResponse};

// ============================================================================
// Correlation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    /// A later message carries the response.
    Completed,
    /// No response, and the request predates the history boundary.
    Cancelled,
    /// No response yet in live messages.
    Pending,
}

/// One tool request and whatever answered it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall<'a> {
    pub message_id: &'a str,
    pub request: &'a ToolRequest,
    pub response: Option<&'a ToolResponse>,
    /// Message holding the response, when there is one.
    pub response_message_id: Option<&'a str>,
    pub status: ToolCallStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlation<'a> {
    calls: Vec<ToolCall<'a>>,
}

impl<'a> Correlation<'a> {
    pub fn calls(&self) -> &[ToolCall<'a>] {
        &self.calls
    }

    pub fn for_message<'s>(&'s self, message_id: &'s str) -> impl Iterator<Item = &'s ToolCall<'a>> {
        self.calls.iter().filter(move |c| c.message_id == message_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &ToolCall<'a>> {
        self.calls
            .iter()
            .filter(|c| c.status == ToolCallStatus::Pending)
    }
}

/// Matches every tool request with the first unclaimed response carrying the
/// same id in a strictly later message.
///
/// `history_index` is the number of leading messages loaded from persisted
/// history; unanswered requests inside that prefix are cancelled, not
/// pending.
pub fn correlate(messages: &[Message], history_index: usize) -> Correlation<'_> {
    let mut claimed: HashSet<(usize, usize)> = HashSet::new();
    let mut calls = Vec::new();

    for (pos, message) in messages.iter().enumerate() {
        for request in message.tool_requests() {
            let found = messages
                .iter()
                .enumerate()
                .skip(pos + 1)
                .find_map(|(later_pos, later)| {
                    later
                        .tool_responses()
                        .enumerate()
                        .find(|(item, response)| {
                            response.id == request.id && !claimed.contains(&(later_pos, *item))
                        })
                        .map(|(item, response)| (later_pos, item, later.id.as_str(), response))
                });

            let (response, response_message_id, status) = match found {
                Some((later_pos, item, later_id, response)) => {
                    claimed.insert((later_pos, item));
                    (Some(response), Some(later_id), ToolCallStatus::Completed)
                }
                None if pos < history_index => (None, None, ToolCallStatus::Cancelled),
                None => (None, None, ToolCallStatus::Pending),
            };

            calls.push(ToolCall {
                message_id: &message.id,
                request,
                response,
                response_message_id,
                status,
            });
        }
    }

    Correlation { calls }
}

// ============================================================================
// Chains
// ============================================================================

/// Message ids of one chain, in order. Always at least two long.
pub type Chain = Vec<String>;

/// Consecutive tool-only messages grouped for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainLayout {
    chains: Vec<Chain>,
    /// message id -> (chain index, position within chain)
    membership: HashMap<String, (usize, usize)>,
}

impl ChainLayout {
    fn from_chains(chains: Vec<Chain>) -> Self {
        let membership = chains
            .iter()
            .enumerate()
            .flat_map(|(chain_idx, chain)| {
                chain
                    .iter()
                    .enumerate()
                    .map(move |(pos, id)| (id.clone(), (chain_idx, pos)))
            })
            .collect();
        Self { chains, membership }
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn chain_of(&self, message_id: &str) -> Option<&Chain> {
        self.membership
            .get(message_id)
            .map(|(chain_idx, _)| &self.chains[*chain_idx])
    }

    /// Only the first message of a chain renders its own content; the rest
    /// are drawn as part of the chain view.
    pub fn should_render_content(&self, message_id: &str) -> bool {
        self.membership
            .get(message_id)
            .is_none_or(|(_, pos)| *pos == 0)
    }
}

/// Carries tool responses only: hidden from the transcript, so it neither
/// extends nor closes a chain.
fn is_response_only(message: &Message) -> bool {
    message.tool_responses().next().is_some()
        && !message.has_tool_requests()
        && !message.has_visible_text()
}

/// Groups maximal runs of tool-only messages.
///
/// A tool-only message extends the current run; any other message closes it,
/// and runs shorter than two are dropped. While `streaming_id` is tool-only
/// and no run is open, it is paired speculatively with the previous message
/// when that one also requested tools.
///
/// Pure in `(messages, streaming_id)`: repeated calls on the same input give
/// the same layout.
pub fn identify_chains(messages: &[Message], streaming_id: Option<&str>) -> ChainLayout {
    let mut chains: Vec<Chain> = Vec::new();
    let mut current: Chain = Vec::new();
    let mut previous: Option<&Message> = None;

    for message in messages {
        if is_response_only(message) {
            continue;
        }

        if message.is_tool_only() {
            let speculative = streaming_id == Some(message.id.as_str())
                && current.is_empty()
                && previous.is_some_and(Message::has_tool_requests);
            if speculative && let Some(prev) = previous {
                current.push(prev.id.clone());
            }
            current.push(message.id.clone());
        } else {
            if current.len() > 1 {
                chains.push(std::mem::take(&mut current));
            }
            current.clear();
        }
        previous = Some(message);
    }
    if current.len() > 1 {
        chains.push(current);
    }

    ChainLayout::from_chains(chains)
}
