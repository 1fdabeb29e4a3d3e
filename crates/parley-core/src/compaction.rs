//! Context compactor.
//!
//! Replaces the whole message list with the service's summary. Automatic
//! compactions resubmit the continuation message after a short delay through
//! a cancellable task; manual compactions never do. Failures keep the
//! original history, append one visible error marker and are reported as an
//! outcome rather than an error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_types::{ManageAction, Message, MessageContent, SummarizeResponse};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::SessionService;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    /// The service reported the context limit was exceeded.
    Automatic,
    /// The user asked for it.
    Manual,
}

/// Receives the compactor's writes. Implementations route them to the single
/// owner of the message list.
pub trait CompactionSink: Send + Sync {
    /// Replaces the entire message list.
    fn set_messages(&self, messages: Vec<Message>);
    /// Resubmits a message to keep the conversation going.
    fn append(&self, message: Message);
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    Compacted {
        message_count: usize,
        token_counts: Vec<usize>,
        continuation_scheduled: bool,
    },
    /// History was kept and an error marker appended.
    Failed { error: CoreError },
}

// ============================================================================
// Threshold check
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompactionCheck {
    pub needs_compaction: bool,
    pub usage_ratio: f64,
    /// Tokens left before the threshold is reached.
    pub remaining_tokens: usize,
    pub percentage_until_compaction: f64,
}

/// Decides whether `current_tokens` crosses `threshold` of `context_limit`.
/// Thresholds outside `(0, 1)` disable automatic compaction.
pub fn check_compaction_needed(
    current_tokens: usize,
    context_limit: usize,
    threshold: f64,
) -> CompactionCheck {
    let usage_ratio = if context_limit == 0 {
        0.0
    } else {
        current_tokens as f64 / context_limit as f64
    };
    let threshold_tokens = (context_limit as f64 * threshold.max(0.0)) as usize;
    let remaining_tokens = threshold_tokens.saturating_sub(current_tokens);
    let percentage_until_compaction = if usage_ratio < threshold {
        (threshold - usage_ratio) * 100.0
    } else {
        0.0
    };
    let enabled = threshold > 0.0 && threshold < 1.0 && context_limit > 0;
    let needs_compaction = enabled && usage_ratio > threshold;

    debug!(
        current_tokens,
        context_limit,
        usage = usage_ratio * 100.0,
        threshold = threshold * 100.0,
        needs_compaction,
        "compaction check"
    );

    CompactionCheck {
        needs_compaction,
        usage_ratio,
        remaining_tokens,
        percentage_until_compaction,
    }
}

// ============================================================================
// Compactor
// ============================================================================

/// Position of the continuation message when the service does not mark it.
const LEGACY_CONTINUATION_POSITION: usize = 2;

/// Picks the message to resubmit: the one marked as continuation, else the
/// third message.
fn find_continuation(messages: &[Message]) -> Option<Message> {
    if let Some(marked) = messages.iter().find(|m| m.metadata.continuation) {
        return Some(marked.clone());
    }
    let fallback = messages.get(LEGACY_CONTINUATION_POSITION)?;
    warn!(
        id = %fallback.id,
        "compaction response has no marked continuation, using third message"
    );
    Some(fallback.clone())
}

/// Visible, model-excluded note appended when compaction fails.
pub fn error_marker(error: &CoreError) -> Message {
    Message::assistant(vec![
        MessageContent::text(format!("Compaction failed: {error}")).user_only(),
    ])
}

#[derive(Debug, Default)]
struct CompactorState {
    compacting: bool,
    error: Option<CoreError>,
    pending_continuation: Option<CancellationToken>,
}

pub struct ContextCompactor {
    service: Arc<dyn SessionService>,
    continuation_delay: Duration,
    state: Mutex<CompactorState>,
}

impl ContextCompactor {
    pub fn new(service: Arc<dyn SessionService>, continuation_delay: Duration) -> Self {
        Self {
            service,
            continuation_delay,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, CompactorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_compacting(&self) -> bool {
        self.state().compacting
    }

    /// Error from the most recent compaction, cleared when the next starts.
    pub fn error(&self) -> Option<CoreError> {
        self.state().error.clone()
    }

    /// Cancels a scheduled continuation. Returns whether one was pending.
    pub fn cancel_pending_continuation(&self) -> bool {
        match self.state().pending_continuation.take() {
            Some(token) => {
                token.cancel();
                debug!("pending continuation cancelled");
                true
            }
            None => false,
        }
    }

    /// Compacts `messages`, writing the result through `sink`.
    ///
    /// Only a second call while one is running is an error; service failures
    /// come back as [`CompactionOutcome::Failed`].
    pub async fn compact(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        trigger: CompactionTrigger,
        sink: Arc<dyn CompactionSink>,
    ) -> CoreResult<CompactionOutcome> {
        {
            let mut state = self.state();
            if state.compacting {
                warn!(?trigger, "compaction rejected, one is already running");
                return Err(CoreError::CompactionInProgress);
            }
            state.compacting = true;
            state.error = None;
            if let Some(token) = state.pending_continuation.take() {
                token.cancel();
            }
        }
        info!(?trigger, messages = messages.len(), "compaction started");

        let result = self
            .service
            .summarize(session_id, &messages, ManageAction::Summarize)
            .await
            .map_err(|e| CoreError::Compaction(e.to_string()))
            .and_then(|response| {
                if response.messages.is_empty() {
                    Err(CoreError::Compaction(
                        "service returned an empty history".to_string(),
                    ))
                } else {
                    Ok(response)
                }
            });

        match result {
            Ok(response) => Ok(self.apply_summary(response, trigger, sink)),
            Err(error) => {
                warn!(%error, "compaction failed, keeping history");
                let mut kept = messages;
                kept.push(error_marker(&error));
                sink.set_messages(kept);

                let mut state = self.state();
                state.compacting = false;
                state.error = Some(error.clone());
                Ok(CompactionOutcome::Failed { error })
            }
        }
    }

    fn apply_summary(
        &self,
        response: SummarizeResponse,
        trigger: CompactionTrigger,
        sink: Arc<dyn CompactionSink>,
    ) -> CompactionOutcome {
        let SummarizeResponse {
            messages,
            token_counts,
        } = response;
        let message_count = messages.len();
        let continuation = match trigger {
            CompactionTrigger::Automatic => find_continuation(&messages),
            CompactionTrigger::Manual => None,
        };

        sink.set_messages(messages);

        let mut state = self.state();
        let continuation_scheduled = continuation.is_some();
        if let Some(message) = continuation {
            let token = CancellationToken::new();
            state.pending_continuation = Some(token.clone());
            let deadline = tokio::time::Instant::now() + self.continuation_delay;
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => debug!("continuation cancelled before resubmission"),
                    () = tokio::time::sleep_until(deadline) => {
                        debug!(id = %message.id, "resubmitting continuation");
                        sink.append(message);
                    }
                }
            });
        }
        state.compacting = false;
        info!(message_count, continuation_scheduled, "compaction finished");

        CompactionOutcome::Compacted {
            message_count,
            token_counts,
            continuation_scheduled,
        }
    }
}
