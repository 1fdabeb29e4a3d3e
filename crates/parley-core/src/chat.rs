//! Chat controller: the single writer of the message list, the session
//! identity and the queue.
//!
//! [`ChatController::update`] is a reducer. It mutates controller state and
//! returns [`ChatEffect`]s; it never performs I/O or spawns tasks. The
//! runtime (`crate::runtime`) executes effects and feeds results back in as
//! [`ChatEvent`]s.
//!
//! ## Cancellation
//!
//! The reducer decides when a generation or a scheduled continuation must be
//! cancelled and says so with an effect; the runtime calls `cancel()`.

use std::collections::HashSet;

use parley_types::{ContentKind, Message, Role, ServiceError, Session};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compaction::{CompactionOutcome, CompactionTrigger, check_compaction_needed};
use crate::config::Config;
use crate::context::model_context;
use crate::error::{CoreError, CoreResult};
use crate::interrupt::{InterruptAction, InterruptMatch, InterruptionDetector};
use crate::queue::MessageQueue;
use crate::stream::{MessageStream, StreamEvent, StreamOutcome};
use crate::tools::{ChainLayout, Correlation, correlate, identify_chains};

// ============================================================================
// State machine
// ============================================================================

/// Coarse chat state gating whether input is sent directly or queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatState {
    #[default]
    Idle,
    Streaming,
    Compacting,
}

/// Edges of the [`ChatState`] machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    GenerationStarted,
    GenerationEnded,
    CompactionStarted,
    CompactionEnded,
    Reset,
}

impl ChatState {
    /// Total transition function. Edges that make no sense in the current
    /// state leave it unchanged.
    pub fn next(self, transition: Transition) -> ChatState {
        use ChatState::{Compacting, Idle, Streaming};
        match (self, transition) {
            (_, Transition::Reset) => Idle,
            (Idle | Streaming, Transition::GenerationStarted) => Streaming,
            (Streaming, Transition::GenerationEnded) => Idle,
            (Idle | Streaming, Transition::CompactionStarted) => Compacting,
            (Compacting, Transition::CompactionEnded) => Idle,
            (state, _) => state,
        }
    }

    /// Whether new input may start a generation right away.
    pub fn accepts_input(self) -> bool {
        self == ChatState::Idle
    }
}

// ============================================================================
// Events and effects
// ============================================================================

#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// User submitted text. `input_id` is an idempotency key: repeats are
    /// ignored.
    SubmitInput { input_id: String, text: String },
    /// An event from the remote reply stream of `generation`.
    Stream { generation: u64, event: StreamEvent },
    Stop,
    /// Rewrites a message and discards everything after it.
    Edit { message_id: String, text: String },
    /// Sends a queued item immediately, cancelling any active generation.
    SendNow { queued_id: String },
    /// Promotes the next queued item if nothing is running.
    Dequeue,
    RemoveQueued { queued_id: String },
    EditQueued { queued_id: String, text: String },
    ReorderQueue(Vec<String>),
    ResumeQueue,
    CompactRequested(CompactionTrigger),
    /// The service reported the model context is full.
    ContextLimitExceeded,
    UsageReported { total_tokens: usize },
    /// Wholesale replacement from the compactor.
    ReplaceMessages(Vec<Message>),
    /// Continuation resubmitted after an automatic compaction.
    Resubmit(Message),
    /// Result of a compaction started by [`ChatEffect::Compact`].
    CompactionSettled(CoreResult<CompactionOutcome>),
    SessionLoaded(Session),
    Reset,
    SetDraft(String),
}

/// Work the runtime performs on behalf of the controller.
#[derive(Debug, Clone)]
pub enum ChatEffect {
    /// Request a reply for `messages`, reporting back under `generation`.
    StartGeneration {
        generation: u64,
        messages: Vec<Message>,
        cancel: CancellationToken,
    },
    CancelGeneration { token: CancellationToken },
    Compact {
        trigger: CompactionTrigger,
        messages: Vec<Message>,
    },
    /// Input looked like an interruption but not strongly enough to act on;
    /// ask the user.
    ConfirmInterruption(InterruptMatch),
    CancelScheduledContinuation,
}

/// Controller knobs, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub interruption_enabled: bool,
    pub auto_threshold: f64,
    pub context_limit: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ChatSettings {
    fn from(config: &Config) -> Self {
        Self {
            interruption_enabled: config.interruption.enabled,
            auto_threshold: config.compaction.auto_threshold,
            context_limit: config.compaction.context_limit,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug, Default)]
pub struct ChatController {
    state: ChatState,
    settings: ChatSettings,
    detector: InterruptionDetector,
    session: Option<Session>,
    stream: MessageStream,
    queue: MessageQueue,
    draft: String,
    /// Idempotency keys of inputs already handled.
    seen_inputs: HashSet<String>,
    /// Compact automatically once the current generation ends.
    auto_compact_pending: bool,
    /// A continuation resubmission is scheduled.
    continuation_pending: bool,
    last_error: Option<CoreError>,
}

impl ChatController {
    pub fn new(settings: ChatSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_detector(mut self, detector: InterruptionDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn messages(&self) -> &[Message] {
        self.stream.messages()
    }

    pub fn stream(&self) -> &MessageStream {
        &self.stream
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn last_error(&self) -> Option<&CoreError> {
        self.last_error.as_ref()
    }

    pub fn is_continuation_pending(&self) -> bool {
        self.continuation_pending
    }

    /// Tool requests paired with their responses.
    pub fn tool_calls(&self) -> Correlation<'_> {
        correlate(self.stream.messages(), self.stream.list().history_index())
    }

    /// Tool chains for display, including the streaming message.
    pub fn chain_layout(&self) -> ChainLayout {
        identify_chains(self.stream.messages(), self.stream.streaming_id())
    }

    fn transition(&mut self, transition: Transition) {
        let next = self.state.next(transition);
        if next != self.state {
            debug!(from = ?self.state, to = ?next, ?transition, "chat state");
        }
        self.state = next;
    }

    fn reject(&mut self, error: CoreError) -> Vec<ChatEffect> {
        warn!(%error, "chat event rejected");
        self.last_error = Some(error);
        Vec::new()
    }

    /// Applies one event and returns the effects to execute.
    pub fn update(&mut self, event: ChatEvent) -> Vec<ChatEffect> {
        match event {
            ChatEvent::SubmitInput { input_id, text } => self.submit_input(input_id, &text),
            ChatEvent::Stream { generation, event } => self.handle_stream(generation, event),
            ChatEvent::Stop => self.stop(),
            ChatEvent::Edit { message_id, text } => self.edit(&message_id, &text),
            ChatEvent::SendNow { queued_id } => self.send_now(&queued_id),
            ChatEvent::Dequeue => self.drain_queue(),
            ChatEvent::RemoveQueued { queued_id } => match self.queue.remove(&queued_id) {
                Ok(_) => Vec::new(),
                Err(e) => self.reject(e),
            },
            ChatEvent::EditQueued { queued_id, text } => {
                match self.queue.edit(&queued_id, text) {
                    Ok(()) => Vec::new(),
                    Err(e) => self.reject(e),
                }
            }
            ChatEvent::ReorderQueue(ids) => match self.queue.reorder(&ids) {
                Ok(()) => Vec::new(),
                Err(e) => self.reject(e),
            },
            ChatEvent::ResumeQueue => {
                self.queue.resume();
                self.drain_queue()
            }
            ChatEvent::CompactRequested(trigger) => self.request_compaction(trigger),
            ChatEvent::ContextLimitExceeded => self.context_limit_exceeded(),
            ChatEvent::UsageReported { total_tokens } => self.usage_reported(total_tokens),
            ChatEvent::ReplaceMessages(messages) => {
                self.stream.replace_all(messages);
                if self.state == ChatState::Compacting {
                    self.stream.mark_all_historical();
                }
                Vec::new()
            }
            ChatEvent::Resubmit(message) => self.resubmit(message),
            ChatEvent::CompactionSettled(result) => self.compaction_settled(result),
            ChatEvent::SessionLoaded(session) => self.session_loaded(session),
            ChatEvent::Reset => self.reset(),
            ChatEvent::SetDraft(text) => {
                self.draft = text;
                Vec::new()
            }
        }
    }

    fn cancel_continuation(&mut self, effects: &mut Vec<ChatEffect>) {
        if std::mem::take(&mut self.continuation_pending) {
            effects.push(ChatEffect::CancelScheduledContinuation);
        }
    }

    fn stop_generation(&mut self, effects: &mut Vec<ChatEffect>) {
        if let Some(token) = self.stream.stop() {
            self.transition(Transition::GenerationEnded);
            effects.push(ChatEffect::CancelGeneration { token });
        }
    }

    fn start_generation(&mut self) -> ChatEffect {
        let generation = self.stream.begin_generation();
        self.transition(Transition::GenerationStarted);
        let context = model_context(self.stream.messages());
        for issue in &context.issues {
            debug!(generation = generation.id, %issue, "context repaired");
        }
        ChatEffect::StartGeneration {
            generation: generation.id,
            messages: context.messages,
            cancel: generation.cancel,
        }
    }

    /// Appends `text` as a user message and asks for a reply.
    fn start_turn(&mut self, text: &str) -> ChatEffect {
        self.stream.append(Message::user(text));
        self.start_generation()
    }

    fn submit_input(&mut self, input_id: String, text: &str) -> Vec<ChatEffect> {
        if self.session.is_none() {
            return self.reject(CoreError::AgentInit("no active session".to_string()));
        }
        if self.seen_inputs.contains(&input_id) {
            debug!(%input_id, "duplicate input ignored");
            return Vec::new();
        }
        self.seen_inputs.insert(input_id);
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        self.draft.clear();

        let mut effects = Vec::new();
        self.cancel_continuation(&mut effects);

        match self.state {
            ChatState::Idle => effects.push(self.start_turn(text)),
            ChatState::Compacting => {
                self.queue.enqueue(text);
            }
            ChatState::Streaming => {
                let detected = self
                    .settings
                    .interruption_enabled
                    .then(|| self.detector.detect(text))
                    .flatten();
                match detected {
                    Some(found) if found.should_interrupt => {
                        info!(keyword = %found.keyword, action = ?found.action, "interrupting generation");
                        self.stop_generation(&mut effects);
                        self.queue.pause();
                        if found.action == InterruptAction::Redirect
                            && let Some(redirect) = found.redirect_text(text)
                        {
                            effects.push(self.start_turn(&redirect));
                        }
                    }
                    Some(found) => {
                        debug!(keyword = %found.keyword, "possible interruption, asking user");
                        self.queue.enqueue(text);
                        effects.push(ChatEffect::ConfirmInterruption(found));
                    }
                    None => {
                        self.queue.enqueue(text);
                    }
                }
            }
        }
        effects
    }

    fn handle_stream(&mut self, generation: u64, event: StreamEvent) -> Vec<ChatEffect> {
        match self.stream.apply(generation, event) {
            StreamOutcome::Updated { message_id } => {
                let requested = self.stream.list().get(&message_id).is_some_and(|m| {
                    m.content
                        .iter()
                        .any(|item| matches!(item.kind, ContentKind::SummarizationRequested { .. }))
                });
                if requested && !self.auto_compact_pending {
                    info!(%message_id, "service requested summarization");
                    self.auto_compact_pending = true;
                }
                Vec::new()
            }
            StreamOutcome::Finished { .. } => {
                self.transition(Transition::GenerationEnded);
                self.after_generation()
            }
            StreamOutcome::Failed { error } => {
                self.transition(Transition::GenerationEnded);
                self.last_error = Some(CoreError::Service(ServiceError::api(error)));
                self.after_generation()
            }
            StreamOutcome::Stale | StreamOutcome::Noted => Vec::new(),
        }
    }

    fn after_generation(&mut self) -> Vec<ChatEffect> {
        if std::mem::take(&mut self.auto_compact_pending) {
            return self.begin_compaction(CompactionTrigger::Automatic);
        }
        self.drain_queue()
    }

    fn stop(&mut self) -> Vec<ChatEffect> {
        let mut effects = Vec::new();
        self.stop_generation(&mut effects);
        if !effects.is_empty() && !self.queue.is_empty() {
            self.queue.pause();
        }
        effects
    }

    fn edit(&mut self, message_id: &str, text: &str) -> Vec<ChatEffect> {
        if self.state == ChatState::Compacting {
            return self.reject(CoreError::CompactionInProgress);
        }
        let token = self.stream.active_generation().map(|g| g.cancel.clone());
        let edited = match self.stream.edit(message_id, text) {
            Ok(edited) => edited,
            Err(e) => return self.reject(e),
        };

        let mut effects = Vec::new();
        self.cancel_continuation(&mut effects);
        if let Some(token) = token {
            self.transition(Transition::GenerationEnded);
            effects.push(ChatEffect::CancelGeneration { token });
        }
        if edited.role == Role::User {
            effects.push(self.start_generation());
        }
        effects
    }

    fn send_now(&mut self, queued_id: &str) -> Vec<ChatEffect> {
        if self.state == ChatState::Compacting {
            return self.reject(CoreError::CompactionInProgress);
        }
        let item = match self.queue.take(queued_id) {
            Ok(item) => item,
            Err(e) => return self.reject(e),
        };
        let mut effects = Vec::new();
        self.cancel_continuation(&mut effects);
        self.stop_generation(&mut effects);
        info!(id = %item.id, "sending queued message now");
        effects.push(self.start_turn(&item.content));
        effects
    }

    fn drain_queue(&mut self) -> Vec<ChatEffect> {
        if !self.state.accepts_input() || self.continuation_pending {
            return Vec::new();
        }
        match self.queue.next_ready() {
            Some(item) => {
                info!(id = %item.id, remaining = self.queue.len(), "promoting queued message");
                vec![self.start_turn(&item.content)]
            }
            None => Vec::new(),
        }
    }

    fn request_compaction(&mut self, trigger: CompactionTrigger) -> Vec<ChatEffect> {
        if self.state == ChatState::Compacting {
            return self.reject(CoreError::CompactionInProgress);
        }
        let mut effects = Vec::new();
        self.stop_generation(&mut effects);
        effects.extend(self.begin_compaction(trigger));
        effects
    }

    fn begin_compaction(&mut self, trigger: CompactionTrigger) -> Vec<ChatEffect> {
        if self.session.is_none() {
            return self.reject(CoreError::AgentInit("no active session".to_string()));
        }
        if self.stream.messages().is_empty() {
            debug!(?trigger, "nothing to compact");
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.cancel_continuation(&mut effects);
        self.auto_compact_pending = false;
        self.transition(Transition::CompactionStarted);
        effects.push(ChatEffect::Compact {
            trigger,
            messages: self.stream.messages().to_vec(),
        });
        effects
    }

    fn context_limit_exceeded(&mut self) -> Vec<ChatEffect> {
        match self.state {
            ChatState::Idle => self.begin_compaction(CompactionTrigger::Automatic),
            ChatState::Streaming => {
                self.auto_compact_pending = true;
                Vec::new()
            }
            ChatState::Compacting => Vec::new(),
        }
    }

    fn usage_reported(&mut self, total_tokens: usize) -> Vec<ChatEffect> {
        if let Some(session) = &mut self.session {
            session.total_tokens = Some(total_tokens as i64);
        }
        let check = check_compaction_needed(
            total_tokens,
            self.settings.context_limit,
            self.settings.auto_threshold,
        );
        if check.needs_compaction {
            self.context_limit_exceeded()
        } else {
            Vec::new()
        }
    }

    fn resubmit(&mut self, message: Message) -> Vec<ChatEffect> {
        self.continuation_pending = false;
        if !self.state.accepts_input() {
            debug!(id = %message.id, state = ?self.state, "continuation dropped");
            return Vec::new();
        }
        if self.stream.list().get(&message.id).is_none() {
            self.stream.append(message);
        }
        vec![self.start_generation()]
    }

    fn compaction_settled(&mut self, result: CoreResult<CompactionOutcome>) -> Vec<ChatEffect> {
        self.transition(Transition::CompactionEnded);
        match result {
            Ok(CompactionOutcome::Compacted {
                continuation_scheduled,
                ..
            }) => {
                self.continuation_pending = continuation_scheduled;
                self.last_error = None;
            }
            Ok(CompactionOutcome::Failed { error }) | Err(error) => {
                self.last_error = Some(error);
            }
        }
        self.drain_queue()
    }

    fn session_loaded(&mut self, session: Session) -> Vec<ChatEffect> {
        let mut effects = Vec::new();
        self.stop_generation(&mut effects);
        self.cancel_continuation(&mut effects);
        info!(session_id = %session.id, messages = session.messages().len(), "session loaded");
        self.stream = MessageStream::from_history(session.messages().to_vec());
        self.session = Some(session);
        self.auto_compact_pending = false;
        self.transition(Transition::Reset);
        effects
    }

    fn reset(&mut self) -> Vec<ChatEffect> {
        let mut effects = Vec::new();
        self.stop_generation(&mut effects);
        self.cancel_continuation(&mut effects);
        self.session = None;
        self.stream = MessageStream::new();
        self.queue.clear();
        self.draft.clear();
        self.seen_inputs.clear();
        self.auto_compact_pending = false;
        self.last_error = None;
        self.transition(Transition::Reset);
        info!("chat reset");
        effects
    }
}
