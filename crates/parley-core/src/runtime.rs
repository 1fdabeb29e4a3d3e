//! Chat runtime: owns the controller, runs the event loop and executes
//! effects.
//!
//! ## Inbox pattern
//!
//! Everything asynchronous reports back through one unbounded inbox:
//! - generation handlers send [`ChatEvent::Stream`] through
//!   [`GenerationEvents`];
//! - the compactor writes through [`InboxSink`], which turns its calls into
//!   [`ChatEvent::ReplaceMessages`] and [`ChatEvent::Resubmit`];
//! - compaction tasks finish with [`ChatEvent::CompactionSettled`].
//!
//! The controller is only touched from the loop, so it stays the single
//! writer of the message list.

use std::sync::Arc;

use async_trait::async_trait;
use parley_types::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatController, ChatEffect, ChatEvent};
use crate::compaction::{CompactionSink, ContextCompactor};
use crate::interrupt::InterruptMatch;
use crate::stream::StreamEvent;

/// Sender for the runtime's event inbox.
pub type ChatEventSender = mpsc::UnboundedSender<ChatEvent>;

/// Receiver for the runtime's event inbox.
pub type ChatEventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

/// Sends stream events for one generation into the inbox.
#[derive(Debug, Clone)]
pub struct GenerationEvents {
    generation: u64,
    inbox: ChatEventSender,
}

impl GenerationEvents {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the runtime is gone.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.inbox
            .send(ChatEvent::Stream {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Transport for model replies. The runtime hands it every generation the
/// controller starts.
#[async_trait]
pub trait GenerationHandler: Send + Sync {
    /// Streams the reply to `messages` through `events` until it finishes or
    /// `cancel` fires.
    async fn generate(
        &self,
        session_id: String,
        messages: Vec<Message>,
        events: GenerationEvents,
        cancel: CancellationToken,
    );

    /// Called when input looked like an interruption that needs the user to
    /// confirm it.
    fn confirm_interruption(&self, _found: &InterruptMatch) {}
}

/// [`CompactionSink`] that forwards writes to the runtime inbox.
#[derive(Debug, Clone)]
pub struct InboxSink {
    inbox: ChatEventSender,
}

impl InboxSink {
    pub fn new(inbox: ChatEventSender) -> Self {
        Self { inbox }
    }
}

impl CompactionSink for InboxSink {
    fn set_messages(&self, messages: Vec<Message>) {
        if self.inbox.send(ChatEvent::ReplaceMessages(messages)).is_err() {
            debug!("runtime gone, compacted messages dropped");
        }
    }

    fn append(&self, message: Message) {
        if self.inbox.send(ChatEvent::Resubmit(message)).is_err() {
            debug!("runtime gone, continuation dropped");
        }
    }
}

pub struct ChatRuntime {
    pub controller: ChatController,
    compactor: Arc<ContextCompactor>,
    handler: Arc<dyn GenerationHandler>,
    inbox_tx: ChatEventSender,
    inbox_rx: ChatEventReceiver,
}

impl ChatRuntime {
    pub fn new(
        controller: ChatController,
        compactor: Arc<ContextCompactor>,
        handler: Arc<dyn GenerationHandler>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            controller,
            compactor,
            handler,
            inbox_tx,
            inbox_rx,
        }
    }

    /// Handle for feeding events from outside the loop.
    pub fn sender(&self) -> ChatEventSender {
        self.inbox_tx.clone()
    }

    /// Runs one event through the controller and executes its effects.
    pub fn dispatch(&mut self, event: ChatEvent) {
        let effects = self.controller.update(event);
        self.execute_effects(effects);
    }

    /// Waits for the next inbox event and dispatches it.
    pub async fn step(&mut self) -> bool {
        match self.inbox_rx.recv().await {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Processes inbox events until `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!("chat runtime started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                more = self.step() => if !more { break },
            }
        }
        self.dispatch(ChatEvent::Stop);
        info!("chat runtime stopped");
    }

    fn execute_effects(&mut self, effects: Vec<ChatEffect>) {
        for effect in effects {
            self.execute_effect(effect);
        }
    }

    fn execute_effect(&mut self, effect: ChatEffect) {
        match effect {
            ChatEffect::StartGeneration {
                generation,
                messages,
                cancel,
            } => {
                let session_id = self.controller.session_id().unwrap_or_default().to_string();
                let handler = Arc::clone(&self.handler);
                let events = GenerationEvents {
                    generation,
                    inbox: self.inbox_tx.clone(),
                };
                debug!(generation, messages = messages.len(), "starting generation");
                tokio::spawn(async move {
                    handler.generate(session_id, messages, events, cancel).await;
                });
            }
            ChatEffect::CancelGeneration { token } => token.cancel(),
            ChatEffect::Compact { trigger, messages } => {
                let Some(session_id) = self.controller.session_id().map(str::to_string) else {
                    warn!("compaction requested without a session");
                    return;
                };
                let compactor = Arc::clone(&self.compactor);
                let inbox = self.inbox_tx.clone();
                let sink: Arc<dyn CompactionSink> = Arc::new(InboxSink::new(inbox.clone()));
                tokio::spawn(async move {
                    let result = compactor.compact(&session_id, messages, trigger, sink).await;
                    if inbox.send(ChatEvent::CompactionSettled(result)).is_err() {
                        debug!("runtime gone, compaction result dropped");
                    }
                });
            }
            ChatEffect::ConfirmInterruption(found) => {
                info!(keyword = %found.keyword, confidence = found.confidence, "interruption needs confirmation");
                self.handler.confirm_interruption(&found);
            }
            ChatEffect::CancelScheduledContinuation => {
                self.compactor.cancel_pending_continuation();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use parley_types::{MessageContent, SummarizeResponse};

    use super::*;
    use crate::chat::{ChatSettings, ChatState};
    use crate::test_support::{MockService, assistant_text, session, user};

    /// Replies with scripted events, defaulting to a short text answer.
    #[derive(Default)]
    struct ScriptedHandler {
        replies: Mutex<VecDeque<Vec<StreamEvent>>>,
        requests: Mutex<Vec<Vec<Message>>>,
        confirmations: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn push(&self, events: Vec<StreamEvent>) {
            self.replies.lock().unwrap().push_back(events);
        }

        fn requests(&self) -> Vec<Vec<Message>> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationHandler for ScriptedHandler {
        async fn generate(
            &self,
            _session_id: String,
            messages: Vec<Message>,
            events: GenerationEvents,
            _cancel: CancellationToken,
        ) {
            self.requests.lock().unwrap().push(messages);
            let scripted = self.replies.lock().unwrap().pop_front();
            let reply = scripted.unwrap_or_else(|| {
                vec![
                    StreamEvent::Message {
                        message: Message::assistant(vec![MessageContent::text("ok")]),
                    },
                    StreamEvent::Finish {
                        reason: "stop".to_string(),
                    },
                ]
            });
            for event in reply {
                events.send(event);
            }
        }

        fn confirm_interruption(&self, found: &InterruptMatch) {
            self.confirmations
                .lock()
                .unwrap()
                .push(found.keyword.clone());
        }
    }

    fn runtime(service: Arc<MockService>, handler: Arc<ScriptedHandler>) -> ChatRuntime {
        let compactor = Arc::new(ContextCompactor::new(service, Duration::from_millis(100)));
        let mut runtime = ChatRuntime::new(
            ChatController::new(ChatSettings::default()),
            compactor,
            handler,
        );
        runtime.dispatch(ChatEvent::SessionLoaded(session("s1")));
        runtime
    }

    async fn run_until(runtime: &mut ChatRuntime, done: impl Fn(&ChatController) -> bool) {
        for _ in 0..50 {
            if done(&runtime.controller) {
                return;
            }
            assert!(runtime.step().await);
        }
        panic!("condition not reached");
    }

    fn submit(runtime: &mut ChatRuntime, id: &str, text: &str) {
        runtime.dispatch(ChatEvent::SubmitInput {
            input_id: id.to_string(),
            text: text.to_string(),
        });
    }

    #[tokio::test]
    async fn test_turn_round_trip() {
        let handler = Arc::new(ScriptedHandler::default());
        let mut runtime = runtime(Arc::new(MockService::default()), Arc::clone(&handler));

        submit(&mut runtime, "i1", "hello");
        run_until(&mut runtime, |c| c.state() == ChatState::Idle).await;

        let texts: Vec<String> = runtime.controller.messages().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["hello", "ok"]);
        assert_eq!(handler.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_queued_input_runs_after_current_turn() {
        let handler = Arc::new(ScriptedHandler::default());
        let mut runtime = runtime(Arc::new(MockService::default()), Arc::clone(&handler));

        submit(&mut runtime, "i1", "first question");
        submit(&mut runtime, "i2", "second question");
        assert_eq!(runtime.controller.queue().len(), 1);

        run_until(&mut runtime, |c| {
            c.state() == ChatState::Idle && c.queue().is_empty()
        })
        .await;

        assert_eq!(runtime.controller.messages().len(), 4);
        assert_eq!(handler.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_compaction_resubmits_continuation() {
        let service = Arc::new(MockService::default());
        service.push_summarize(Ok(SummarizeResponse {
            messages: vec![
                assistant_text("m1", "Conversation compacted"),
                user("s1", "summary"),
                user("c1", "continue where we left off").as_continuation(),
            ],
            token_counts: vec![5, 10, 5],
        }));
        let handler = Arc::new(ScriptedHandler::default());
        handler.push(vec![
            StreamEvent::Message {
                message: Message::assistant(vec![MessageContent::summarization_requested(
                    "context limit reached",
                )])
                .with_id("a1"),
            },
            StreamEvent::Finish {
                reason: "context".to_string(),
            },
        ]);
        let mut runtime = runtime(Arc::clone(&service), Arc::clone(&handler));

        submit(&mut runtime, "i1", "big task");
        run_until(&mut runtime, |c| c.is_continuation_pending()).await;
        assert_eq!(service.summarizes(), 1);
        assert_eq!(runtime.controller.messages().len(), 3);
        assert_eq!(runtime.controller.stream().list().history_index(), 3);

        // The continuation fires after the delay and starts a new turn.
        run_until(&mut runtime, |c| {
            !c.is_continuation_pending() && c.state() == ChatState::Idle
        })
        .await;
        let requests = handler.requests();
        assert_eq!(requests.len(), 2);
        // Summary and continuation are both user turns, so they go out merged.
        assert!(
            requests[1]
                .last()
                .unwrap()
                .text()
                .ends_with("continue where we left off")
        );
    }

    #[tokio::test]
    async fn test_failed_compaction_appends_marker() {
        let handler = Arc::new(ScriptedHandler::default());
        let mut runtime = runtime(Arc::new(MockService::default()), handler);
        runtime.dispatch(ChatEvent::ReplaceMessages(vec![user("u1", "hi")]));

        runtime.dispatch(ChatEvent::CompactRequested(
            crate::compaction::CompactionTrigger::Manual,
        ));
        assert_eq!(runtime.controller.state(), ChatState::Compacting);
        run_until(&mut runtime, |c| c.state() == ChatState::Idle).await;

        let messages = runtime.controller.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].text().starts_with("Compaction failed"));
        assert!(runtime.controller.last_error().is_some());
    }

    #[tokio::test]
    async fn test_weak_interruption_reaches_handler() {
        let handler = Arc::new(ScriptedHandler::default());
        let mut runtime = runtime(Arc::new(MockService::default()), Arc::clone(&handler));

        submit(&mut runtime, "i1", "summarise the report");
        submit(&mut runtime, "i2", "oh actually");

        assert_eq!(
            *handler.confirmations.lock().unwrap(),
            vec!["actually".to_string()]
        );
    }
}
