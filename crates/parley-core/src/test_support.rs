//! Scripted collaborators shared by unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley_types::{
    ManageAction, Message, MessageContent, ServiceError, Session, SummarizeResponse, ToolResult,
};
use serde_json::{Value, json};

use crate::client::{ServiceResult, SessionService};

pub(crate) fn session(id: &str) -> Session {
    Session {
        id: id.to_string(),
        description: format!("session {id}"),
        working_dir: None,
        recipe: None,
        conversation: Some(Vec::new()),
        total_tokens: None,
    }
}

pub(crate) fn user(id: &str, text: &str) -> Message {
    Message::user(text).with_id(id)
}

pub(crate) fn assistant_text(id: &str, text: &str) -> Message {
    Message::assistant(vec![MessageContent::text(text)]).with_id(id)
}

/// Assistant message carrying only tool requests.
pub(crate) fn tool_call(id: &str, call_ids: &[&str]) -> Message {
    let content = call_ids
        .iter()
        .map(|call| MessageContent::tool_request(*call, "shell", json!({"command": "ls"})))
        .collect();
    Message::assistant(content).with_id(id)
}

/// User message carrying tool responses.
pub(crate) fn tool_result(id: &str, call_ids: &[&str]) -> Message {
    let content = call_ids
        .iter()
        .map(|call| {
            MessageContent::tool_response(
                *call,
                ToolResult {
                    is_error: false,
                    output: Value::String("ok".to_string()),
                },
            )
        })
        .collect();
    Message::new(parley_types::Role::User, content).with_id(id)
}

/// Session service whose responses are queued up front.
///
/// Unscripted calls succeed with a default payload.
#[derive(Default)]
pub(crate) struct MockService {
    pub delay: Duration,
    pub start_results: Mutex<VecDeque<ServiceResult<Session>>>,
    pub resume_results: Mutex<VecDeque<ServiceResult<Session>>>,
    pub summarize_results: Mutex<VecDeque<ServiceResult<SummarizeResponse>>>,
    pub start_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub summarize_calls: AtomicUsize,
    pub prompts: Mutex<Vec<(String, String)>>,
    pub providers: Mutex<Vec<(String, String, Option<String>)>>,
}

impl MockService {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push_start(&self, result: ServiceResult<Session>) {
        self.start_results.lock().unwrap().push_back(result);
    }

    pub fn push_resume(&self, result: ServiceResult<Session>) {
        self.resume_results.lock().unwrap().push_back(result);
    }

    pub fn push_summarize(&self, result: ServiceResult<SummarizeResponse>) {
        self.summarize_results.lock().unwrap().push_back(result);
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn summarizes(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl SessionService for MockService {
    async fn start(&self, _working_dir: &Path, _recipe: Option<&Value>) -> ServiceResult<Session> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self.start_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(session("started")))
    }

    async fn resume(&self, session_id: &str) -> ServiceResult<Session> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self.resume_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(session(session_id)))
    }

    async fn summarize(
        &self,
        _session_id: &str,
        _messages: &[Message],
        _action: ManageAction,
    ) -> ServiceResult<SummarizeResponse> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self.summarize_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Err(ServiceError::api("summarize not scripted")))
    }

    async fn extend_prompt(&self, session_id: &str, text: &str) -> ServiceResult<()> {
        self.prompts
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn update_agent_provider(
        &self,
        session_id: &str,
        provider: &str,
        model: Option<&str>,
    ) -> ServiceResult<()> {
        self.providers.lock().unwrap().push((
            session_id.to_string(),
            provider.to_string(),
            model.map(str::to_string),
        ));
        Ok(())
    }
}
