//! Errors and response envelopes for the remote session service.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a session-service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// Non-success HTTP status not covered by a more specific kind
    HttpStatus,
    /// Request or connect timeout
    Timeout,
    /// Server unreachable
    Connect,
    /// Response body did not match the expected shape
    Parse,
    /// Session (or route) does not exist
    NotFound,
    /// The agent has no provider/model configured yet
    ProviderNotConfigured,
    /// Error reported inside a well-formed response envelope
    Api,
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceErrorKind::HttpStatus => write!(f, "http_status"),
            ServiceErrorKind::Timeout => write!(f, "timeout"),
            ServiceErrorKind::Connect => write!(f, "connect"),
            ServiceErrorKind::Parse => write!(f, "parse"),
            ServiceErrorKind::NotFound => write!(f, "not_found"),
            ServiceErrorKind::ProviderNotConfigured => write!(f, "provider_not_configured"),
            ServiceErrorKind::Api => write!(f, "api"),
        }
    }
}

/// Structured error from the session service with kind and details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
    /// Raw response body or transport error text
    pub details: Option<String>,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Classifies a non-success response.
    ///
    /// The server reports failures as `{"error": "..."}`; that text becomes the
    /// message when present, otherwise the raw body is kept as details.
    pub fn http_status(status: u16, body: &str) -> Self {
        let server_message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| json.get("error").and_then(Value::as_str).map(str::to_string));

        let lowered = body.to_ascii_lowercase();
        let mentions_provider = lowered.contains("no provider")
            || lowered.contains("provider not configured")
            || lowered.contains("provider is not configured");

        let kind = match status {
            404 => ServiceErrorKind::NotFound,
            424 | 428 => ServiceErrorKind::ProviderNotConfigured,
            _ if mentions_provider => ServiceErrorKind::ProviderNotConfigured,
            _ => ServiceErrorKind::HttpStatus,
        };

        let message = match &server_message {
            Some(msg) => format!("HTTP {status}: {msg}"),
            None => format!("HTTP {status}"),
        };

        Self {
            kind,
            message,
            status: Some(status),
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Connect, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Parse, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Api, message)
    }

    /// Worth retrying: timeouts, connection failures and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ServiceErrorKind::Timeout | ServiceErrorKind::Connect => true,
            ServiceErrorKind::HttpStatus => self.status.is_some_and(|s| (500..600).contains(&s)),
            _ => false,
        }
    }

    pub fn is_provider_missing(&self) -> bool {
        self.kind == ServiceErrorKind::ProviderNotConfigured
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServiceError {}

/// Discriminated success/error body returned by the session service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Error { error: String },
    Data(T),
}

impl<T> Envelope<T> {
    /// "Throw on error": converts the envelope into a `Result`.
    pub fn into_result(self) -> Result<T, ServiceError> {
        match self {
            Envelope::Data(data) => Ok(data),
            Envelope::Error { error } => Err(ServiceError::api(error)),
        }
    }
}
