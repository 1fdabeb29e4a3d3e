//! HTTP implementation of [`SessionService`].

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parley_types::{Envelope, ManageAction, Message, ServiceError, Session, SummarizeResponse};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{ServiceResult, SessionService};
use crate::config::ServerConfig;

const SECRET_HEADER: &str = "X-Secret-Key";

/// Talks to the session service over JSON/HTTP.
#[derive(Debug, Clone)]
pub struct HttpSessionClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpSessionClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        // Url::join drops the last path segment unless the base ends in '/'.
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("Invalid server URL: {}", config.base_url))?;

        let mut headers = HeaderMap::new();
        if let Some(secret) = config.secret_key.as_deref().filter(|s| !s.is_empty()) {
            let value = HeaderValue::from_str(secret).context("Secret key is not a valid header")?;
            headers.insert(SECRET_HEADER, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn send<B: Serialize + Sync>(&self, path: &str, body: &B) -> ServiceResult<String> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ServiceError::connect(format!("Invalid endpoint {path}: {e}")))?;
        debug!(%url, "session service request");

        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(ServiceError::http_status(status.as_u16(), &text));
        }
        Ok(text)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> ServiceResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let text = self.send(path, body).await?;
        decode_envelope::<T>(&text)?.into_result()
    }

    /// POST whose success body carries nothing the caller needs.
    async fn post_unit<B: Serialize + Sync>(&self, path: &str, body: &B) -> ServiceResult<()> {
        let text = self.send(path, body).await?;
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => match error_message(&value) {
                Some(message) => Err(ServiceError::api(message)),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::timeout(format!("Request timed out: {err}"))
    } else if err.is_decode() {
        ServiceError::parse(format!("Failed to read response: {err}"))
    } else {
        ServiceError::connect(format!("Request failed: {err}"))
    }
}

/// Text of an error envelope: any object with a string `error` field.
fn error_message(value: &Value) -> Option<String> {
    value.get("error")?.as_str().map(str::to_string)
}

/// Decodes a success body into an [`Envelope`], keeping serde's error text
/// when the payload does not match `T`.
fn decode_envelope<T: DeserializeOwned>(body: &str) -> ServiceResult<Envelope<T>> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        ServiceError::parse(format!("Response is not JSON: {e}")).with_details(body)
    })?;

    if let Some(error) = error_message(&value) {
        return Ok(Envelope::Error { error });
    }

    serde_json::from_value(value)
        .map(Envelope::Data)
        .map_err(|e| ServiceError::parse(format!("Unexpected response shape: {e}")).with_details(body))
}

#[derive(Serialize)]
struct StartRequest<'a> {
    working_dir: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipe: Option<&'a Value>,
}

#[derive(Serialize)]
struct ManageRequest<'a> {
    session_id: &'a str,
    messages: &'a [Message],
    manage_action: ManageAction,
}

#[async_trait]
impl SessionService for HttpSessionClient {
    async fn start(&self, working_dir: &Path, recipe: Option<&Value>) -> ServiceResult<Session> {
        self.post("agent/start", &StartRequest { working_dir, recipe })
            .await
    }

    async fn resume(&self, session_id: &str) -> ServiceResult<Session> {
        self.post("agent/resume", &json!({ "session_id": session_id }))
            .await
    }

    async fn summarize(
        &self,
        session_id: &str,
        messages: &[Message],
        action: ManageAction,
    ) -> ServiceResult<SummarizeResponse> {
        let body = ManageRequest {
            session_id,
            messages,
            manage_action: action,
        };
        self.post("context/manage", &body).await
    }

    async fn extend_prompt(&self, session_id: &str, text: &str) -> ServiceResult<()> {
        self.post_unit(
            "agent/prompt",
            &json!({ "session_id": session_id, "extension": text }),
        )
        .await
    }

    async fn update_agent_provider(
        &self,
        session_id: &str,
        provider: &str,
        model: Option<&str>,
    ) -> ServiceResult<()> {
        let mut body = json!({ "session_id": session_id, "provider": provider });
        if let Some(model) = model {
            body["model"] = Value::String(model.to_string());
        }
        self.post_unit("agent/update_provider", &body).await
    }
}

#[cfg(test)]
mod tests {
    use parley_types::{MessageContent, ServiceErrorKind};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer, secret: Option<&str>) -> HttpSessionClient {
        HttpSessionClient::new(&ServerConfig {
            base_url: server.uri(),
            secret_key: secret.map(str::to_string),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_posts_working_dir_and_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/start"))
            .and(header(SECRET_HEADER, "s3cret"))
            .and(body_partial_json(json!({"working_dir": "/work"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "20250101_1",
                "description": "New session",
                "working_dir": "/work"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("s3cret"));
        let session = client.start(Path::new("/work"), None).await.unwrap();
        assert_eq!(session.id, "20250101_1");
        assert_eq!(session.title(), "New session");
    }

    #[tokio::test]
    async fn test_base_url_path_prefix_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agent/resume"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "abc"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpSessionClient::new(&ServerConfig {
            base_url: format!("{}/api", server.uri()),
            ..Default::default()
        })
        .unwrap();
        let session = client.resume("abc").await.unwrap();
        assert_eq!(session.id, "abc");
    }

    #[tokio::test]
    async fn test_missing_provider_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/start"))
            .respond_with(
                ResponseTemplate::new(428).set_body_json(json!({"error": "Provider not set"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .start(Path::new("/work"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::ProviderNotConfigured);
        assert_eq!(err.status, Some(428));
        assert_eq!(err.message, "HTTP 428: Provider not set");
    }

    #[tokio::test]
    async fn test_error_envelope_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/resume"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "session busy"})))
            .mount(&server)
            .await;

        let err = client_for(&server, None).resume("abc").await.unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::Api);
        assert_eq!(err.message, "session busy");
    }

    #[tokio::test]
    async fn test_error_envelope_with_extra_fields_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/resume"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": "session busy",
                "code": "busy",
                "retry_after": 3
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/agent/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": "prompt rejected",
                "code": 7
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let err = client.resume("abc").await.unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::Api);
        assert_eq!(err.message, "session busy");

        let err = client.extend_prompt("abc", "be brief").await.unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::Api);
        assert_eq!(err.message, "prompt rejected");
    }

    #[tokio::test]
    async fn test_malformed_session_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/resume"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "no id"})))
            .mount(&server)
            .await;

        let err = client_for(&server, None).resume("abc").await.unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::Parse);
        assert!(err.details.is_some());
    }

    #[tokio::test]
    async fn test_summarize_sends_manage_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/context/manage"))
            .and(body_partial_json(json!({
                "session_id": "abc",
                "manage_action": "summarize"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{
                    "id": "m1",
                    "role": "user",
                    "created": 0,
                    "content": [{"type": "text", "text": "summary"}]
                }],
                "token_counts": [12]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let history = vec![Message::user("hello")];
        let response = client_for(&server, None)
            .summarize("abc", &history, ManageAction::Summarize)
            .await
            .unwrap();
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.messages[0].content[0], MessageContent::text("summary"));
        assert_eq!(response.token_counts, vec![12]);
    }

    #[tokio::test]
    async fn test_update_provider_omits_missing_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent/update_provider"))
            .and(body_partial_json(json!({"session_id": "abc", "provider": "openai"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server, None)
            .update_agent_provider("abc", "openai", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let client = HttpSessionClient::new(&ServerConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            secret_key: None,
            timeout_secs: 2,
        })
        .unwrap();

        let err = client.resume("abc").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }
}
