//! HTTP client for the embed control API.
//!
//! All calls carry the publishable API key as a bearer token and exchange
//! JSON bodies in the `{success, data, error}` envelope. Any non-2xx or
//! `success: false` response is run through the error classifier, so callers
//! only ever see [`EmbedError`] kinds.

pub mod types;

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::EmbedConfig;
use crate::errors::{classify, codes, EmbedError, EmbedResult};
use crate::messages::Message;

pub use types::{AssistantProfile, ChatSessionData, RateLimitInfo, TokenData};

use types::{Envelope, MessagesData};

/// Error bodies are capped before they end up in error messages.
const MAX_ERROR_BODY_LEN: usize = 500;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Control API client.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    debug: bool,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ApiClient {
    /// Build the client from validated configuration. No network I/O.
    pub fn new(config: &EmbedConfig) -> EmbedResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                EmbedError::Configuration(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(ApiClient {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            debug: config.debug,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> EmbedResult<Response> {
        if self.debug {
            debug!("POST {} body={:?}", path, body);
        }
        let mut request = self.http.post(self.url(path)).bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(request_error)
    }

    async fn get(&self, path: &str) -> EmbedResult<Response> {
        if self.debug {
            debug!("GET {}", path);
        }
        self.http
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(request_error)
    }

    /// Fetch a transport token for a new voice call.
    pub async fn fetch_token(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
    ) -> EmbedResult<TokenData> {
        let body = json!({
            "assistantId": assistant_id,
            "metadata": metadata,
        });
        let response = self.post("/api/v1/embed/token", Some(&body)).await?;
        decode_envelope(response).await
    }

    /// End a voice call server-side.
    pub async fn end_call(&self, call_id: &str) -> EmbedResult<()> {
        let path = format!("/api/v1/embed/calls/{call_id}/end");
        let response = self.post(&path, None).await?;
        decode_ack(response).await
    }

    /// Persist the mute state server-side.
    pub async fn set_muted(&self, call_id: &str, muted: bool) -> EmbedResult<()> {
        let path = format!("/api/v1/embed/calls/{call_id}/mute");
        let body = json!({ "muted": muted });
        let response = self.post(&path, Some(&body)).await?;
        decode_ack(response).await
    }

    /// Send a text message into an active voice call.
    pub async fn send_call_message(&self, call_id: &str, message: &str) -> EmbedResult<()> {
        let path = format!("/api/v1/embed/calls/{call_id}/messages");
        let body = json!({ "message": message });
        let response = self.post(&path, Some(&body)).await?;
        decode_ack(response).await
    }

    /// List recent call messages (polling fallback).
    pub async fn get_call_messages(
        &self,
        call_id: &str,
        limit: u32,
        offset: u32,
    ) -> EmbedResult<Vec<Message>> {
        let path = format!("/api/v1/embed/calls/{call_id}/messages?limit={limit}&offset={offset}");
        let response = self.get(&path).await?;
        let data: MessagesData = decode_envelope(response).await?;
        Ok(data.messages)
    }

    /// Create a chat session.
    pub async fn start_chat(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
    ) -> EmbedResult<ChatSessionData> {
        let body = json!({
            "assistantId": assistant_id,
            "metadata": metadata,
        });
        let response = self.post("/api/v1/embed/chat", Some(&body)).await?;
        decode_envelope(response).await
    }

    /// Send a chat message. On success the raw response is returned so the
    /// caller can consume the framed event stream in its body.
    pub async fn send_chat_message(
        &self,
        chat_id: &str,
        content: &str,
    ) -> EmbedResult<Response> {
        let path = format!("/api/v1/embed/chat/{chat_id}/messages");
        let body = json!({ "content": content });
        let response = self.post(&path, Some(&body)).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_failure(status, response).await);
        }
        Ok(response)
    }

    /// End a chat session server-side.
    pub async fn end_chat(&self, chat_id: &str) -> EmbedResult<()> {
        let path = format!("/api/v1/embed/chat/{chat_id}/end");
        let response = self.post(&path, None).await?;
        decode_ack(response).await
    }
}

fn request_error(e: reqwest::Error) -> EmbedError {
    EmbedError::connection(codes::CONNECTION_FAILED, format!("Request failed: {e}"))
}

/// Decode an enveloped response, classifying every failure shape.
async fn decode_envelope<T: DeserializeOwned>(response: Response) -> EmbedResult<T> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(request_error)?;

    match serde_json::from_slice::<Envelope<T>>(&bytes) {
        Ok(envelope) => {
            if status.is_success() && envelope.success {
                envelope.data.ok_or_else(|| EmbedError::Api {
                    status: Some(status.as_u16()),
                    code: codes::API_ERROR.to_string(),
                    message: "Response envelope carried no data".to_string(),
                    details: None,
                })
            } else {
                Err(classify_envelope(status, envelope.error))
            }
        }
        Err(_) if !status.is_success() => {
            Err(classify(
                Some(status.as_u16()),
                None,
                capped_body(&bytes),
                None,
            ))
        }
        Err(e) => Err(EmbedError::Api {
            status: Some(status.as_u16()),
            code: codes::API_ERROR.to_string(),
            message: format!("Invalid response body: {e}"),
            details: None,
        }),
    }
}

/// Decode an acknowledgement-only response (`{success}` with no data).
async fn decode_ack(response: Response) -> EmbedResult<()> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(request_error)?;

    match serde_json::from_slice::<Envelope<Value>>(&bytes) {
        Ok(envelope) if status.is_success() && envelope.success => Ok(()),
        Ok(envelope) => Err(classify_envelope(status, envelope.error)),
        Err(_) if status.is_success() => Ok(()),
        Err(_) => Err(classify(
            Some(status.as_u16()),
            None,
            capped_body(&bytes),
            None,
        )),
    }
}

/// Classify a failure response whose body has not been read yet.
async fn error_from_failure(status: StatusCode, response: Response) -> EmbedError {
    let bytes = response.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<Envelope<Value>>(&bytes) {
        Ok(envelope) => classify_envelope(status, envelope.error),
        Err(_) => classify(Some(status.as_u16()), None, capped_body(&bytes), None),
    }
}

fn classify_envelope(status: StatusCode, error: Option<types::ApiErrorBody>) -> EmbedError {
    let status = Some(status.as_u16());
    match error {
        Some(body) => classify(status, body.code, body.message, body.details),
        None => classify(status, None, "Request failed".to_string(), None),
    }
}

fn capped_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() > MAX_ERROR_BODY_LEN {
        // Back off to a char boundary so the slice never splits a
        // multi-byte character.
        let mut cut = MAX_ERROR_BODY_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... (truncated)", &text[..cut])
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_body_truncates_long_bodies() {
        let body = "x".repeat(2000);
        let capped = capped_body(body.as_bytes());
        assert!(capped.ends_with("... (truncated)"));
        assert!(capped.len() <= MAX_ERROR_BODY_LEN + 20);
    }

    #[test]
    fn test_capped_body_respects_char_boundaries() {
        // Three-byte characters guarantee the cap lands mid-character.
        let body = "€".repeat(400);
        let capped = capped_body(body.as_bytes());
        assert!(capped.ends_with("... (truncated)"));
        assert!(capped.starts_with('€'));
    }

    #[test]
    fn test_capped_body_passes_short_bodies_through() {
        assert_eq!(capped_body(b"plain error"), "plain error");
    }
}
