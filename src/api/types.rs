//! Wire types for the control API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::Message;

/// Standard `{success, data, error}` response envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default = "none")]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

fn none<T>() -> Option<T> {
    None
}

/// Error body shape returned on `success: false` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Assistant profile as returned by token and chat-creation responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Rate-limit metadata attached to the token response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    #[serde(default)]
    pub requests_remaining: Option<u64>,
    #[serde(default)]
    pub reset_at: Option<u64>,
}

/// Successful transport-token response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub call_id: String,
    pub token: String,
    pub url: String,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub assistant: Option<AssistantProfile>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitInfo>,
}

/// Successful chat-session creation response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionData {
    pub chat_id: String,
    #[serde(default)]
    pub assistant: Option<AssistantProfile>,
    #[serde(default)]
    pub started_at: Option<u64>,
}

/// Paged message listing from the polling fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesData {
    #[serde(default)]
    pub messages: Vec<Message>,
}
