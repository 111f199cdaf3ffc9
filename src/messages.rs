//! Conversation message model and data-channel payload decoding.
//!
//! Voice sessions receive small JSON payloads over the transport's data
//! channel. Each payload carries a `type` tag that selects how it is
//! surfaced: conversation messages go through the dedup ledger, transcription
//! fragments bypass it, and tool/metrics/barge-in/call-ending payloads are
//! forwarded as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Role of a conversation message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    fn from_wire(value: &str) -> Self {
        match value {
            "user" => MessageRole::User,
            "system" => MessageRole::System,
            "tool" => MessageRole::Tool,
            _ => MessageRole::Assistant,
        }
    }
}

/// A single conversation message.
///
/// `id` is unique within a session's lifetime: server-issued for chat,
/// derived from the data-channel payload or synthesized with a time-based
/// suffix for transcribed speech. Only the latest delivered version for a
/// given id belongs in an ordered transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_role")]
    pub role: MessageRole,
    #[serde(default, alias = "text", alias = "message")]
    pub content: String,
    #[serde(default = "now_millis")]
    pub timestamp: u64,
    /// Whether this is the final version of the message.
    #[serde(default = "default_true")]
    pub is_complete: bool,
    /// Whether more chunks for this id are still expected.
    #[serde(default)]
    pub is_streaming: bool,
}

fn default_role() -> MessageRole {
    MessageRole::Assistant
}

fn default_true() -> bool {
    true
}

/// A live transcription fragment. Forwarded to subscribers unconditionally,
/// never retained or deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_role")]
    pub role: MessageRole,
    #[serde(default, alias = "content")]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default = "now_millis")]
    pub timestamp: u64,
}

/// Decoded data-channel payload, branched on the `type` tag.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Conversation(Message),
    Transcription(TranscriptionEvent),
    Tool(Value),
    Metrics(Value),
    BargeIn(Value),
    CallEnding(Value),
}

/// Decode a raw data-channel payload. Returns `None` for payloads that are
/// not JSON, carry no `type` tag, or carry an unrecognized one.
pub fn decode_data_payload(payload: &[u8]) -> Option<DataPayload> {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("Ignoring non-JSON data payload: {}", e);
            return None;
        }
    };

    let kind = value.get("type").and_then(Value::as_str)?.to_string();
    match kind.as_str() {
        "message" | "conversation_item" => {
            let mut message: Message = serde_json::from_value(value).ok()?;
            if message.id.is_empty() {
                message.id = format!("msg-{}", now_millis());
            }
            Some(DataPayload::Conversation(message))
        }
        "transcription_stream" => {
            let mut event: TranscriptionEvent = serde_json::from_value(value).ok()?;
            if event.id.is_empty() {
                event.id = format!("transcript-{}", now_millis());
            }
            Some(DataPayload::Transcription(event))
        }
        "metrics" => Some(DataPayload::Metrics(value)),
        "barge_in" => Some(DataPayload::BargeIn(value)),
        "call_ending" => Some(DataPayload::CallEnding(value)),
        other if other.starts_with("tool_") => Some(DataPayload::Tool(value)),
        other => {
            debug!("Ignoring data payload with unknown type: {}", other);
            None
        }
    }
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
