//! Text chat session controller.
//!
//! Chat sessions are REST-backed: a session is created, each user message is
//! posted and answered with a framed event stream, and the session is ended
//! explicitly. The awkward part is the start/end race: `end_chat_session`
//! called while `start_chat_session` is awaiting the server must abort the
//! start (or, if the server already answered, immediately end the session it
//! created) without leaking a half-open session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, AssistantProfile};
use crate::errors::{classify, codes, EmbedError, EmbedResult};
use crate::events::{ClientEvent, EventBus};
use crate::messages::{now_millis, Message, MessageRole};
use crate::session::{SessionMode, SessionState, SharedSession};
use crate::stream::{StreamParser, StreamRecord};

/// Controller for text chat sessions.
pub struct ChatController {
    api: Arc<ApiClient>,
    bus: Arc<EventBus>,
    shared: Arc<SharedSession>,
    start_cancel: Mutex<Option<CancellationToken>>,
    end_after_start: AtomicBool,
    assistant: Mutex<Option<AssistantProfile>>,
}

impl ChatController {
    pub fn new(api: Arc<ApiClient>, bus: Arc<EventBus>, shared: Arc<SharedSession>) -> Self {
        ChatController {
            api,
            bus,
            shared,
            start_cancel: Mutex::new(None),
            end_after_start: AtomicBool::new(false),
            assistant: Mutex::new(None),
        }
    }

    /// Start a chat session with the given assistant.
    ///
    /// Returns `Ok(Some(chat_id))` on success, `Ok(None)` when the start was
    /// aborted by a concurrent `end_chat_session` (treated as a clean
    /// disconnect, not an error), and `Err` on failure.
    pub async fn start_chat_session(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
    ) -> EmbedResult<Option<String>> {
        self.shared.ensure_can_start(SessionMode::Chat)?;
        self.shared.clear_ledger();
        self.end_after_start.store(false, Ordering::SeqCst);
        self.shared
            .transition(SessionState::Connecting, SessionMode::Chat, &self.bus);

        let cancel = CancellationToken::new();
        *self.start_cancel.lock() = Some(cancel.clone());

        let result = tokio::select! {
            result = self.api.start_chat(assistant_id, metadata) => Some(result),
            _ = cancel.cancelled() => None,
        };
        *self.start_cancel.lock() = None;

        let session = match result {
            None => {
                // Aborted while the request was still in flight.
                return self.finish_aborted_start(None).await;
            }
            Some(Err(e)) => {
                self.shared
                    .transition(SessionState::Idle, SessionMode::Chat, &self.bus);
                self.bus.emit(ClientEvent::Error(e.clone()));
                self.bus.emit(ClientEvent::Disconnected {
                    mode: SessionMode::Chat,
                    reason: Some(format!("Chat start failed: {e}")),
                });
                return Err(e);
            }
            Some(Ok(session)) => session,
        };

        if self.end_after_start.swap(false, Ordering::SeqCst) {
            // The server answered after end was requested. The session
            // exists remotely, so end it there too.
            return self.finish_aborted_start(Some(session.chat_id)).await;
        }

        self.shared.set_chat_id(Some(session.chat_id.clone()));
        *self.assistant.lock() = session.assistant.clone();
        self.shared
            .transition(SessionState::Connected, SessionMode::Chat, &self.bus);
        self.bus.emit(ClientEvent::Connected {
            mode: SessionMode::Chat,
        });
        info!("Chat session {} started", session.chat_id);
        Ok(Some(session.chat_id))
    }

    /// End the current chat session (or abort one that is still starting).
    /// A no-op when nothing is active.
    pub async fn end_chat_session(&self) -> EmbedResult<()> {
        if let Some(cancel) = self.start_cancel.lock().as_ref() {
            self.end_after_start.store(true, Ordering::SeqCst);
            cancel.cancel();
            return Ok(());
        }

        let chat_id = self.shared.chat_id();
        if chat_id.is_none() {
            // Without a chat id there is only something to clean up when a
            // chat start is mid-flight. Never touch voice state.
            let chat_busy = self.shared.mode() == Some(SessionMode::Chat)
                && !self.shared.state().can_start();
            if !chat_busy {
                return Ok(());
            }
        }

        self.shared
            .transition(SessionState::Disconnecting, SessionMode::Chat, &self.bus);

        if let Some(id) = &chat_id {
            if let Err(e) = self.api.end_chat(id).await {
                warn!("Failed to end chat {} server-side: {}", id, e);
            }
        }

        self.shared.set_chat_id(None);
        self.shared.clear_ledger();
        *self.assistant.lock() = None;

        self.shared
            .transition(SessionState::Disconnected, SessionMode::Chat, &self.bus);
        self.bus.emit(ClientEvent::Disconnected {
            mode: SessionMode::Chat,
            reason: None,
        });
        info!("Chat session ended");
        Ok(())
    }

    /// Send a user message and consume the streamed assistant reply.
    ///
    /// The user's own message is surfaced immediately as a `message` event;
    /// the assistant reply is emitted once, when its `message:complete`
    /// record arrives. Returns after the stream finishes.
    pub async fn send_chat_message(&self, content: &str) -> EmbedResult<()> {
        let chat_id = self.shared.chat_id().ok_or_else(|| {
            EmbedError::client(codes::NOT_CONNECTED, "No active chat session")
        })?;
        if self.shared.state() != SessionState::Connected {
            return Err(EmbedError::client(
                codes::NOT_CONNECTED,
                "Chat session is not connected",
            ));
        }

        let user_message = Message {
            id: format!("user-{}", now_millis()),
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: now_millis(),
            is_complete: true,
            is_streaming: false,
        };
        self.shared.admit_complete(&user_message.id);
        self.bus.emit(ClientEvent::Message(user_message));

        let response = self.api.send_chat_message(&chat_id, content).await?;

        let mut parser = StreamParser::new();
        let mut reply = ReplyAccumulator::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                EmbedError::connection(
                    codes::CONNECTION_FAILED,
                    format!("Chat stream interrupted: {e}"),
                )
            })?;
            for record in parser.push(&chunk) {
                if self.handle_record(record, &mut reply)? {
                    return Ok(());
                }
            }
        }

        // Stream ended without a done record; whatever completed was
        // already emitted, so this is not an error.
        debug!("Chat stream for {} closed without done record", chat_id);
        Ok(())
    }

    /// Assistant profile from session creation.
    pub fn assistant_profile(&self) -> Option<AssistantProfile> {
        self.assistant.lock().clone()
    }

    /// Handle one stream record. Returns `Ok(true)` when the stream is done.
    fn handle_record(
        &self,
        record: StreamRecord,
        reply: &mut ReplyAccumulator,
    ) -> EmbedResult<bool> {
        match record.event.as_str() {
            "message:start" => {
                reply.reset(extract_id(record.data.as_ref()));
            }
            "message:chunk" => {
                // Chunks carry the accumulated-so-far content, not deltas;
                // each one replaces the buffer.
                if let Some(snapshot) = extract_content(record.data.as_ref()) {
                    reply.buffer = snapshot;
                }
            }
            "message:complete" => {
                let message = reply.complete(record.data.as_ref());
                if self.shared.admit_complete(&message.id) {
                    self.bus.emit(ClientEvent::Message(message));
                }
            }
            "tool:started" | "tool:completed" | "tool:failed" => {
                self.bus
                    .emit(ClientEvent::Tool(record.data.unwrap_or(Value::Null)));
            }
            "knowledge:used" => {
                self.bus
                    .emit(ClientEvent::KnowledgeUsed(record.data.unwrap_or(Value::Null)));
            }
            "error" => {
                let data = record.data.unwrap_or(Value::Null);
                let code = data
                    .get("code")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Chat stream error")
                    .to_string();
                let err = classify(None, code, message, Some(data));
                self.bus.emit(ClientEvent::Error(err.clone()));
                return Err(err);
            }
            "done" => return Ok(true),
            other => debug!("Ignoring unknown stream record '{}'", other),
        }
        Ok(false)
    }

    /// Common tail for both abort paths: no connected event, chat left
    /// ended, `Ok(None)` back to the caller.
    async fn finish_aborted_start(&self, server_chat_id: Option<String>) -> EmbedResult<Option<String>> {
        if let Some(id) = &server_chat_id {
            if let Err(e) = self.api.end_chat(id).await {
                warn!("Failed to end aborted chat {} server-side: {}", id, e);
            }
        }
        self.shared
            .transition(SessionState::Idle, SessionMode::Chat, &self.bus);
        self.bus.emit(ClientEvent::Disconnected {
            mode: SessionMode::Chat,
            reason: Some("Chat start aborted".to_string()),
        });
        info!("Chat session start aborted");
        Ok(None)
    }
}

/// Buffered state of the in-flight assistant reply. `buffer` holds the
/// latest accumulated-so-far snapshot from the most recent chunk.
#[derive(Debug, Default)]
struct ReplyAccumulator {
    id: Option<String>,
    buffer: String,
}

impl ReplyAccumulator {
    fn reset(&mut self, id: Option<String>) {
        self.id = id;
        self.buffer.clear();
    }

    /// Build the final message, preferring the complete record's own id and
    /// content over what was accumulated.
    fn complete(&mut self, data: Option<&Value>) -> Message {
        let id = extract_id(data)
            .or_else(|| self.id.take())
            .unwrap_or_else(|| format!("assistant-{}", now_millis()));
        let content = extract_content(data).unwrap_or_else(|| std::mem::take(&mut self.buffer));
        self.buffer.clear();
        Message {
            id,
            role: MessageRole::Assistant,
            content,
            timestamp: now_millis(),
            is_complete: true,
            is_streaming: false,
        }
    }
}

fn extract_id(data: Option<&Value>) -> Option<String> {
    data?.get("id").and_then(Value::as_str).map(str::to_string)
}

fn extract_content(data: Option<&Value>) -> Option<String> {
    let data = data?;
    data.get("content")
        .or_else(|| data.get("delta"))
        .or_else(|| data.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
