//! Public client surface.
//!
//! [`EmbedClient`] is the single entry point: it owns the shared session
//! state, the event bus, and both session controllers, and exposes the
//! operations host applications call. The client is cheap to clone; clones
//! share all state.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::api::{ApiClient, AssistantProfile, RateLimitInfo};
use crate::call::CallController;
use crate::chat::ChatController;
use crate::config::EmbedConfig;
use crate::errors::EmbedResult;
use crate::events::{ClientEvent, EventBus, EventKind, HandlerId};
use crate::messages::Message;
use crate::session::{SessionMode, SessionState, SharedSession};
use crate::transport::{AudioSink, NullSink};

/// Client for embedding assistant voice and chat sessions.
#[derive(Clone)]
pub struct EmbedClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    bus: Arc<EventBus>,
    shared: Arc<SharedSession>,
    call: CallController,
    chat: ChatController,
}

impl std::fmt::Debug for EmbedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedClient").finish_non_exhaustive()
    }
}

impl EmbedClient {
    /// Build a client with no audio playback (voice calls still work; the
    /// assistant's audio is discarded).
    pub fn new(config: EmbedConfig) -> EmbedResult<Self> {
        EmbedClient::with_sink(config, Arc::new(NullSink))
    }

    /// Build a client that plays assistant audio through the given sink.
    pub fn with_sink(config: EmbedConfig, sink: Arc<dyn AudioSink>) -> EmbedResult<Self> {
        config.validate()?;
        let api = Arc::new(ApiClient::new(&config)?);
        let bus = Arc::new(EventBus::new());
        let shared = Arc::new(SharedSession::new());

        let call = CallController::new(
            config.clone(),
            Arc::clone(&api),
            Arc::clone(&bus),
            Arc::clone(&shared),
            sink,
        );
        let chat = ChatController::new(api, Arc::clone(&bus), Arc::clone(&shared));

        Ok(EmbedClient {
            inner: Arc::new(ClientInner {
                bus,
                shared,
                call,
                chat,
            }),
        })
    }

    // --- voice ---

    /// Start a voice call. Returns the server-issued call id.
    pub async fn start_call(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
    ) -> EmbedResult<String> {
        self.inner.call.start_call(assistant_id, metadata).await
    }

    /// End the active voice call. A no-op when none is active.
    pub async fn end_call(&self) -> EmbedResult<()> {
        self.inner.call.end_call().await
    }

    /// Toggle the microphone; returns the new muted state.
    pub async fn toggle_mute(&self) -> EmbedResult<bool> {
        self.inner.call.toggle_mute().await
    }

    /// Send a text message into the active voice call.
    pub async fn send_message(&self, message: &str) -> EmbedResult<()> {
        self.inner.call.send_message(message).await
    }

    /// Fetch recent call messages.
    pub async fn get_messages(&self, limit: u32, offset: u32) -> EmbedResult<Vec<Message>> {
        self.inner.call.get_messages(limit, offset).await
    }

    /// Feed captured microphone PCM (16-bit little-endian, 48 kHz mono)
    /// into the published track.
    pub async fn capture_audio(&self, pcm: &[u8]) -> EmbedResult<()> {
        self.inner.call.capture_audio(pcm).await
    }

    // --- chat ---

    /// Start a chat session. `Ok(None)` means the start was aborted by a
    /// concurrent [`end_chat_session`](Self::end_chat_session).
    pub async fn start_chat_session(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
    ) -> EmbedResult<Option<String>> {
        self.inner.chat.start_chat_session(assistant_id, metadata).await
    }

    /// Send a chat message and consume the streamed reply.
    pub async fn send_chat_message(&self, content: &str) -> EmbedResult<()> {
        self.inner.chat.send_chat_message(content).await
    }

    /// End the active chat session (or abort one still starting).
    pub async fn end_chat_session(&self) -> EmbedResult<()> {
        self.inner.chat.end_chat_session().await
    }

    // --- state ---

    pub fn state(&self) -> SessionState {
        self.inner.shared.state()
    }

    pub fn mode(&self) -> Option<SessionMode> {
        self.inner.shared.mode()
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.shared.call_id()
    }

    pub fn chat_id(&self) -> Option<String> {
        self.inner.shared.chat_id()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.shared.is_muted()
    }

    pub fn is_assistant_speaking(&self) -> bool {
        self.inner.shared.is_assistant_speaking()
    }

    /// Rate-limit metadata from the most recent call token response.
    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.inner.call.rate_limit()
    }

    /// Profile of the assistant backing the active session.
    pub fn assistant_profile(&self) -> Option<AssistantProfile> {
        self.inner
            .call
            .assistant_profile()
            .or_else(|| self.inner.chat.assistant_profile())
    }

    // --- events ---

    /// Subscribe to an event kind. The returned handle unsubscribes via
    /// [`off`](Self::off).
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    /// Subscribe for a single delivery.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.bus.once(kind, handler)
    }

    /// Remove one subscription.
    pub fn off(&self, handle: HandlerId) {
        self.inner.bus.off(handle)
    }

    /// Remove every subscription for a kind, or all subscriptions.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        self.inner.bus.remove_all(kind)
    }

    /// Tear the client down: end whatever session is active (best-effort)
    /// and drop every event subscription.
    pub async fn destroy(&self) {
        self.end_all_sessions().await;
        self.inner.bus.remove_all(None);
    }

    /// Best-effort end of both session types, keeping subscriptions alive.
    pub(crate) async fn end_all_sessions(&self) {
        if let Err(e) = self.inner.call.end_call().await {
            warn!("cleanup: ending call failed: {}", e);
        }
        if let Err(e) = self.inner.chat.end_chat_session().await {
            warn!("cleanup: ending chat failed: {}", e);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_call_state_for_test(&self, call_id: &str) {
        self.inner.shared.set_call_id(Some(call_id.to_string()));
        self.inner.shared.transition(
            SessionState::Connected,
            SessionMode::Voice,
            &self.inner.bus,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;

    fn client() -> EmbedClient {
        let mut config = EmbedConfig::new("pk_test_key");
        config.api_url = "http://127.0.0.1:9".to_string();
        EmbedClient::new(config).unwrap()
    }

    #[test]
    fn test_rejects_invalid_key() {
        let err = EmbedClient::new(EmbedConfig::new("sk_secret")).unwrap_err();
        assert_eq!(err.code(), codes::CONFIGURATION_ERROR);
    }

    #[test]
    fn test_clones_share_state() {
        let a = client();
        let b = a.clone();
        a.inner.shared.set_call_id(Some("call_1".to_string()));
        assert_eq!(b.call_id().as_deref(), Some("call_1"));
    }

    #[test]
    fn test_initial_state() {
        let c = client();
        assert_eq!(c.state(), SessionState::Idle);
        assert_eq!(c.mode(), None);
        assert_eq!(c.call_id(), None);
        assert_eq!(c.chat_id(), None);
        assert!(!c.is_muted());
        assert!(!c.is_assistant_speaking());
    }

    #[tokio::test]
    async fn test_destroy_clears_listeners() {
        let c = client();
        c.on(EventKind::Message, |_| {});
        c.on(EventKind::Error, |_| {});
        c.destroy().await;
        assert_eq!(c.inner.bus.handler_count(EventKind::Message), 0);
        assert_eq!(c.inner.bus.handler_count(EventKind::Error), 0);
    }
}
