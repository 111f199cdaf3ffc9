//! Voice call session controller.
//!
//! Drives the call lifecycle end to end: token acquisition, transport
//! bootstrap with bounded retry, local audio publish, post-connect
//! participant reconciliation, the message-polling fallback loop, and the
//! REST-backed end/mute/send operations. Every exit path, successful or
//! not, leaves the controller in a state from which a new call can start.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, AssistantProfile, RateLimitInfo};
use crate::config::EmbedConfig;
use crate::errors::{codes, EmbedError, EmbedResult};
use crate::events::{ClientEvent, EventBus};
use crate::messages::Message;
use crate::session::{SessionMode, SessionState, SharedSession};
use crate::transport::{AudioSink, TransportSession};

/// Fixed interval of the message-polling fallback.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Messages fetched per poll tick.
const POLL_PAGE_SIZE: u32 = 10;

/// Controller for voice call sessions.
pub struct CallController {
    config: EmbedConfig,
    api: Arc<ApiClient>,
    bus: Arc<EventBus>,
    shared: Arc<SharedSession>,
    sink: Arc<dyn AudioSink>,
    transport: tokio::sync::Mutex<Option<TransportSession>>,
    connect_cancel: Mutex<Option<CancellationToken>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    rate_limit: Mutex<Option<RateLimitInfo>>,
    assistant: Mutex<Option<AssistantProfile>>,
}

impl CallController {
    pub fn new(
        config: EmbedConfig,
        api: Arc<ApiClient>,
        bus: Arc<EventBus>,
        shared: Arc<SharedSession>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        CallController {
            config,
            api,
            bus,
            shared,
            sink,
            transport: tokio::sync::Mutex::new(None),
            connect_cancel: Mutex::new(None),
            poll_task: Mutex::new(None),
            rate_limit: Mutex::new(None),
            assistant: Mutex::new(None),
        }
    }

    /// Start a voice call with the given assistant.
    ///
    /// Legal only from Idle or Disconnected; otherwise fails with
    /// `CALL_IN_PROGRESS`. On any bootstrap failure the error is classified,
    /// emitted on the `error` event, and returned; state goes back to Idle
    /// and the session id is cleared so the call can be retried.
    pub async fn start_call(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
    ) -> EmbedResult<String> {
        self.shared.ensure_can_start(SessionMode::Voice)?;
        self.shared.clear_ledger();
        self.shared
            .transition(SessionState::Connecting, SessionMode::Voice, &self.bus);

        let cancel = CancellationToken::new();
        *self.connect_cancel.lock() = Some(cancel.clone());
        let result = self.bootstrap(assistant_id, metadata, &cancel).await;
        *self.connect_cancel.lock() = None;

        match result {
            Ok(call_id) => {
                self.shared
                    .transition(SessionState::Connected, SessionMode::Voice, &self.bus);
                self.bus.emit(ClientEvent::Connected {
                    mode: SessionMode::Voice,
                });
                info!("Call {} connected", call_id);
                Ok(call_id)
            }
            Err(e) => {
                self.cleanup_after_failure().await;
                self.shared
                    .transition(SessionState::Idle, SessionMode::Voice, &self.bus);
                self.bus.emit(ClientEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// The ordered bootstrap sequence. Any failing step propagates; the
    /// caller handles cleanup.
    async fn bootstrap(
        &self,
        assistant_id: &str,
        metadata: Option<Value>,
        cancel: &CancellationToken,
    ) -> EmbedResult<String> {
        // (1) transport token from the control API
        let token = self.api.fetch_token(assistant_id, metadata).await?;

        // (2) the token response carries the server-issued session id
        self.shared.set_call_id(Some(token.call_id.clone()));
        *self.rate_limit.lock() = token.rate_limit.clone();
        *self.assistant.lock() = token.assistant.clone();

        if cancel.is_cancelled() {
            return Err(EmbedError::connection(
                codes::CONNECTION_ABORTED,
                "Call was ended during bootstrap",
            ));
        }

        // (3) transport session, no I/O yet
        let mut transport = TransportSession::create(
            Arc::clone(&self.bus),
            Arc::clone(&self.shared),
            Arc::clone(&self.sink),
        );

        // (4) playback warm-up is a hint, not a requirement
        if let Err(e) = self.sink.activate() {
            debug!("Audio sink warm-up failed (ignored): {e}");
        }

        // (5) connect with bounded retry
        if let Err(e) = transport
            .connect(
                &token.url,
                &token.token,
                self.config.max_retry_attempts,
                self.config.retry_delay,
                cancel,
            )
            .await
        {
            transport.close().await;
            return Err(e);
        }

        // (6) publish the local microphone track
        if let Err(e) = transport.publish_local_audio().await {
            transport.close().await;
            return Err(e);
        }

        // (7) the assistant may have joined before our listeners attached
        transport.reconcile_existing_participants().await;

        *self.transport.lock().await = Some(transport);

        // (8) polling fallback for messages the push channel missed
        self.start_polling(token.call_id.clone());

        Ok(token.call_id)
    }

    /// End the current call. A no-op when already idle with no session.
    pub async fn end_call(&self) -> EmbedResult<()> {
        let call_id = self.shared.call_id();
        if call_id.is_none() {
            // Without a session id there is only something to clean up when
            // a voice bootstrap is mid-flight. Never touch chat state.
            let voice_busy = self.shared.mode() == Some(SessionMode::Voice)
                && !self.shared.state().can_start();
            if !voice_busy {
                return Ok(());
            }
        }

        self.shared
            .transition(SessionState::Disconnecting, SessionMode::Voice, &self.bus);

        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }

        // Server-side termination is best-effort; local cleanup always runs.
        if let Some(id) = &call_id {
            if let Err(e) = self.api.end_call(id).await {
                warn!("Failed to end call {} server-side: {}", id, e);
            }
        }

        if let Some(cancel) = self.connect_cancel.lock().take() {
            cancel.cancel();
        }

        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.close().await;
        }

        self.shared.set_call_id(None);
        self.shared.clear_ledger();
        self.shared.set_muted(false);
        self.shared.set_assistant_speaking(false);
        *self.rate_limit.lock() = None;
        *self.assistant.lock() = None;

        self.shared
            .transition(SessionState::Disconnected, SessionMode::Voice, &self.bus);
        self.bus.emit(ClientEvent::Disconnected {
            mode: SessionMode::Voice,
            reason: None,
        });
        info!("Call ended");
        Ok(())
    }

    /// Toggle the microphone mute state.
    ///
    /// Persists the new state server-side first; only on API success is the
    /// local track muted and the new state emitted. Returns the new muted
    /// state (`true` = muted).
    pub async fn toggle_mute(&self) -> EmbedResult<bool> {
        let call_id = self
            .shared
            .call_id()
            .ok_or_else(|| EmbedError::client(codes::NO_ACTIVE_CALL, "No active call"))?;

        let transport = self.transport.lock().await;
        let transport = transport
            .as_ref()
            .ok_or_else(|| EmbedError::client(codes::NO_ACTIVE_CALL, "No active call"))?;
        if !transport.has_local_track() {
            return Err(EmbedError::client(
                codes::NO_AUDIO_TRACK,
                "No local audio track to mute",
            ));
        }

        let next = !self.shared.is_muted();
        self.api.set_muted(&call_id, next).await?;
        transport.set_microphone_muted(next).await?;
        self.shared.set_muted(next);
        self.bus.emit(ClientEvent::MicrophoneMuted(next));
        Ok(next)
    }

    /// Send a text message into the active call.
    pub async fn send_message(&self, message: &str) -> EmbedResult<()> {
        let call_id = self.require_connected()?;
        self.api.send_call_message(&call_id, message).await
    }

    /// Fetch recent call messages directly (same endpoint the poller uses).
    pub async fn get_messages(&self, limit: u32, offset: u32) -> EmbedResult<Vec<Message>> {
        let call_id = self.require_connected()?;
        self.api.get_call_messages(&call_id, limit, offset).await
    }

    /// Feed captured microphone PCM into the published track.
    pub async fn capture_audio(&self, pcm: &[u8]) -> EmbedResult<()> {
        let transport = self.transport.lock().await;
        let transport = transport
            .as_ref()
            .ok_or_else(|| EmbedError::client(codes::NO_ACTIVE_CALL, "No active call"))?;
        transport.capture_audio(pcm).await
    }

    /// Rate-limit metadata from the most recent token response.
    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_limit.lock().clone()
    }

    /// Assistant profile from the most recent token response.
    pub fn assistant_profile(&self) -> Option<AssistantProfile> {
        self.assistant.lock().clone()
    }

    fn require_connected(&self) -> EmbedResult<String> {
        let call_id = self
            .shared
            .call_id()
            .ok_or_else(|| EmbedError::client(codes::NO_ACTIVE_CALL, "No active call"))?;
        if self.shared.state() != SessionState::Connected {
            return Err(EmbedError::client(
                codes::NOT_CONNECTED,
                "Call is not connected",
            ));
        }
        Ok(call_id)
    }

    /// Spawn the 2-second polling fallback. The loop exits on its own when
    /// the session id changes or clears; poll failures are logged, never
    /// surfaced.
    fn start_polling(&self, call_id: String) {
        let api = Arc::clone(&self.api);
        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so polling
            // starts one interval after connect.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if shared.call_id().as_deref() != Some(call_id.as_str()) {
                    break;
                }
                match api.get_call_messages(&call_id, POLL_PAGE_SIZE, 0).await {
                    Ok(messages) => {
                        for message in messages {
                            if message.id.is_empty() {
                                continue;
                            }
                            if shared.admit_poll(&message.id) {
                                bus.emit(ClientEvent::Message(message));
                            }
                        }
                    }
                    Err(e) => debug!("Message poll failed (will retry): {}", e),
                }
            }
            debug!("Polling loop for call {} finished", call_id);
        });

        *self.poll_task.lock() = Some(handle);
    }

    /// Undo partial bootstrap state after a failed start.
    async fn cleanup_after_failure(&self) {
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
        self.shared.set_call_id(None);
        self.shared.clear_ledger();
        *self.rate_limit.lock() = None;
        *self.assistant.lock() = None;
    }

    #[cfg(test)]
    pub(crate) async fn inject_test_transport(&self, transport: TransportSession) {
        *self.transport.lock().await = Some(transport);
    }

    #[cfg(test)]
    pub(crate) fn has_poll_task(&self) -> bool {
        self.poll_task.lock().is_some()
    }
}
