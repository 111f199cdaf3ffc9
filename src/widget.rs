//! Headless widget view-model.
//!
//! Composes [`EmbedClient`] into UI-facing state: open/closed, per-mode
//! connection status, an ordered transcript, and the mute/speaking flags.
//! Also owns two policies the client deliberately does not: hybrid mode
//! (starting voice stops chat and vice versa) and a single automatic delayed
//! retry for transient chat-start failures.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::EmbedClient;
use crate::errors::{EmbedError, EmbedResult};
use crate::events::{ClientEvent, EventKind, HandlerId};
use crate::messages::Message;
use crate::session::{SessionMode, SessionState};

/// Delay before the single automatic chat-start retry.
pub const CHAT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Connection status of one mode, as the UI sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// UI-visible state. Snapshots are cheap clones.
#[derive(Debug, Clone, Default)]
pub struct WidgetState {
    pub open: bool,
    pub voice_status: ConnectionStatus,
    pub chat_status: ConnectionStatus,
    pub transcript: Vec<Message>,
    pub muted: bool,
    pub assistant_speaking: bool,
    pub last_error: Option<EmbedError>,
}

/// View-model driving a widget over one [`EmbedClient`].
pub struct WidgetController {
    client: EmbedClient,
    state: Arc<Mutex<WidgetState>>,
    subscriptions: Mutex<Vec<HandlerId>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    chat_retry_delay: Duration,
}

impl WidgetController {
    pub fn new(client: EmbedClient) -> Self {
        let controller = WidgetController {
            client,
            state: Arc::new(Mutex::new(WidgetState::default())),
            subscriptions: Mutex::new(Vec::new()),
            retry_task: Mutex::new(None),
            chat_retry_delay: CHAT_RETRY_DELAY,
        };
        controller.wire_events();
        controller
    }

    /// Current UI state.
    pub fn state(&self) -> WidgetState {
        self.state.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn open(&self) {
        self.state.lock().open = true;
    }

    /// Close the widget, ending whatever session is active.
    pub async fn close(&self) {
        self.cancel_pending_retry();
        self.state.lock().open = false;
        self.client.end_all_sessions().await;
    }

    /// Start a voice call, stopping any active chat session first.
    pub async fn start_voice(&self, assistant_id: &str) -> EmbedResult<String> {
        self.cancel_pending_retry();
        if self.client.chat_id().is_some() {
            info!("Hybrid mode: ending chat before starting voice");
            self.client.end_chat_session().await?;
        }
        self.client.start_call(assistant_id, None).await
    }

    /// End the active voice call.
    pub async fn stop_voice(&self) -> EmbedResult<()> {
        self.client.end_call().await
    }

    /// Start a chat session, stopping any active voice call first.
    ///
    /// A transient failure (anything retryable) schedules one automatic
    /// retry after [`CHAT_RETRY_DELAY`]; the retry re-checks live state when
    /// it fires and is skipped if the widget was closed or another session
    /// started in the meantime. The original error is still returned.
    pub async fn start_chat(&self, assistant_id: &str) -> EmbedResult<Option<String>> {
        self.cancel_pending_retry();
        if self.client.call_id().is_some() {
            info!("Hybrid mode: ending call before starting chat");
            self.client.end_call().await?;
        }

        match self.client.start_chat_session(assistant_id, None).await {
            Ok(chat_id) => Ok(chat_id),
            Err(e) => {
                if e.is_retryable() {
                    self.schedule_chat_retry(assistant_id.to_string());
                }
                Err(e)
            }
        }
    }

    /// End the active chat session.
    pub async fn stop_chat(&self) -> EmbedResult<()> {
        self.cancel_pending_retry();
        self.client.end_chat_session().await
    }

    /// Toggle the microphone; returns the new muted state.
    pub async fn toggle_mute(&self) -> EmbedResult<bool> {
        self.client.toggle_mute().await
    }

    /// Send a message over whichever mode is active.
    pub async fn send(&self, content: &str) -> EmbedResult<()> {
        if self.client.chat_id().is_some() {
            self.client.send_chat_message(content).await
        } else {
            self.client.send_message(content).await
        }
    }

    fn wire_events(&self) {
        let mut subscriptions = self.subscriptions.lock();

        let state = Arc::clone(&self.state);
        let client = self.client.clone();
        subscriptions.push(self.client.on(EventKind::StateChange, move |event| {
            if let ClientEvent::StateChange(session_state) = event {
                let status = match session_state {
                    SessionState::Connecting => ConnectionStatus::Connecting,
                    SessionState::Connected => ConnectionStatus::Connected,
                    _ => ConnectionStatus::Disconnected,
                };
                let mut state = state.lock();
                match client.mode() {
                    Some(SessionMode::Voice) => state.voice_status = status,
                    Some(SessionMode::Chat) => state.chat_status = status,
                    None => {}
                }
            }
        }));

        let state = Arc::clone(&self.state);
        subscriptions.push(self.client.on(EventKind::Message, move |event| {
            if let ClientEvent::Message(message) = event {
                upsert_transcript(&mut state.lock().transcript, message.clone());
            }
        }));

        let state = Arc::clone(&self.state);
        subscriptions.push(self.client.on(EventKind::MicrophoneMuted, move |event| {
            if let ClientEvent::MicrophoneMuted(muted) = event {
                state.lock().muted = *muted;
            }
        }));

        let state = Arc::clone(&self.state);
        subscriptions.push(self.client.on(EventKind::AssistantSpeaking, move |event| {
            if let ClientEvent::AssistantSpeaking(speaking) = event {
                state.lock().assistant_speaking = *speaking;
            }
        }));

        let state = Arc::clone(&self.state);
        subscriptions.push(self.client.on(EventKind::Error, move |event| {
            if let ClientEvent::Error(error) = event {
                state.lock().last_error = Some(error.clone());
            }
        }));
    }

    fn schedule_chat_retry(&self, assistant_id: String) {
        let client = self.client.clone();
        let state = Arc::clone(&self.state);
        let delay = self.chat_retry_delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Gate on live state, not on what was true when scheduled.
            let still_wanted = state.lock().open
                && client.state().can_start()
                && client.call_id().is_none()
                && client.chat_id().is_none();
            if !still_wanted {
                debug!("Skipping chat-start retry; widget state changed");
                return;
            }
            info!("Retrying chat session start");
            if let Err(e) = client.start_chat_session(&assistant_id, None).await {
                debug!("Chat-start retry failed: {}", e);
            }
        });
        *self.retry_task.lock() = Some(handle);
    }

    fn cancel_pending_retry(&self) {
        if let Some(handle) = self.retry_task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for WidgetController {
    fn drop(&mut self) {
        self.cancel_pending_retry();
        for handle in self.subscriptions.lock().drain(..) {
            self.client.off(handle);
        }
    }
}

/// Insert or replace by message id, preserving first-seen order. The latest
/// delivered version for an id wins; fragments are replaced, not appended.
fn upsert_transcript(transcript: &mut Vec<Message>, message: Message) {
    match transcript.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => transcript.push(message),
    }
}
