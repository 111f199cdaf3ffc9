//! Shared session state and the voice/chat mutual-exclusion guard.
//!
//! Both controllers operate on one [`SharedSession`]: a single five-state
//! lifecycle, at most one active session id per mode, and the shared dedup
//! ledger. The invariant "never a voice call and a chat session at the same
//! time" lives here, in [`SharedSession::ensure_can_start`], so neither
//! controller can bypass it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupLedger;
use crate::errors::{codes, EmbedError, EmbedResult};
use crate::events::{ClientEvent, EventBus};

/// Session lifecycle states. Failures return to `Idle` so a new attempt can
/// be made without resetting the client; `Disconnected` is re-enterable into
/// `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl SessionState {
    /// Whether a new session may start from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Disconnected)
    }
}

/// Which kind of session is (or was last) active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Voice,
    Chat,
}

/// State shared between the call controller, the chat controller, the
/// transport event task, and the polling loop.
#[derive(Debug, Default)]
pub struct SharedSession {
    state: RwLock<SessionStateCell>,
    call_id: RwLock<Option<String>>,
    chat_id: RwLock<Option<String>>,
    muted: AtomicBool,
    assistant_speaking: AtomicBool,
    ledger: Mutex<DedupLedger>,
}

#[derive(Debug)]
struct SessionStateCell {
    state: SessionState,
    mode: Option<SessionMode>,
}

impl Default for SessionStateCell {
    fn default() -> Self {
        SessionStateCell {
            state: SessionState::Idle,
            mode: None,
        }
    }
}

impl SharedSession {
    pub fn new() -> Self {
        SharedSession::default()
    }

    pub fn state(&self) -> SessionState {
        self.state.read().state
    }

    pub fn mode(&self) -> Option<SessionMode> {
        self.state.read().mode
    }

    /// Move to a new state (tagging the active mode) and emit `stateChange`
    /// if the state actually changed.
    pub fn transition(&self, state: SessionState, mode: SessionMode, bus: &EventBus) {
        let changed = {
            let mut cell = self.state.write();
            let changed = cell.state != state;
            cell.state = state;
            cell.mode = Some(mode);
            changed
        };
        if changed {
            bus.emit(ClientEvent::StateChange(state));
        }
    }

    /// Guard consulted by both controllers before starting a session.
    pub fn ensure_can_start(&self, mode: SessionMode) -> EmbedResult<()> {
        let cell = self.state.read();
        let call_active = self.call_id.read().is_some();
        let chat_active = self.chat_id.read().is_some();

        match mode {
            SessionMode::Voice => {
                if call_active || (cell.mode == Some(SessionMode::Voice) && !cell.state.can_start())
                {
                    return Err(EmbedError::client(
                        codes::CALL_IN_PROGRESS,
                        "A call is already in progress",
                    ));
                }
                if chat_active || (cell.mode == Some(SessionMode::Chat) && !cell.state.can_start())
                {
                    return Err(EmbedError::client(
                        codes::CHAT_IN_PROGRESS,
                        "A chat session is already in progress",
                    ));
                }
            }
            SessionMode::Chat => {
                if chat_active || (cell.mode == Some(SessionMode::Chat) && !cell.state.can_start())
                {
                    return Err(EmbedError::client(
                        codes::CHAT_IN_PROGRESS,
                        "A chat session is already in progress",
                    ));
                }
                if call_active || (cell.mode == Some(SessionMode::Voice) && !cell.state.can_start())
                {
                    return Err(EmbedError::client(
                        codes::CALL_IN_PROGRESS,
                        "A call is in progress; end it before starting a chat",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn call_id(&self) -> Option<String> {
        self.call_id.read().clone()
    }

    pub fn set_call_id(&self, id: Option<String>) {
        *self.call_id.write() = id;
    }

    pub fn chat_id(&self) -> Option<String> {
        self.chat_id.read().clone()
    }

    pub fn set_chat_id(&self, id: Option<String>) {
        *self.chat_id.write() = id;
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_assistant_speaking(&self) -> bool {
        self.assistant_speaking.load(Ordering::Acquire)
    }

    /// Returns true if the flag actually changed.
    pub fn set_assistant_speaking(&self, speaking: bool) -> bool {
        self.assistant_speaking.swap(speaking, Ordering::AcqRel) != speaking
    }

    pub fn clear_ledger(&self) {
        self.ledger.lock().clear();
    }

    pub fn admit_push(&self, id: &str, is_complete: bool) -> bool {
        self.ledger.lock().admit_push(id, is_complete)
    }

    pub fn admit_poll(&self, id: &str) -> bool {
        self.ledger.lock().admit_poll(id)
    }

    pub fn admit_complete(&self, id: &str) -> bool {
        self.ledger.lock().admit_complete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    #[test]
    fn test_initial_state_allows_both_modes() {
        let shared = SharedSession::new();
        assert!(shared.ensure_can_start(SessionMode::Voice).is_ok());
        assert!(shared.ensure_can_start(SessionMode::Chat).is_ok());
    }

    #[test]
    fn test_chat_blocked_while_call_id_set() {
        let shared = SharedSession::new();
        shared.set_call_id(Some("call_1".to_string()));
        let err = shared.ensure_can_start(SessionMode::Chat).unwrap_err();
        assert_eq!(err.code(), codes::CALL_IN_PROGRESS);
    }

    #[test]
    fn test_call_blocked_while_connected() {
        let shared = SharedSession::new();
        let bus = bus();
        shared.transition(SessionState::Connected, SessionMode::Voice, &bus);
        shared.set_call_id(Some("call_1".to_string()));
        let err = shared.ensure_can_start(SessionMode::Voice).unwrap_err();
        assert_eq!(err.code(), codes::CALL_IN_PROGRESS);
    }

    #[test]
    fn test_chat_blocked_while_chat_active() {
        let shared = SharedSession::new();
        shared.set_chat_id(Some("chat_1".to_string()));
        let err = shared.ensure_can_start(SessionMode::Chat).unwrap_err();
        assert_eq!(err.code(), codes::CHAT_IN_PROGRESS);
    }

    #[test]
    fn test_disconnected_is_reenterable() {
        let shared = SharedSession::new();
        let bus = bus();
        shared.transition(SessionState::Connected, SessionMode::Voice, &bus);
        shared.transition(SessionState::Disconnected, SessionMode::Voice, &bus);
        assert!(shared.ensure_can_start(SessionMode::Voice).is_ok());
        assert!(shared.ensure_can_start(SessionMode::Chat).is_ok());
    }

    #[test]
    fn test_transition_emits_state_change_once() {
        let shared = SharedSession::new();
        let bus = bus();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.on(crate::events::EventKind::StateChange, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        shared.transition(SessionState::Connecting, SessionMode::Voice, &bus);
        shared.transition(SessionState::Connecting, SessionMode::Voice, &bus);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
