//! Transport session adapter over the LiveKit room.
//!
//! Owns the room handle, identifies the assistant participant, publishes the
//! local microphone track, and plays remote assistant audio through a
//! host-provided [`AudioSink`]. Room events are translated into normalized
//! bus events; the adapter never exposes LiveKit types upward.

mod audio;
mod connection;
mod events;

use std::collections::HashMap;
use std::sync::Arc;

use livekit::prelude::{LocalTrackPublication, Room};
use livekit::track::LocalAudioTrack;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use tokio::task::JoinHandle;

use crate::events::EventBus;
use crate::session::SharedSession;

/// Sample rate used for both playback and capture.
pub const AUDIO_SAMPLE_RATE: u32 = 48000;

/// Mono audio throughout; the assistant pipeline is speech-only.
pub const AUDIO_CHANNELS: u16 = 1;

/// Multiplier applied to the retry delay between connect attempts.
pub const BACKOFF_FACTOR: f64 = 1.5;

/// A decoded remote audio frame handed to the playback sink.
#[derive(Debug, Clone)]
pub struct AudioFrameInfo {
    /// Transport identity of the track this frame belongs to.
    pub track_sid: String,
    /// PCM samples as little-endian i16 bytes.
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Playback destination for remote assistant audio.
///
/// The default [`NullSink`] discards frames; hosts wire their own sink to
/// route audio to an output device.
pub trait AudioSink: Send + Sync {
    /// Warm-up hint fired before playback begins. Callers treat failures as
    /// non-fatal and swallow them.
    fn activate(&self) -> Result<(), String> {
        Ok(())
    }

    /// Deliver one decoded frame. Called from the playback task; must not
    /// block.
    fn play(&self, frame: AudioFrameInfo);

    /// Playback for a track ended (unsubscribed or assistant left).
    fn stop(&self, track_sid: &str);
}

/// Sink that drops all audio.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _frame: AudioFrameInfo) {}
    fn stop(&self, _track_sid: &str) {}
}

/// The identified assistant participant, latched until disconnect.
#[derive(Debug, Clone)]
pub(crate) struct AssistantRef {
    pub identity: String,
    /// Whether identification came from signed metadata (authoritative) or
    /// the identity-substring heuristic (degraded mode).
    pub via_metadata: bool,
}

/// State shared between the adapter and its room-event task.
#[derive(Default)]
pub(crate) struct TransportShared {
    pub assistant: parking_lot::RwLock<Option<AssistantRef>>,
    /// Playback task per attached remote track, keyed by track sid.
    pub playback: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
}

/// LiveKit-backed transport session for one voice call.
pub struct TransportSession {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) shared: Arc<SharedSession>,
    pub(crate) sink: Arc<dyn AudioSink>,
    pub(crate) inner: Arc<TransportShared>,
    pub(crate) room: tokio::sync::Mutex<Option<Room>>,
    pub(crate) event_task: Option<JoinHandle<()>>,
    pub(crate) audio_source: Option<Arc<NativeAudioSource>>,
    pub(crate) local_track: Option<LocalAudioTrack>,
    pub(crate) publication: tokio::sync::Mutex<Option<LocalTrackPublication>>,
    #[cfg(test)]
    pub(crate) test_local_track: bool,
}

impl TransportSession {
    /// Construct the session with its event wiring targets. No network I/O
    /// happens until [`TransportSession::connect`].
    pub fn create(
        bus: Arc<EventBus>,
        shared: Arc<SharedSession>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        TransportSession {
            bus,
            shared,
            sink,
            inner: Arc::new(TransportShared::default()),
            room: tokio::sync::Mutex::new(None),
            event_task: None,
            audio_source: None,
            local_track: None,
            publication: tokio::sync::Mutex::new(None),
            #[cfg(test)]
            test_local_track: false,
        }
    }

    /// Identity of the latched assistant participant, if one was found.
    pub fn assistant_identity(&self) -> Option<String> {
        self.inner.assistant.read().as_ref().map(|a| a.identity.clone())
    }

    /// Whether a local microphone track has been published.
    pub fn has_local_track(&self) -> bool {
        #[cfg(test)]
        if self.test_local_track {
            return true;
        }
        self.local_track.is_some()
    }

    /// Number of remote tracks currently attached for playback.
    pub fn attached_track_count(&self) -> usize {
        self.inner.playback.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn set_test_local_track(&mut self, present: bool) {
        self.test_local_track = present;
    }
}
