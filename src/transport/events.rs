//! Room event wiring for [`TransportSession`].
//!
//! A background task drains the room event receiver and translates
//! transport-native events into normalized bus events. Only the identified
//! assistant participant's audio tracks are attached for playback; all
//! data-channel payloads flow through the message decoder and the shared
//! dedup ledger before reaching subscribers.

use std::sync::Arc;

use futures::StreamExt;
use livekit::prelude::{RemoteTrack, RoomEvent};
use livekit::track::RemoteAudioTrack;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::audio::frame_to_bytes;
use super::{
    AssistantRef, AudioFrameInfo, AudioSink, TransportSession, TransportShared, AUDIO_CHANNELS,
    AUDIO_SAMPLE_RATE,
};
use crate::events::{ClientEvent, EventBus};
use crate::messages::{decode_data_payload, DataPayload};
use crate::session::{SessionMode, SessionState, SharedSession};

/// Everything the event task needs, cloned out of the session.
struct EventContext {
    bus: Arc<EventBus>,
    shared: Arc<SharedSession>,
    sink: Arc<dyn AudioSink>,
    inner: Arc<TransportShared>,
}

impl TransportSession {
    pub(super) fn spawn_event_loop(&mut self, mut room_events: mpsc::UnboundedReceiver<RoomEvent>) {
        let ctx = EventContext {
            bus: Arc::clone(&self.bus),
            shared: Arc::clone(&self.shared),
            sink: Arc::clone(&self.sink),
            inner: Arc::clone(&self.inner),
        };

        self.event_task = Some(tokio::spawn(async move {
            while let Some(event) = room_events.recv().await {
                handle_room_event(event, &ctx);
            }
            debug!("Room event loop finished");
        }));
    }
}

fn handle_room_event(event: RoomEvent, ctx: &EventContext) {
    match event {
        RoomEvent::ParticipantConnected(participant) => {
            let identity = participant.identity().to_string();
            info!("Participant connected: {}", identity);
            maybe_latch_assistant(&ctx.inner, &identity, &participant.metadata());
        }
        RoomEvent::ParticipantDisconnected(participant) => {
            let identity = participant.identity().to_string();
            info!("Participant disconnected: {}", identity);
            if is_assistant(&ctx.inner, &identity) {
                detach_all(&ctx.inner, &ctx.sink);
                *ctx.inner.assistant.write() = None;
                if ctx.shared.set_assistant_speaking(false) {
                    ctx.bus.emit(ClientEvent::AssistantSpeaking(false));
                }
            }
        }
        RoomEvent::TrackSubscribed {
            track,
            publication,
            participant,
        } => {
            let identity = participant.identity().to_string();
            // The assistant may publish before its participant-connected
            // event was observed; try latching here as well.
            maybe_latch_assistant(&ctx.inner, &identity, &participant.metadata());
            if !is_assistant(&ctx.inner, &identity) {
                debug!("Ignoring track from non-assistant participant {}", identity);
                return;
            }
            if let RemoteTrack::Audio(audio_track) = track {
                attach_track(&ctx.inner, &ctx.sink, publication.sid().to_string(), audio_track);
            }
        }
        RoomEvent::TrackUnsubscribed { publication, .. } => {
            detach_track(&ctx.inner, &ctx.sink, &publication.sid().to_string());
        }
        RoomEvent::ActiveSpeakersChanged { speakers } => {
            let assistant = ctx.inner.assistant.read().clone();
            if let Some(assistant) = assistant {
                let speaking = speakers
                    .iter()
                    .any(|p| p.identity().to_string() == assistant.identity);
                if ctx.shared.set_assistant_speaking(speaking) {
                    ctx.bus.emit(ClientEvent::AssistantSpeaking(speaking));
                }
            }
        }
        RoomEvent::DataReceived {
            payload,
            participant,
            ..
        } => {
            let from = participant
                .as_ref()
                .map(|p| p.identity().to_string())
                .unwrap_or_else(|| "server".to_string());
            debug!("Data received from {}: {} bytes", from, payload.len());
            dispatch_data_payload(&payload, ctx);
        }
        RoomEvent::Reconnecting => {
            warn!("Transport reconnecting");
            ctx.bus.emit(ClientEvent::Reconnecting);
        }
        RoomEvent::Reconnected => {
            info!("Transport reconnected");
            ctx.bus.emit(ClientEvent::Reconnected);
        }
        RoomEvent::ConnectionStateChanged(state) => {
            ctx.bus
                .emit(ClientEvent::ConnectionStateChanged(format!("{state:?}")));
        }
        RoomEvent::ConnectionQualityChanged {
            quality,
            participant,
        } => {
            ctx.bus.emit(ClientEvent::ConnectionQualityChanged {
                participant: participant.identity().to_string(),
                quality: format!("{quality:?}"),
            });
        }
        RoomEvent::Disconnected { reason } => {
            warn!("Transport disconnected: {:?}", reason);
            detach_all(&ctx.inner, &ctx.sink);
            ctx.shared.set_call_id(None);
            ctx.shared
                .transition(SessionState::Disconnected, SessionMode::Voice, &ctx.bus);
            ctx.bus.emit(ClientEvent::Disconnected {
                mode: SessionMode::Voice,
                reason: Some(format!("{reason:?}")),
            });
        }
        other => {
            debug!("Unhandled room event: {:?}", other);
        }
    }
}

/// Route a decoded data-channel payload to the bus, applying the push-path
/// dedup policy to conversation messages. Transcriptions bypass the ledger.
fn dispatch_data_payload(payload: &[u8], ctx: &EventContext) {
    match decode_data_payload(payload) {
        Some(DataPayload::Conversation(message)) => {
            if ctx.shared.admit_push(&message.id, message.is_complete) {
                ctx.bus.emit(ClientEvent::Message(message));
            } else {
                debug!("Suppressed duplicate partial message {}", message.id);
            }
        }
        Some(DataPayload::Transcription(event)) => {
            ctx.bus.emit(ClientEvent::Transcription(event));
        }
        Some(DataPayload::Tool(value)) => ctx.bus.emit(ClientEvent::Tool(value)),
        Some(DataPayload::Metrics(value)) => ctx.bus.emit(ClientEvent::Metrics(value)),
        Some(DataPayload::BargeIn(value)) => ctx.bus.emit(ClientEvent::BargeIn(value)),
        Some(DataPayload::CallEnding(value)) => ctx.bus.emit(ClientEvent::CallEnding(value)),
        None => {}
    }
}

/// Latch the first participant identified as the assistant. Signed metadata
/// (`role == "assistant"`) is authoritative; the identity-substring check is
/// a degraded-mode heuristic and logged as such.
pub(crate) fn maybe_latch_assistant(
    inner: &TransportShared,
    identity: &str,
    metadata: &str,
) -> bool {
    if inner.assistant.read().is_some() {
        return false;
    }

    let role = serde_json::from_str::<serde_json::Value>(metadata)
        .ok()
        .and_then(|v| v.get("role").and_then(|r| r.as_str().map(str::to_string)));

    let via_metadata = match role.as_deref() {
        Some("assistant") => true,
        // Parsed metadata with another role is trusted too: not the
        // assistant, no heuristic.
        Some(_) => return false,
        None => false,
    };

    let lower = identity.to_lowercase();
    let via_identity = lower.contains("agent") || lower.contains("assistant");

    if !via_metadata && !via_identity {
        return false;
    }

    if via_metadata {
        info!("Identified assistant participant '{}' via metadata", identity);
    } else {
        warn!(
            "Identified assistant participant '{}' via identity substring heuristic; \
             metadata role was absent or unparsable",
            identity
        );
    }

    *inner.assistant.write() = Some(AssistantRef {
        identity: identity.to_string(),
        via_metadata,
    });
    true
}

pub(crate) fn is_assistant(inner: &TransportShared, identity: &str) -> bool {
    inner
        .assistant
        .read()
        .as_ref()
        .is_some_and(|a| a.identity == identity)
}

/// Start a playback task for an assistant audio track. Idempotent per track
/// sid: re-subscription of an already-attached track is a no-op.
pub(crate) fn attach_track(
    inner: &TransportShared,
    sink: &Arc<dyn AudioSink>,
    sid: String,
    audio_track: RemoteAudioTrack,
) {
    let mut playback = inner.playback.lock();
    if playback.contains_key(&sid) {
        debug!("Track {} already attached", sid);
        return;
    }

    info!("Attaching assistant audio track {}", sid);
    let rtc_track = audio_track.rtc_track();
    let mut stream = NativeAudioStream::new(
        rtc_track,
        AUDIO_SAMPLE_RATE as i32,
        AUDIO_CHANNELS as i32,
        None,
    );

    let sink = Arc::clone(sink);
    let task_sid = sid.clone();
    let handle = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            sink.play(AudioFrameInfo {
                track_sid: task_sid.clone(),
                data: frame_to_bytes(&frame),
                sample_rate: frame.sample_rate,
                channels: frame.num_channels as u16,
            });
        }
        debug!("Audio stream ended for track {}", task_sid);
        sink.stop(&task_sid);
    });

    playback.insert(sid, handle);
}

/// Stop and remove the playback task for one track.
pub(crate) fn detach_track(inner: &TransportShared, sink: &Arc<dyn AudioSink>, sid: &str) {
    if let Some(handle) = inner.playback.lock().remove(sid) {
        info!("Detaching audio track {}", sid);
        handle.abort();
        sink.stop(sid);
    }
}

/// Stop every playback task.
pub(crate) fn detach_all(inner: &TransportShared, sink: &Arc<dyn AudioSink>) {
    let drained: Vec<(String, tokio::task::JoinHandle<()>)> =
        inner.playback.lock().drain().collect();
    for (sid, handle) in drained {
        handle.abort();
        sink.stop(&sid);
    }
}
