//! Connection lifecycle for [`TransportSession`].
//!
//! Covers the bounded-retry connect flow with external cancellation, the
//! post-connect reconciliation of participants already in the room, and the
//! ordered teardown path.

use std::time::Duration;

use livekit::prelude::{RemoteTrack, Room, RoomOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{events, TransportSession, BACKOFF_FACTOR};
use crate::errors::{codes, EmbedError, EmbedResult};

impl TransportSession {
    /// Connect to the transport room, retrying transient failures.
    ///
    /// Each retry waits `base_delay x 1.5^(attempt-1)`. Failures whose
    /// message indicates an authorization problem are not transient and fail
    /// immediately. The token is checked before every attempt and during
    /// backoff sleeps; an aborted connect fails with `CONNECTION_ABORTED`
    /// rather than `CONNECTION_FAILED`.
    pub async fn connect(
        &mut self,
        url: &str,
        token: &str,
        max_attempts: u32,
        base_delay: Duration,
        cancel: &CancellationToken,
    ) -> EmbedResult<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(aborted());
            }

            info!("Connecting to transport room (attempt {attempt}/{max_attempts})");
            match Room::connect(url, token, RoomOptions::default()).await {
                Ok((room, room_events)) => {
                    *self.room.lock().await = Some(room);
                    self.spawn_event_loop(room_events);
                    info!("Transport room connected");
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    if is_auth_failure(&message) {
                        warn!("Transport rejected credentials, not retrying: {message}");
                        return Err(EmbedError::Authentication(message));
                    }
                    if attempt >= max_attempts {
                        return Err(EmbedError::connection(
                            codes::CONNECTION_FAILED,
                            format!(
                                "Transport connect failed after {max_attempts} attempts: {message}"
                            ),
                        ));
                    }

                    let delay = backoff_delay(base_delay, attempt);
                    warn!(
                        "Transport connect attempt {attempt} failed ({message}), retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(aborted()),
                    }
                }
            }
        }
    }

    /// Walk participants already present at join time, in case the assistant
    /// entered the room before our event wiring attached.
    pub async fn reconcile_existing_participants(&self) {
        let room_guard = self.room.lock().await;
        let Some(room) = room_guard.as_ref() else {
            return;
        };

        for (identity, participant) in room.remote_participants() {
            let identity = identity.to_string();
            events::maybe_latch_assistant(
                &self.inner,
                &identity,
                &participant.metadata(),
            );
            if !events::is_assistant(&self.inner, &identity) {
                continue;
            }

            for (sid, publication) in participant.track_publications() {
                if let Some(RemoteTrack::Audio(track)) = publication.track() {
                    debug!("Reconciling already-subscribed assistant track {}", sid);
                    events::attach_track(
                        &self.inner,
                        &self.sink,
                        sid.to_string(),
                        track,
                    );
                }
            }
        }
    }

    /// Tear the session down: stop event handling, detach playback, close
    /// the room, and drop local media state. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(handle) = self.event_task.take() {
            handle.abort();
        }

        events::detach_all(&self.inner, &self.sink);
        *self.inner.assistant.write() = None;

        if let Some(room) = self.room.lock().await.take() {
            if let Err(e) = room.close().await {
                debug!("Room close reported an error (ignored): {e:?}");
            }
        }

        self.audio_source = None;
        self.local_track = None;
        *self.publication.lock().await = None;

        info!("Transport session closed");
    }
}

fn aborted() -> EmbedError {
    EmbedError::connection(codes::CONNECTION_ABORTED, "Connect attempt was aborted")
}

fn is_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("invalid token")
        || lower.contains("401")
        || lower.contains("403")
}

/// Exponential backoff: `base x 1.5^(attempt-1)`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
