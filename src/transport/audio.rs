//! Local microphone publishing and audio frame conversion.
//!
//! The microphone is modeled as a published `NativeAudioSource` the host
//! feeds PCM into; acquisition or publish failures surface as MediaDevices
//! errors, never generic ones.

use std::sync::Arc;

use livekit::options::TrackPublishOptions;
use livekit::track::{LocalAudioTrack, LocalTrack, TrackSource};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::{AudioFrame, AudioSourceOptions, RtcAudioSource};
use tracing::info;

use super::{TransportSession, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::errors::{codes, EmbedError, EmbedResult};

impl TransportSession {
    /// Create and publish the local microphone track.
    ///
    /// Audio-quality defaults are fixed for speech: echo cancellation, noise
    /// suppression, and auto gain are always on.
    pub async fn publish_local_audio(&mut self) -> EmbedResult<()> {
        info!(
            "Publishing local audio: {}Hz, {} channel(s)",
            AUDIO_SAMPLE_RATE, AUDIO_CHANNELS
        );

        let source_options = AudioSourceOptions {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        };
        let samples_per_frame = AUDIO_SAMPLE_RATE / 100;
        let audio_source = Arc::new(NativeAudioSource::new(
            source_options,
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS as u32,
            samples_per_frame,
        ));

        let rtc_source = RtcAudioSource::Native((*audio_source).clone());
        let local_track = LocalAudioTrack::create_audio_track("microphone", rtc_source);

        let local_participant = {
            let room_guard = self.room.lock().await;
            match room_guard.as_ref() {
                Some(room) => room.local_participant().clone(),
                None => {
                    return Err(EmbedError::MediaDevices(
                        "Room not available for microphone publishing".to_string(),
                    ))
                }
            }
        };

        let publish_options = TrackPublishOptions {
            source: TrackSource::Microphone,
            ..Default::default()
        };

        let publication = local_participant
            .publish_track(LocalTrack::Audio(local_track.clone()), publish_options)
            .await
            .map_err(|e| {
                EmbedError::MediaDevices(format!("Failed to publish microphone track: {e:?}"))
            })?;

        info!("Published microphone track: {}", publication.sid());
        self.audio_source = Some(audio_source);
        self.local_track = Some(local_track);
        *self.publication.lock().await = Some(publication);
        Ok(())
    }

    /// Feed captured PCM (little-endian i16 bytes) into the published track.
    pub async fn capture_audio(&self, pcm: &[u8]) -> EmbedResult<()> {
        let source = self.audio_source.as_ref().ok_or_else(|| {
            EmbedError::MediaDevices("No local audio source; publish first".to_string())
        })?;

        let frame = bytes_to_frame(pcm, AUDIO_SAMPLE_RATE, AUDIO_CHANNELS)?;
        source
            .capture_frame(&frame)
            .await
            .map_err(|e| EmbedError::MediaDevices(format!("Failed to capture frame: {e:?}")))
    }

    /// Apply the mute state to the published microphone track.
    pub async fn set_microphone_muted(&self, muted: bool) -> EmbedResult<()> {
        let publication = self.publication.lock().await;
        match publication.as_ref() {
            Some(publication) => {
                if muted {
                    publication.mute();
                } else {
                    publication.unmute();
                }
                Ok(())
            }
            None => {
                #[cfg(test)]
                if self.test_local_track {
                    return Ok(());
                }
                Err(EmbedError::client(
                    codes::NO_AUDIO_TRACK,
                    "No local audio track to mute",
                ))
            }
        }
    }
}

/// Convert little-endian i16 PCM bytes into an [`AudioFrame`].
pub(crate) fn bytes_to_frame(
    pcm: &[u8],
    sample_rate: u32,
    channels: u16,
) -> EmbedResult<AudioFrame<'static>> {
    if pcm.len() % 2 != 0 {
        return Err(EmbedError::MediaDevices(
            "PCM byte length must be even (16-bit samples)".to_string(),
        ));
    }

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let samples_per_channel = (samples.len() / channels as usize) as u32;

    Ok(AudioFrame {
        data: samples.into(),
        sample_rate,
        num_channels: channels as u32,
        samples_per_channel,
    })
}

/// Convert an [`AudioFrame`] back into little-endian i16 PCM bytes.
pub(crate) fn frame_to_bytes(frame: &AudioFrame<'_>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.data.len() * 2);
    for sample in frame.data.iter() {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_frame_round_trip() {
        let pcm: Vec<u8> = vec![0x01, 0x00, 0xFF, 0x7F, 0x00, 0x80, 0x00, 0x00];
        let frame = bytes_to_frame(&pcm, AUDIO_SAMPLE_RATE, 1).unwrap();
        assert_eq!(frame.sample_rate, AUDIO_SAMPLE_RATE);
        assert_eq!(frame.num_channels, 1);
        assert_eq!(frame.samples_per_channel, 4);
        assert_eq!(frame.data[1], i16::MAX);
        assert_eq!(frame.data[2], i16::MIN);

        assert_eq!(frame_to_bytes(&frame), pcm);
    }

    #[test]
    fn test_odd_byte_length_rejected() {
        let err = bytes_to_frame(&[0u8; 3], AUDIO_SAMPLE_RATE, 1).unwrap_err();
        assert!(matches!(err, EmbedError::MediaDevices(_)));
    }
}
