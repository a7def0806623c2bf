//! Local media acquisition.
//!
//! The capture handle is acquired once per joined room and shared read-only
//! by every peer connection; only its owner (the room controller) stops or
//! replaces it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::audio::AudioCapture;
use crate::error::Result;

const LOCAL_STREAM_ID: &str = "jamlink-local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Owned local capture: one audio and one video track attached to every peer
/// connection, with independent enable flags per kind.
pub struct MediaHandle {
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    capture: Mutex<Option<AudioCapture>>,
}

impl MediaHandle {
    fn build(
        audio_track: Arc<TrackLocalStaticSample>,
        capture: Option<AudioCapture>,
        audio_enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            audio_track,
            video_track: Self::video_track_template(),
            audio_enabled,
            video_enabled: Arc::new(AtomicBool::new(true)),
            capture: Mutex::new(capture),
        }
    }

    fn audio_track_template() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ))
    }

    fn video_track_template() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ))
    }

    /// Handle with no capture device behind it. Tracks still negotiate, so a
    /// headless client can join a room and receive media.
    pub fn detached() -> Self {
        Self::build(
            Self::audio_track_template(),
            None,
            Arc::new(AtomicBool::new(true)),
        )
    }

    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![
            Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.video_track) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio_enabled.store(enabled, Ordering::Relaxed),
            TrackKind::Video => self.video_enabled.store(enabled, Ordering::Relaxed),
        }
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled.load(Ordering::Relaxed),
            TrackKind::Video => self.video_enabled.load(Ordering::Relaxed),
        }
    }

    /// Releases the capture device. Safe to call more than once.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.capture.lock() {
            if let Some(mut capture) = guard.take() {
                capture.stop();
            }
        }
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Acquisition contract: produces a capture handle or fails with
/// `MediaAccessDenied`.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<MediaHandle>;
}

/// Default-device acquisition via cpal.
pub struct DeviceMediaSource;

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self) -> Result<MediaHandle> {
        let audio_enabled = Arc::new(AtomicBool::new(true));
        let audio_track = MediaHandle::audio_track_template();
        let capture = AudioCapture::start(Arc::clone(&audio_track), Arc::clone(&audio_enabled))?;
        Ok(MediaHandle::build(audio_track, Some(capture), audio_enabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_idempotent() {
        let handle = MediaHandle::detached();
        handle.stop();
        handle.stop();
    }

    #[test]
    fn enable_flags_are_independent() {
        let handle = MediaHandle::detached();
        assert!(handle.is_enabled(TrackKind::Audio));
        assert!(handle.is_enabled(TrackKind::Video));

        handle.set_enabled(TrackKind::Video, false);
        assert!(!handle.is_enabled(TrackKind::Video));
        assert!(handle.is_enabled(TrackKind::Audio));

        handle.set_enabled(TrackKind::Video, true);
        assert!(handle.is_enabled(TrackKind::Video));
    }

    #[test]
    fn exposes_both_local_tracks() {
        let handle = MediaHandle::detached();
        assert_eq!(handle.tracks().len(), 2);
    }
}
