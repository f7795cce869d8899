//! Local media source
//!
//! One [`LocalMedia`] is acquired per session activation and shared
//! read-only by every peer connection. Only the orchestrator acquires and
//! releases it.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

/// Stream id shared by all local tracks
pub const LOCAL_STREAM_ID: &str = "local";

/// Captured camera / microphone tracks
pub struct LocalMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    released: AtomicBool,
}

impl LocalMedia {
    pub fn new(
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            audio,
            video,
            released: AtomicBool::new(false),
        }
    }

    /// Opus microphone track and VP8 camera track
    pub fn with_default_tracks() -> Self {
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        );
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        );
        Self::new(Some(Arc::new(audio)), Some(Arc::new(video)))
    }

    /// All tracks to attach to an outgoing connection
    pub fn tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Mark the capture as stopped; returns false if it already was
    pub fn stop(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Source of local camera / microphone capture
#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;

    /// Stop capture; called once per successful acquisition
    async fn release(&self, media: &LocalMedia);
}

/// Headless source producing encoder-less tracks.
///
/// Frames are written into the tracks by whatever capture pipeline the
/// embedding application runs.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        tracing::info!("Local media acquired (audio + video)");
        Ok(LocalMedia::with_default_tracks())
    }

    async fn release(&self, media: &LocalMedia) {
        if media.stop() {
            tracing::info!("Local media released");
        }
    }
}
