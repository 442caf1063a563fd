//! Local capture handle handed to the peer connection as an opaque track source.

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Result;

/// RTP clock rate for Opus is always 48000
pub const OPUS_CLOCK_RATE: u32 = 48000;

/// RTP clock rate for VP8 is 90000 Hz
pub const VP8_CLOCK_RATE: u32 = 90000;

/// Combined audio+video capture, owned by the session and released with it.
#[derive(Clone)]
pub struct LocalMedia {
    stream_id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
}

impl LocalMedia {
    /// Default-codec tracks (Opus + VP8) for one stream, fed by the host.
    pub fn new(label: &str) -> Self {
        let stream_id = format!("stream-{}-{}", label, uuid::Uuid::new_v4());
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VP8_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            stream_id.clone(),
        ));
        Self {
            stream_id,
            audio,
            video,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Sink for encoded Opus samples.
    pub fn audio(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    /// Sink for encoded VP8 frames.
    pub fn video(&self) -> Arc<TrackLocalStaticSample> {
        self.video.clone()
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

/// Host-provided capture. May suspend indefinitely while the user decides on permissions.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia>;
}

/// Capture backed by sample-fed tracks: always available, the host pushes encoded media.
pub struct SampleCapture {
    label: String,
}

impl SampleCapture {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl MediaSource for SampleCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        let media = LocalMedia::new(&self.label);
        tracing::info!("Local media ready on {}", media.stream_id());
        Ok(media)
    }
}
