//! Capture device abstraction
//!
//! A capture device turns the camera into a stream of encoded VP8 samples.
//! Opening it yields a [`CaptureHandle`] that fans samples out to recorders
//! and exposes the live WebRTC tracks viewers attach to.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// Broadcast capacity for encoded samples (about two seconds at 30 fps)
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Fixed camera/encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 device node
    pub device: String,
    /// ffmpeg binary used for capture and encoding
    pub ffmpeg_path: String,
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    pub fps: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Key frame interval in frames
    pub gop_size: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            resolution: Resolution::HD720,
            pixel_format: PixelFormat::I420,
            fps: 30,
            bitrate_kbps: 500,
            gop_size: 30,
        }
    }
}

impl CaptureConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

/// Encoded VP8 sample for distribution
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Raw VP8 frame
    pub data: Bytes,
    /// Presentation timestamp relative to capture start
    pub timestamp: Duration,
    /// Sample duration
    pub duration: Duration,
    pub is_keyframe: bool,
    /// Sample sequence number
    pub sequence: u64,
}

/// A live outgoing WebRTC track fed by the capture device
pub struct LiveTrack {
    track: Arc<TrackLocalStaticSample>,
    ended: CancellationToken,
}

impl LiveTrack {
    pub fn vp8(id: &str, stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );

        Self {
            track: Arc::new(track),
            ended: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    /// Track handle to attach to a peer connection
    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Fires once when the track stops producing media
    pub fn ended(&self) -> CancellationToken {
        self.ended.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    pub(crate) fn end(&self) {
        self.ended.cancel();
    }

    /// Write a sample to every peer bound to this track
    pub async fn write(&self, sample: &EncodedSample) -> Result<()> {
        let sample = Sample {
            data: sample.data.clone(),
            duration: sample.duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to write sample: {}", e)))
    }
}

/// Open capture resource
///
/// Cheap to clone; all clones refer to the same running capture.
#[derive(Clone)]
pub struct CaptureHandle {
    inner: Arc<CaptureInner>,
}

struct CaptureInner {
    samples: broadcast::Sender<EncodedSample>,
    tracks: Vec<Arc<LiveTrack>>,
    /// Cancelled to stop the capture
    stop: CancellationToken,
    /// Cancelled when the capture stops producing, for any reason
    ended: CancellationToken,
    sequence: AtomicU64,
}

impl CaptureHandle {
    pub fn new(tracks: Vec<Arc<LiveTrack>>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CaptureInner {
                samples,
                tracks,
                stop: CancellationToken::new(),
                ended: CancellationToken::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to encoded samples produced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EncodedSample> {
        self.inner.samples.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.samples.receiver_count()
    }

    /// Tracks currently exposed by this capture
    pub fn tracks(&self) -> &[Arc<LiveTrack>] {
        &self.inner.tracks
    }

    /// Fan a sample out to subscribers; returns the assigned sequence number
    pub fn publish(&self, mut sample: EncodedSample) -> u64 {
        sample.sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let sequence = sample.sequence;
        if self.inner.samples.send(sample).is_err() {
            trace!("No sample subscribers for #{}", sequence);
        }
        sequence
    }

    /// Token the producer watches to know when to stop
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Fires when the capture stops producing
    pub fn ended(&self) -> CancellationToken {
        self.inner.ended.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// Mark the capture as finished without a stop request (device lost)
    pub fn mark_ended(&self) {
        self.inner.ended.cancel();
        for track in &self.inner.tracks {
            track.end();
        }
    }

    /// Stop the capture and end its tracks
    pub fn close(&self) {
        self.inner.stop.cancel();
        self.mark_ended();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.is_cancelled()
    }
}

/// Something that can open the camera
pub trait CaptureDevice: Send + Sync + 'static {
    /// Open the device with the given configuration and start producing samples
    fn open(&self, config: &CaptureConfig) -> Result<CaptureHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::vp8_keyframe;

    fn sample(data: Bytes) -> EncodedSample {
        EncodedSample {
            data,
            timestamp: Duration::ZERO,
            duration: Duration::from_millis(33),
            is_keyframe: true,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_assigns_sequence() {
        let handle = CaptureHandle::new(vec![]);
        let mut rx = handle.subscribe();

        assert_eq!(handle.publish(sample(vp8_keyframe(640, 480))), 0);
        assert_eq!(handle.publish(sample(vp8_keyframe(640, 480))), 1);

        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
    }

    #[test]
    fn test_close_ends_tracks() {
        let track = Arc::new(LiveTrack::vp8("video", "pirtc"));
        let handle = CaptureHandle::new(vec![track.clone()]);
        assert!(!track.is_ended());

        handle.close();
        assert!(handle.is_closed());
        assert!(handle.is_ended());
        assert!(track.is_ended());
    }

    #[test]
    fn test_device_loss_is_not_a_stop_request() {
        let handle = CaptureHandle::new(vec![]);
        handle.mark_ended();
        assert!(handle.is_ended());
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert_eq!(config.resolution, Resolution::HD720);
        assert_eq!(config.bitrate_kbps, 500);
        assert_eq!(config.frame_duration(), Duration::from_nanos(33_333_333));
    }
}
