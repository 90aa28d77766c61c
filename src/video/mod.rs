//! Camera capture, encoding and sharing
//!
//! ```text
//! CaptureDevice (ffmpeg: V4L2 -> VP8/IVF)
//!        |
//!        v
//! SharedStream (ref-counted, opened on first use)
//!        |
//!   ┌────┴──────────┬─────────────┐
//!   v               v             v
//! LiveTrack      recorders     snapshots
//! (WebRTC)   (broadcast samples)
//! ```

pub mod capture;
pub mod ffmpeg;
pub mod format;
pub mod ivf;
pub mod shared_stream;
pub mod snapshot;
pub mod vp8;

pub use capture::{CaptureConfig, CaptureDevice, CaptureHandle, EncodedSample, LiveTrack};
pub use ffmpeg::FfmpegCamera;
pub use format::{PixelFormat, Resolution};
pub use shared_stream::{SharedStream, StreamLease};
pub use snapshot::{take_snapshot, FfmpegJpegEncoder, FrameEncoder};
