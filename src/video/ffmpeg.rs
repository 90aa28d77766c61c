//! ffmpeg-backed capture device
//!
//! Runs `ffmpeg` as a child process that reads the V4L2 camera, encodes VP8
//! with libvpx and writes an IVF stream to stdout. Frames are parsed off the
//! pipe, written into the shared WebRTC track and broadcast to recorders.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::capture::{CaptureConfig, CaptureDevice, CaptureHandle, EncodedSample, LiveTrack};
use super::ivf::IvfReader;
use super::vp8;
use crate::error::{AppError, Result};

/// Track and stream ids announced to viewers
pub const VIDEO_TRACK_ID: &str = "video";
pub const VIDEO_STREAM_ID: &str = "pirtc";

/// Camera driven by an ffmpeg child process
#[derive(Debug, Default, Clone)]
pub struct FfmpegCamera;

impl FfmpegCamera {
    pub fn new() -> Self {
        Self
    }

    /// ffmpeg arguments for capture + VP8 encoding to IVF on stdout
    pub fn build_args(config: &CaptureConfig) -> Vec<String> {
        let bitrate = format!("{}k", config.bitrate_kbps);
        let fps = config.fps.to_string();
        let size = config.resolution.to_string();
        let gop = config.gop_size.to_string();

        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "nobuffer",
            "-f",
            "v4l2",
            "-input_format",
            config.pixel_format.v4l2_input_format(),
            "-framerate",
            fps.as_str(),
            "-video_size",
            size.as_str(),
            "-i",
            config.device.as_str(),
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libvpx",
            "-deadline",
            "realtime",
            "-cpu-used",
            "8",
            "-b:v",
            bitrate.as_str(),
            "-maxrate",
            bitrate.as_str(),
            "-g",
            gop.as_str(),
            "-an",
            "-flush_packets",
            "1",
            "-f",
            "ivf",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl CaptureDevice for FfmpegCamera {
    fn open(&self, config: &CaptureConfig) -> Result<CaptureHandle> {
        let args = Self::build_args(config);
        info!(
            "Starting camera {}: {} {}",
            config.device,
            config.ffmpeg_path,
            args.join(" ")
        );

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::ResourceUnavailable(format!(
                    "Failed to start {} for {}: {}",
                    config.ffmpeg_path, config.device, e
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AppError::ResourceUnavailable("Encoder stdout not captured".to_string())
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(config.device.clone(), stderr));
        }

        let track = Arc::new(LiveTrack::vp8(VIDEO_TRACK_ID, VIDEO_STREAM_ID));
        let handle = CaptureHandle::new(vec![track]);

        tokio::spawn(run_capture(
            handle.clone(),
            child,
            stdout,
            config.frame_duration(),
        ));

        Ok(handle)
    }
}

/// Pump frames from the encoder until stopped or the process dies
async fn run_capture(
    handle: CaptureHandle,
    mut child: Child,
    stdout: ChildStdout,
    nominal_duration: Duration,
) {
    let stop = handle.stop_token();

    tokio::select! {
        _ = stop.cancelled() => {
            debug!("Camera stop requested");
        }
        result = pump_frames(&handle, stdout, nominal_duration) => {
            match result {
                Ok(count) => warn!("Encoder stream ended after {} frames", count),
                Err(e) => warn!("Encoder stream failed: {}", e),
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Failed to kill encoder process: {}", e);
    }
    match child.wait().await {
        Ok(status) => info!("Camera closed ({})", status),
        Err(e) => warn!("Failed to reap encoder process: {}", e),
    }

    handle.mark_ended();
}

/// Time since the first frame for a distance of `ticks` time-base units
fn stream_offset(tick: Duration, ticks: u64) -> Duration {
    let tick_ns = u64::try_from(tick.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(tick_ns.saturating_mul(ticks))
}

async fn pump_frames<R: AsyncRead + Unpin>(
    handle: &CaptureHandle,
    source: R,
    nominal_duration: Duration,
) -> Result<u64> {
    let mut reader = IvfReader::new(source).await?;
    let header = *reader.header();
    let tick = header.tick();
    info!(
        "Encoder stream started: {}x{}, time base {}/{}",
        header.width, header.height, header.timebase_num, header.timebase_den
    );

    let mut first_ts: Option<u64> = None;
    let mut previous: Option<Duration> = None;
    let mut frames = 0u64;

    while let Some(frame) = reader.next_frame().await? {
        let base = *first_ts.get_or_insert(frame.timestamp);
        let timestamp = stream_offset(tick, frame.timestamp.saturating_sub(base));
        let duration = match previous {
            Some(prev) if timestamp > prev => timestamp - prev,
            _ => nominal_duration,
        };
        previous = Some(timestamp);

        let sample = EncodedSample {
            is_keyframe: vp8::is_keyframe(&frame.data),
            data: frame.data,
            timestamp,
            duration,
            sequence: 0,
        };

        for track in handle.tracks() {
            if let Err(e) = track.write(&sample).await {
                debug!("Track {} write failed: {}", track.id(), e);
            }
        }
        handle.publish(sample);
        frames += 1;
    }

    Ok(frames)
}

async fn forward_stderr<R: AsyncRead + Unpin>(device: String, stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[ffmpeg {}] {}", device, line),
            Ok(None) => break,
            Err(e) => {
                warn!("[ffmpeg {}] Error reading log: {}", device, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{vp8_interframe, vp8_keyframe};
    use crate::video::format::Resolution;
    use crate::video::ivf::{frame_header, IvfHeader};

    #[test]
    fn test_build_args() {
        let config = CaptureConfig {
            device: "/dev/video2".to_string(),
            resolution: Resolution::VGA,
            bitrate_kbps: 800,
            ..Default::default()
        };
        let args = FfmpegCamera::build_args(&config);
        let joined = args.join(" ");

        assert!(joined.contains("-i /dev/video2"));
        assert!(joined.contains("-video_size 640x480"));
        assert!(joined.contains("-b:v 800k"));
        assert!(joined.contains("-c:v libvpx"));
        assert!(joined.ends_with("-f ivf -"));
    }

    #[test]
    fn test_stream_offset_past_u32_ticks() {
        let tick = Duration::from_millis(1);
        // 50 days of millisecond ticks
        let ticks = 50 * 24 * 3600 * 1000u64;
        assert!(ticks > u32::MAX as u64);
        assert_eq!(stream_offset(tick, ticks), Duration::from_secs(50 * 24 * 3600));
        assert_eq!(stream_offset(tick, u64::MAX), Duration::from_nanos(u64::MAX));
    }

    #[tokio::test]
    async fn test_pump_frames_publishes_samples() {
        let mut header = IvfHeader::vp8(640, 480);
        header.timebase_den = 30;
        let mut stream = header.encode().to_vec();
        for (ts, frame) in [(100u64, vp8_keyframe(640, 480)), (101, vp8_interframe())] {
            stream.extend_from_slice(&frame_header(frame.len(), ts));
            stream.extend_from_slice(&frame);
        }

        let handle = CaptureHandle::new(vec![]);
        let mut rx = handle.subscribe();
        let count = pump_frames(&handle, &stream[..], Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(count, 2);

        let first = rx.recv().await.unwrap();
        assert!(first.is_keyframe);
        assert_eq!(first.timestamp, Duration::ZERO);
        assert_eq!(first.duration, Duration::from_millis(40));

        let second = rx.recv().await.unwrap();
        assert!(!second.is_keyframe);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.duration, Duration::from_nanos(33_333_333));
    }
}
