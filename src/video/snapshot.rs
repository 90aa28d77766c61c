//! Still image capture
//!
//! A snapshot borrows the camera like any other user, waits for a fresh key
//! frame and hands it to a [`FrameEncoder`] that produces the JPEG.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use super::capture::EncodedSample;
use super::ivf::{frame_header, IvfHeader};
use super::shared_stream::SharedStream;
use super::vp8;
use crate::error::{AppError, Result};

/// Samples discarded before a frame is taken; the first one after opening
/// the sensor is usually badly exposed
const WARMUP_SAMPLES: usize = 1;

/// Upper bound on the wait for a usable key frame
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a single VP8 key frame into an image file
#[async_trait]
pub trait FrameEncoder: Send + Sync {
    async fn encode_jpeg(&self, keyframe: &EncodedSample, width: u16, height: u16, dest: &Path)
        -> Result<()>;
}

/// JPEG encoder that decodes the key frame with ffmpeg
pub struct FfmpegJpegEncoder {
    ffmpeg_path: String,
}

impl FfmpegJpegEncoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

#[async_trait]
impl FrameEncoder for FfmpegJpegEncoder {
    async fn encode_jpeg(
        &self,
        keyframe: &EncodedSample,
        width: u16,
        height: u16,
        dest: &Path,
    ) -> Result<()> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "ivf", "-i", "-"])
            .args(["-frames:v", "1", "-q:v", "2"])
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Internal(format!("Failed to start JPEG encoder: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Internal("JPEG encoder stdin not captured".to_string()))?;
        let mut header = IvfHeader::vp8(width, height);
        header.frame_count = 1;
        stdin.write_all(&header.encode()).await?;
        stdin.write_all(&frame_header(keyframe.data.len(), 0)).await?;
        stdin.write_all(&keyframe.data).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(AppError::Internal(format!(
                "JPEG encoder exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Capture one still image into `dest`
pub async fn take_snapshot(
    stream: &Arc<SharedStream>,
    encoder: &dyn FrameEncoder,
    dest: &Path,
    timeout: Duration,
) -> Result<()> {
    let lease = stream.acquire()?;
    let mut samples = lease.handle().subscribe();

    let wait = async {
        let mut skipped = 0usize;
        loop {
            match samples.recv().await {
                Ok(sample) => {
                    if skipped < WARMUP_SAMPLES {
                        skipped += 1;
                        continue;
                    }
                    if let Some((width, height)) = vp8::keyframe_dimensions(&sample.data) {
                        return Ok((sample, width, height));
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("Snapshot skipped {} samples", n),
                Err(RecvError::Closed) => {
                    return Err(AppError::ResourceUnavailable(
                        "Camera closed before a key frame arrived".to_string(),
                    ))
                }
            }
        }
    };

    let (keyframe, width, height) = tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| AppError::ResourceUnavailable("Timed out waiting for a key frame".to_string()))??;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    encoder.encode_jpeg(&keyframe, width, height, dest).await?;
    info!("Snapshot saved to {} ({}x{})", dest.display(), width, height);

    lease.release();
    Ok(())
}
