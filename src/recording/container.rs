//! Recording containers

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use super::webm::{self, ClusterMuxer, WebmHeader};
use crate::error::Result;

/// An open recording file
#[async_trait]
pub trait ContainerWriter: Send {
    /// Append one encoded frame at `timestamp` from the start of the recording
    async fn append(&mut self, data: &[u8], keyframe: bool, timestamp: Duration) -> Result<()>;

    /// Flush and finalize the file
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens container writers
///
/// Width and height come from the first key frame, so writers are opened
/// lazily by the recorder.
#[async_trait]
pub trait ContainerFactory: Send + Sync {
    async fn open(&self, path: &Path, width: u16, height: u16) -> Result<Box<dyn ContainerWriter>>;

    /// File extension for paths handed to [`ContainerFactory::open`]
    fn extension(&self) -> &'static str;
}

/// Writes VP8 recordings as WebM files
#[derive(Debug, Default, Clone)]
pub struct WebmContainerFactory;

#[async_trait]
impl ContainerFactory for WebmContainerFactory {
    async fn open(&self, path: &Path, width: u16, height: u16) -> Result<Box<dyn ContainerWriter>> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent).await?;
        }

        let header = WebmHeader::vp8(width, height);
        let file = File::create(path).await?;
        let mut out = BufWriter::new(file);
        out.write_all(&header.bytes).await?;
        debug!("Opened {} ({}x{})", path.display(), width, height);

        Ok(Box::new(WebmFileWriter {
            path: path.to_path_buf(),
            written: header.bytes.len() as u64,
            header,
            out,
            muxer: ClusterMuxer::default(),
            frames: 0,
        }))
    }

    fn extension(&self) -> &'static str {
        "webm"
    }
}

struct WebmFileWriter {
    path: PathBuf,
    header: WebmHeader,
    out: BufWriter<File>,
    muxer: ClusterMuxer,
    written: u64,
    frames: u64,
}

impl WebmFileWriter {
    async fn write_cluster(&mut self, cluster: Option<Bytes>) -> Result<()> {
        if let Some(cluster) = cluster {
            self.out.write_all(&cluster).await?;
            self.written += cluster.len() as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerWriter for WebmFileWriter {
    async fn append(&mut self, data: &[u8], keyframe: bool, timestamp: Duration) -> Result<()> {
        let finished = self.muxer.push(data, keyframe, timestamp);
        self.write_cluster(finished).await?;
        self.frames += 1;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        let rest = self.muxer.flush();
        self.write_cluster(rest).await?;
        self.out.flush().await?;

        let segment_size = self.written - self.header.segment_data_offset;
        let duration = self.muxer.duration();
        let mut file = self.out.into_inner();
        file.seek(SeekFrom::Start(self.header.segment_size_offset))
            .await?;
        file.write_all(&webm::segment_size_field(segment_size)).await?;
        file.seek(SeekFrom::Start(self.header.duration_offset)).await?;
        file.write_all(&webm::duration_field(duration)).await?;
        file.sync_all().await?;
        debug!(
            "Finalized {} ({} frames, {:.1}s)",
            self.path.display(),
            self.frames,
            duration.as_secs_f32()
        );
        Ok(())
    }
}

/// Create a directory readable only by the service user
async fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::webm::reader::{children, element_header, find};
    use crate::recording::webm::{CLUSTER, SEGMENT, SIMPLE_BLOCK};
    use crate::testing::{vp8_interframe, vp8_keyframe};

    #[tokio::test]
    async fn test_webm_recording_is_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clips").join("clip.webm");

        let mut writer = WebmContainerFactory.open(&path, 1280, 720).await.unwrap();
        let key = vp8_keyframe(1280, 720);
        let inter = vp8_interframe();
        writer.append(&key, true, Duration::ZERO).await.unwrap();
        writer
            .append(&inter, false, Duration::from_millis(33))
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let raw = tokio::fs::read(&path).await.unwrap();
        let header = WebmHeader::vp8(1280, 720);
        assert_eq!(&raw[..4], &[0x1A, 0x45, 0xDF, 0xA3]);

        let segment_at = header.segment_size_offset as usize - 4;
        let (id, size, len) = element_header(&raw[segment_at..]).unwrap();
        assert_eq!(id, SEGMENT);
        assert_eq!(size, Some((raw.len() - segment_at - len) as u64));

        let offset = header.duration_offset as usize;
        let duration = f64::from_be_bytes(raw[offset..offset + 8].try_into().unwrap());
        assert!((duration - 66.333).abs() < 0.01, "duration {}", duration);

        let segment = children(&raw[segment_at + len..]);
        let cluster = find(&segment, CLUSTER).unwrap();
        let blocks: Vec<&[u8]> = children(cluster)
            .into_iter()
            .filter(|(id, _)| *id == SIMPLE_BLOCK)
            .map(|(_, body)| body)
            .collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0][3], 0x80);
        assert_eq!(&blocks[0][4..], &key[..]);
        assert_eq!(&blocks[1][1..3], &33i16.to_be_bytes());
        assert_eq!(blocks[1][3], 0x00);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recording_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let clips = dir.path().join("videos");
        let writer = WebmContainerFactory
            .open(&clips.join("a.webm"), 640, 480)
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let mode = std::fs::metadata(&clips).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
