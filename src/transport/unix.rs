//! Unix stream socket connection to the sensor daemon

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::{Dialer, FrameReader, FrameWriter};
use crate::error::{AppError, Result};

/// Largest frame read in one go; each read is one frame
const READ_BUFFER_SIZE: usize = 1024;

pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Dialer for UnixDialer {
    type Reader = UnixFrameReader;
    type Writer = UnixFrameWriter;

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    async fn dial(&self) -> Result<(Self::Reader, Self::Writer)> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            AppError::TransportBroken(format!("{}: {}", self.path.display(), e))
        })?;
        let (read, write) = stream.into_split();
        Ok((
            UnixFrameReader {
                inner: read,
                buf: vec![0; READ_BUFFER_SIZE],
            },
            UnixFrameWriter { inner: write },
        ))
    }
}

pub struct UnixFrameReader {
    inner: OwnedReadHalf,
    buf: Vec<u8>,
}

#[async_trait]
impl FrameReader for UnixFrameReader {
    async fn read_frame(&mut self) -> Result<Option<String>> {
        loop {
            let n = self
                .inner
                .read(&mut self.buf)
                .await
                .map_err(|e| AppError::TransportBroken(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }

            let text = String::from_utf8_lossy(&self.buf[..n]);
            let frame = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
            if !frame.is_empty() {
                return Ok(Some(frame.to_string()));
            }
        }
    }
}

pub struct UnixFrameWriter {
    inner: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for UnixFrameWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        self.inner
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| AppError::TransportBroken(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
