//! IVF framing
//!
//! IVF is the minimal container libvpx tools use for raw VP8 streams: a
//! 32-byte file header followed by frames, each prefixed by a 12-byte header
//! carrying the payload size and a presentation timestamp in time-base units.
//! Frames are read from the encoder process in this format, and single key
//! frames are written back out to the JPEG encoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{AppError, Result};

pub const FILE_HEADER_LEN: usize = 32;
pub const FRAME_HEADER_LEN: usize = 12;

const SIGNATURE: &[u8; 4] = b"DKIF";
const VP8_FOURCC: &[u8; 4] = b"VP80";

/// Upper bound for a single frame, guards against a desynchronized stream
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Parsed IVF file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    /// Time base denominator (ticks per second)
    pub timebase_den: u32,
    /// Time base numerator
    pub timebase_num: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    /// VP8 header with a millisecond time base
    pub fn vp8(width: u16, height: u16) -> Self {
        Self {
            fourcc: *VP8_FOURCC,
            width,
            height,
            timebase_den: 1000,
            timebase_num: 1,
            frame_count: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_HEADER_LEN);
        buf.put_slice(SIGNATURE);
        buf.put_u16_le(0);
        buf.put_u16_le(FILE_HEADER_LEN as u16);
        buf.put_slice(&self.fourcc);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u32_le(self.timebase_den);
        buf.put_u32_le(self.timebase_num);
        buf.put_u32_le(self.frame_count);
        buf.put_u32_le(0);
        buf.freeze()
    }

    pub fn decode(mut raw: &[u8]) -> Result<Self> {
        if raw.len() < FILE_HEADER_LEN || &raw[..4] != SIGNATURE {
            return Err(AppError::Protocol("Not an IVF stream".to_string()));
        }
        raw.advance(4);
        let _version = raw.get_u16_le();
        let header_len = raw.get_u16_le() as usize;
        if header_len != FILE_HEADER_LEN {
            return Err(AppError::Protocol(format!(
                "Unsupported IVF header length {}",
                header_len
            )));
        }
        let mut fourcc = [0u8; 4];
        raw.copy_to_slice(&mut fourcc);
        Ok(Self {
            fourcc,
            width: raw.get_u16_le(),
            height: raw.get_u16_le(),
            timebase_den: raw.get_u32_le(),
            timebase_num: raw.get_u32_le(),
            frame_count: raw.get_u32_le(),
        })
    }

    /// Length of one time-base tick
    pub fn tick(&self) -> std::time::Duration {
        if self.timebase_den == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_nanos(
            1_000_000_000u64 * self.timebase_num as u64 / self.timebase_den as u64,
        )
    }
}

/// Per-frame header
pub fn frame_header(len: usize, timestamp: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
    buf.put_u32_le(len as u32);
    buf.put_u64_le(timestamp);
    buf.freeze()
}

/// One frame read from an IVF stream
#[derive(Debug, Clone)]
pub struct IvfFrame {
    pub timestamp: u64,
    pub data: Bytes,
}

/// Incremental reader over an IVF byte stream
pub struct IvfReader<R> {
    inner: R,
    header: IvfHeader,
}

impl<R: AsyncRead + Unpin> IvfReader<R> {
    /// Read and validate the file header
    pub async fn new(mut inner: R) -> Result<Self> {
        let mut raw = [0u8; FILE_HEADER_LEN];
        inner.read_exact(&mut raw).await?;
        let header = IvfHeader::decode(&raw)?;
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> &IvfHeader {
        &self.header
    }

    /// Next frame, `None` on a clean end of stream
    pub async fn next_frame(&mut self) -> Result<Option<IvfFrame>> {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        match self.inner.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut header = &raw[..];
        let len = header.get_u32_le() as usize;
        let timestamp = header.get_u64_le();
        if len > MAX_FRAME_LEN {
            return Err(AppError::Protocol(format!("IVF frame too large: {} bytes", len)));
        }

        let mut data = vec![0u8; len];
        self.inner.read_exact(&mut data).await?;
        Ok(Some(IvfFrame {
            timestamp,
            data: Bytes::from(data),
        }))
    }
}
