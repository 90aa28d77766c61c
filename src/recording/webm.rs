//! WebM muxing
//!
//! Recordings are single-track VP8 WebM files: an EBML header, then a
//! Segment holding Info, Tracks and a run of Clusters of SimpleBlocks. The
//! Segment size and the Info duration are only known when the recording
//! ends, so the header reserves fixed-width fields for them and the writer
//! patches them in place.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

mod id {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;

    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const NAME: u32 = 0x536E;
    pub const CODEC_ID: u32 = 0x86;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
}

pub use id::{CLUSTER, SEGMENT, SIMPLE_BLOCK};

/// One tick of the segment timeline
pub const TIMESTAMP_SCALE_NS: u64 = 1_000_000;

/// Nominal frame duration written to the track header (30 fps)
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(33_333_333);

const VIDEO_TRACK: u64 = 1;
const VIDEO_TRACK_UID: u64 = 67890;
const TRACK_TYPE_VIDEO: u64 = 1;
const APP_NAME: &str = concat!("pirtc-", env!("CARGO_PKG_VERSION"));

/// Eight-byte size field whose value bits are all ones
const UNKNOWN_SIZE: u64 = 0x01FF_FFFF_FFFF_FFFF;

/// A new cluster starts at the first key frame after this span
const CLUSTER_SPAN_MS: u64 = 5_000;
/// Block timestamps are signed 16-bit offsets from the cluster timestamp
const MAX_BLOCK_OFFSET_MS: u64 = i16::MAX as u64;
const MAX_CLUSTER_BYTES: usize = 4 * 1024 * 1024;

fn put_id(buf: &mut BytesMut, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    buf.put_slice(&bytes[skip..]);
}

/// Encoded length of an element data size
fn size_len(size: u64) -> usize {
    (1..=8)
        .find(|n| size < (1u64 << (7 * n)) - 1)
        .unwrap_or(8)
}

fn put_size(buf: &mut BytesMut, size: u64) {
    let len = size_len(size);
    let marked = size | (1u64 << (7 * len));
    buf.put_slice(&marked.to_be_bytes()[8 - len..]);
}

fn put_uint(buf: &mut BytesMut, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    put_id(buf, id);
    put_size(buf, (8 - skip) as u64);
    buf.put_slice(&bytes[skip..]);
}

fn put_float(buf: &mut BytesMut, id: u32, value: f64) {
    put_id(buf, id);
    put_size(buf, 8);
    buf.put_f64(value);
}

fn put_str(buf: &mut BytesMut, id: u32, value: &str) {
    put_id(buf, id);
    put_size(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// Write a master element, returning the offset of its body in `buf`
fn put_master(buf: &mut BytesMut, id: u32, body: &[u8]) -> usize {
    put_id(buf, id);
    put_size(buf, body.len() as u64);
    let start = buf.len();
    buf.put_slice(body);
    start
}

/// Eight-byte size field for the Segment, written once the size is known
pub fn segment_size_field(size: u64) -> [u8; 8] {
    (size.min(UNKNOWN_SIZE - 1) | (1u64 << 56)).to_be_bytes()
}

/// Info duration in timeline ticks
pub fn duration_field(duration: Duration) -> [u8; 8] {
    let ticks = duration.as_nanos() as f64 / TIMESTAMP_SCALE_NS as f64;
    ticks.to_be_bytes()
}

/// File prologue up to the first cluster
#[derive(Debug, Clone)]
pub struct WebmHeader {
    pub bytes: Bytes,
    /// Offset of the Segment's eight-byte size field
    pub segment_size_offset: u64,
    /// Offset of the first byte inside the Segment
    pub segment_data_offset: u64,
    /// Offset of the Info duration float
    pub duration_offset: u64,
}

impl WebmHeader {
    /// Header for a single VP8 track of the given frame size
    pub fn vp8(width: u16, height: u16) -> Self {
        let mut out = BytesMut::with_capacity(256);

        let mut ebml = BytesMut::new();
        put_uint(&mut ebml, id::EBML_VERSION, 1);
        put_uint(&mut ebml, id::EBML_READ_VERSION, 1);
        put_uint(&mut ebml, id::EBML_MAX_ID_LENGTH, 4);
        put_uint(&mut ebml, id::EBML_MAX_SIZE_LENGTH, 8);
        put_str(&mut ebml, id::DOC_TYPE, "webm");
        put_uint(&mut ebml, id::DOC_TYPE_VERSION, 2);
        put_uint(&mut ebml, id::DOC_TYPE_READ_VERSION, 2);
        put_master(&mut out, id::EBML, &ebml);

        put_id(&mut out, id::SEGMENT);
        let segment_size_offset = out.len() as u64;
        out.put_u64(UNKNOWN_SIZE);
        let segment_data_offset = out.len() as u64;

        let mut info = BytesMut::new();
        put_uint(&mut info, id::TIMESTAMP_SCALE, TIMESTAMP_SCALE_NS);
        // 2-byte id, 1-byte size
        let duration_in_info = info.len() + 3;
        put_float(&mut info, id::DURATION, 0.0);
        put_str(&mut info, id::MUXING_APP, APP_NAME);
        put_str(&mut info, id::WRITING_APP, APP_NAME);
        let info_body = put_master(&mut out, id::INFO, &info);
        let duration_offset = (info_body + duration_in_info) as u64;

        let mut video = BytesMut::new();
        put_uint(&mut video, id::PIXEL_WIDTH, width as u64);
        put_uint(&mut video, id::PIXEL_HEIGHT, height as u64);

        let mut entry = BytesMut::new();
        put_uint(&mut entry, id::TRACK_NUMBER, VIDEO_TRACK);
        put_uint(&mut entry, id::TRACK_UID, VIDEO_TRACK_UID);
        put_uint(&mut entry, id::TRACK_TYPE, TRACK_TYPE_VIDEO);
        put_str(&mut entry, id::NAME, "Video");
        put_str(&mut entry, id::CODEC_ID, "V_VP8");
        put_uint(
            &mut entry,
            id::DEFAULT_DURATION,
            DEFAULT_FRAME_DURATION.as_nanos() as u64,
        );
        put_master(&mut entry, id::VIDEO, &video);

        let mut tracks = BytesMut::new();
        put_master(&mut tracks, id::TRACK_ENTRY, &entry);
        put_master(&mut out, id::TRACKS, &tracks);

        Self {
            bytes: out.freeze(),
            segment_size_offset,
            segment_data_offset,
            duration_offset,
        }
    }
}

struct Cluster {
    start_ms: u64,
    body: BytesMut,
}

impl Cluster {
    fn new(start_ms: u64) -> Self {
        let mut body = BytesMut::with_capacity(64 * 1024);
        put_uint(&mut body, id::TIMESTAMP, start_ms);
        Self { start_ms, body }
    }

    fn accepts(&self, timestamp_ms: u64, keyframe: bool) -> bool {
        let offset = timestamp_ms.saturating_sub(self.start_ms);
        offset <= MAX_BLOCK_OFFSET_MS
            && self.body.len() < MAX_CLUSTER_BYTES
            && !(keyframe && offset >= CLUSTER_SPAN_MS)
    }

    fn push(&mut self, data: &[u8], keyframe: bool, timestamp_ms: u64) {
        let offset = timestamp_ms.saturating_sub(self.start_ms) as i16;
        put_id(&mut self.body, id::SIMPLE_BLOCK);
        put_size(&mut self.body, 4 + data.len() as u64);
        put_size(&mut self.body, VIDEO_TRACK);
        self.body.put_i16(offset);
        self.body.put_u8(if keyframe { 0x80 } else { 0x00 });
        self.body.put_slice(data);
    }

    fn encode(self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.body.len() + 12);
        put_master(&mut out, id::CLUSTER, &self.body);
        out.freeze()
    }
}

/// Groups frames into clusters
///
/// `push` hands back a finished cluster whenever the incoming frame has to
/// open a new one; `flush` returns whatever is still buffered.
#[derive(Default)]
pub struct ClusterMuxer {
    open: Option<Cluster>,
    end: Duration,
}

impl ClusterMuxer {
    pub fn push(&mut self, data: &[u8], keyframe: bool, timestamp: Duration) -> Option<Bytes> {
        let timestamp_ms = timestamp.as_millis() as u64;
        let finished = match self.open.take() {
            Some(cluster) if cluster.accepts(timestamp_ms, keyframe) => {
                self.open = Some(cluster);
                None
            }
            Some(cluster) => Some(cluster.encode()),
            None => None,
        };

        self.open
            .get_or_insert_with(|| Cluster::new(timestamp_ms))
            .push(data, keyframe, timestamp_ms);
        self.end = self.end.max(timestamp + DEFAULT_FRAME_DURATION);
        finished
    }

    pub fn flush(&mut self) -> Option<Bytes> {
        self.open.take().map(Cluster::encode)
    }

    /// End of the last frame pushed
    pub fn duration(&self) -> Duration {
        self.end
    }
}


#[cfg(test)]
mod tests {
    use super::reader::{children, element_header, find, uint};
    use super::*;

    fn encoded_size(size: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_size(&mut buf, size);
        buf.to_vec()
    }

    #[test]
    fn test_size_uses_shortest_encoding() {
        assert_eq!(encoded_size(0), vec![0x80]);
        assert_eq!(encoded_size(5), vec![0x85]);
        // 127 is the reserved all-ones value for one byte
        assert_eq!(encoded_size(127), vec![0x40, 0x7F]);
        assert_eq!(encoded_size(300), vec![0x41, 0x2C]);
    }

    #[test]
    fn test_header_describes_vp8_track() {
        let header = WebmHeader::vp8(1280, 720);
        let top = children(&header.bytes);
        assert_eq!(top[0].0, id::EBML);
        assert_eq!(find(&children(top[0].1), id::DOC_TYPE), Some(&b"webm"[..]));

        // 4-byte id, 1-byte size
        let ebml_len = top[0].1.len() + 5;
        let (seg_id, seg_size, seg_header) = element_header(&header.bytes[ebml_len..]).unwrap();
        assert_eq!(seg_id, SEGMENT);
        assert_eq!(seg_size, None);
        assert_eq!(seg_header, 12);
        assert_eq!(header.segment_size_offset as usize, ebml_len + 4);

        let segment = children(&header.bytes[header.segment_data_offset as usize..]);
        let tracks = find(&segment, id::TRACKS).unwrap();
        let entry = children(find(&children(tracks), id::TRACK_ENTRY).unwrap());
        assert_eq!(find(&entry, id::CODEC_ID), Some(&b"V_VP8"[..]));
        let video = children(find(&entry, id::VIDEO).unwrap());
        assert_eq!(uint(find(&video, id::PIXEL_WIDTH).unwrap()), 1280);
        assert_eq!(uint(find(&video, id::PIXEL_HEIGHT).unwrap()), 720);

        let info = children(find(&segment, id::INFO).unwrap());
        assert_eq!(uint(find(&info, id::TIMESTAMP_SCALE).unwrap()), 1_000_000);
        let offset = header.duration_offset as usize;
        assert_eq!(&header.bytes[offset - 3..offset], &[0x44, 0x89, 0x88]);
    }

    #[test]
    fn test_segment_size_field_keeps_eight_bytes() {
        assert_eq!(segment_size_field(0x1234), [0x01, 0, 0, 0, 0, 0, 0x12, 0x34]);
        assert_eq!(duration_field(Duration::from_millis(1500)), 1500f64.to_be_bytes());
    }

    #[test]
    fn test_clusters_split_on_late_keyframe() {
        let mut muxer = ClusterMuxer::default();
        assert!(muxer.push(b"k0", true, Duration::ZERO).is_none());
        assert!(muxer.push(b"i1", false, Duration::from_secs(3)).is_none());
        // Interframes never start a cluster while offsets fit
        assert!(muxer.push(b"i2", false, Duration::from_secs(6)).is_none());

        let first = muxer.push(b"k3", true, Duration::from_secs(7)).unwrap();
        let (cluster_id, _, header) = element_header(&first).unwrap();
        assert_eq!(cluster_id, CLUSTER);
        let body = children(&first[header..]);
        assert_eq!(uint(find(&body, id::TIMESTAMP).unwrap()), 0);
        let blocks: Vec<_> = body.iter().filter(|(i, _)| *i == SIMPLE_BLOCK).collect();
        assert_eq!(blocks.len(), 3);
        // track 1, offset 3000 ms, no flags
        assert_eq!(&blocks[1].1[..4], &[0x81, 0x0B, 0xB8, 0x00]);

        let second = muxer.flush().unwrap();
        let body = children(&second[element_header(&second).unwrap().2..]);
        assert_eq!(uint(find(&body, id::TIMESTAMP).unwrap()), 7000);
        assert_eq!(&find(&body, SIMPLE_BLOCK).unwrap()[..4], &[0x81, 0x00, 0x00, 0x80]);
        assert!(muxer.flush().is_none());
        assert_eq!(
            muxer.duration(),
            Duration::from_secs(7) + DEFAULT_FRAME_DURATION
        );
    }

    #[test]
    fn test_cluster_splits_before_offset_overflows() {
        let mut muxer = ClusterMuxer::default();
        muxer.push(b"k0", true, Duration::ZERO);
        assert!(muxer.push(b"i1", false, Duration::from_millis(32_767)).is_none());
        assert!(muxer.push(b"i2", false, Duration::from_millis(32_768)).is_some());
    }
}
