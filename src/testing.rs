//! Fakes for unit tests
//!
//! Every external collaborator (camera, peer connections, containers,
//! uploads, signaling, transport dialing) has an in-memory stand-in here.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::{AppError, Result};
use crate::recording::{ContainerFactory, ContainerWriter};
use crate::transport::{Dialer, FrameReader, FrameWriter, SignalingSink};
use crate::upload::MediaUploader;
use crate::video::capture::{CaptureConfig, CaptureDevice, CaptureHandle, EncodedSample, LiveTrack};
use crate::video::ffmpeg::{VIDEO_STREAM_ID, VIDEO_TRACK_ID};
use crate::video::snapshot::FrameEncoder;
use crate::webrtc::peer::{PeerConnector, PeerLink};
use crate::webrtc::signaling::{ConnectionState, SessionDescription};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

/// Poll `check` until it holds or the wait limit passes
pub(crate) async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(POLL).await;
    }
}

/// Minimal VP8 key frame of the given size
pub(crate) fn vp8_keyframe(width: u16, height: u16) -> Bytes {
    let mut frame = BytesMut::with_capacity(32);
    // Frame tag: key frame, version 0, shown
    frame.put_slice(&[0x10, 0x02, 0x00]);
    frame.put_slice(&[0x9d, 0x01, 0x2a]);
    frame.put_u16_le(width);
    frame.put_u16_le(height);
    frame.put_bytes(0xAA, 22);
    frame.freeze()
}

/// Minimal VP8 inter frame
pub(crate) fn vp8_interframe() -> Bytes {
    let mut frame = BytesMut::with_capacity(16);
    frame.put_slice(&[0x11, 0x02, 0x00]);
    frame.put_bytes(0x55, 13);
    frame.freeze()
}

fn sample(data: Bytes, is_keyframe: bool) -> EncodedSample {
    EncodedSample {
        data,
        timestamp: Duration::ZERO,
        duration: Duration::from_millis(33),
        is_keyframe,
        sequence: 0,
    }
}

pub(crate) fn keyframe_sample(width: u16, height: u16) -> EncodedSample {
    sample(vp8_keyframe(width, height), true)
}

pub(crate) fn interframe_sample() -> EncodedSample {
    sample(vp8_interframe(), false)
}

/// Camera that hands out in-memory captures
#[derive(Default)]
pub(crate) struct FakeCamera {
    handles: Mutex<Vec<CaptureHandle>>,
    fail_next: AtomicBool,
}

impl FakeCamera {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub(crate) fn closed_count(&self) -> usize {
        self.handles.lock().iter().filter(|h| h.is_closed()).count()
    }

    pub(crate) fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn latest(&self) -> Option<CaptureHandle> {
        self.handles.lock().last().cloned()
    }

    /// Publish a sample on the most recent capture
    pub(crate) fn push(&self, sample: EncodedSample) {
        if let Some(handle) = self.latest() {
            handle.publish(sample);
        }
    }

    /// Simulate the device disappearing under its users
    pub(crate) fn lose_device(&self) {
        if let Some(handle) = self.latest() {
            handle.mark_ended();
        }
    }

    pub(crate) async fn wait_for_subscriber(&self) {
        wait_until("a sample subscriber", || {
            self.latest()
                .map(|h| h.subscriber_count() > 0)
                .unwrap_or(false)
        })
        .await;
    }
}

impl CaptureDevice for FakeCamera {
    fn open(&self, _config: &CaptureConfig) -> Result<CaptureHandle> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::ResourceUnavailable("fake camera busy".to_string()));
        }
        let track = Arc::new(LiveTrack::vp8(VIDEO_TRACK_ID, VIDEO_STREAM_ID));
        let handle = CaptureHandle::new(vec![track]);
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }
}

/// Records requested stills instead of encoding them
#[derive(Default)]
pub(crate) struct FakeJpegEncoder {
    calls: Mutex<Vec<(u16, u16, PathBuf)>>,
}

impl FakeJpegEncoder {
    pub(crate) fn calls(&self) -> Vec<(u16, u16, PathBuf)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FrameEncoder for FakeJpegEncoder {
    async fn encode_jpeg(
        &self,
        _keyframe: &EncodedSample,
        width: u16,
        height: u16,
        dest: &Path,
    ) -> Result<()> {
        self.calls.lock().push((width, height, dest.to_path_buf()));
        Ok(())
    }
}

/// A recording kept in memory
#[derive(Debug, Clone)]
pub(crate) struct MemoryFile {
    pub width: u16,
    pub height: u16,
    pub timestamps: Vec<Duration>,
    pub finished: bool,
}

#[derive(Default)]
pub(crate) struct MemoryContainers {
    files: Arc<Mutex<HashMap<PathBuf, MemoryFile>>>,
}

impl MemoryContainers {
    pub(crate) fn file(&self, path: &Path) -> Option<MemoryFile> {
        self.files.lock().get(path).cloned()
    }

    pub(crate) async fn wait_for_frames(&self, path: &Path, frames: usize) {
        wait_until("recorded frames", || {
            self.file(path)
                .map(|f| f.timestamps.len() >= frames)
                .unwrap_or(false)
        })
        .await;
    }
}

#[async_trait]
impl ContainerFactory for MemoryContainers {
    async fn open(&self, path: &Path, width: u16, height: u16) -> Result<Box<dyn ContainerWriter>> {
        self.files.lock().insert(
            path.to_path_buf(),
            MemoryFile {
                width,
                height,
                timestamps: Vec::new(),
                finished: false,
            },
        );
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            files: self.files.clone(),
        }))
    }

    fn extension(&self) -> &'static str {
        "webm"
    }
}

struct MemoryWriter {
    path: PathBuf,
    files: Arc<Mutex<HashMap<PathBuf, MemoryFile>>>,
}

#[async_trait]
impl ContainerWriter for MemoryWriter {
    async fn append(&mut self, _data: &[u8], _keyframe: bool, timestamp: Duration) -> Result<()> {
        if let Some(file) = self.files.lock().get_mut(&self.path) {
            file.timestamps.push(timestamp);
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        if let Some(file) = self.files.lock().get_mut(&self.path) {
            file.finished = true;
        }
        Ok(())
    }
}

/// Remembers what would have been uploaded
#[derive(Default)]
pub(crate) struct FakeUploader {
    images: Mutex<Vec<PathBuf>>,
    videos: Mutex<Vec<PathBuf>>,
}

impl FakeUploader {
    pub(crate) fn images(&self) -> Vec<PathBuf> {
        self.images.lock().clone()
    }

    pub(crate) fn videos(&self) -> Vec<PathBuf> {
        self.videos.lock().clone()
    }
}

#[async_trait]
impl MediaUploader for FakeUploader {
    async fn upload_image(&self, path: &Path) -> Result<()> {
        self.images.lock().push(path.to_path_buf());
        Ok(())
    }

    async fn upload_video(&self, path: &Path) -> Result<()> {
        self.videos.lock().push(path.to_path_buf());
        Ok(())
    }
}

/// Peer connection whose state the test drives
pub(crate) struct FakeLink {
    state: watch::Sender<ConnectionState>,
    tracks: Mutex<Vec<String>>,
    remote: Mutex<Option<String>>,
    closes: AtomicUsize,
    fail_remote: bool,
}

impl FakeLink {
    fn new(fail_remote: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            state,
            tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            closes: AtomicUsize::new(0),
            fail_remote,
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn tracks(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub(crate) fn remote_sdp(&self) -> Option<String> {
        self.remote.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_send_only_track(&self, track: &LiveTrack) -> Result<()> {
        self.tracks.lock().push(track.id().to_string());
        Ok(())
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.fail_remote {
            return Err(AppError::WebRtcError("rejected remote description".to_string()));
        }
        *self.remote.lock() = Some(desc.sdp);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0\r\ns=fake\r\n"))
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    links: Mutex<Vec<Arc<FakeLink>>>,
    fail_remote: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    pub(crate) fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().last().cloned()
    }

    /// The next link rejects its remote description
    pub(crate) fn fail_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, _viewer_id: &str) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(FakeLink::new(self.fail_remote.swap(false, Ordering::SeqCst)));
        self.links.lock().push(link.clone());
        Ok(link as Arc<dyn PeerLink>)
    }
}

/// Collects outbound signaling events
#[derive(Default)]
pub(crate) struct FakeSignaling {
    emitted: Mutex<Vec<(String, Value)>>,
}

impl FakeSignaling {
    pub(crate) fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().clone()
    }

    /// Payload of the first `event` emitted
    pub(crate) async fn wait_for(&self, event: &str) -> Value {
        let find = || {
            self.emitted
                .lock()
                .iter()
                .find(|(e, _)| e == event)
                .map(|(_, p)| p.clone())
        };
        wait_until(event, || find().is_some()).await;
        find().unwrap_or(Value::Null)
    }
}

#[async_trait]
impl SignalingSink for FakeSignaling {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.emitted.lock().push((event.to_string(), payload));
        Ok(())
    }
}

struct ScriptedConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    written: Arc<Mutex<Vec<String>>>,
}

#[derive(Default)]
struct Script {
    /// `None` entries are failed dials
    queue: Mutex<VecDeque<Option<ScriptedConnection>>>,
    dials: AtomicUsize,
}

/// Dialer that plays back a queue of connections and failures
#[derive(Clone, Default)]
pub(crate) struct ScriptedDialer {
    script: Arc<Script>,
}

impl ScriptedDialer {
    /// Queue a successful dial; the returned remote end feeds and observes it
    pub(crate) fn push_connection(&self) -> ScriptedRemote {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        self.script.queue.lock().push_back(Some(ScriptedConnection {
            inbound: rx,
            written: written.clone(),
        }));
        ScriptedRemote {
            inbound: Mutex::new(Some(tx)),
            written,
        }
    }

    pub(crate) fn push_failure(&self) {
        self.script.queue.lock().push_back(None);
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.script.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    type Reader = ScriptedReader;
    type Writer = ScriptedWriter;

    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn dial(&self) -> Result<(Self::Reader, Self::Writer)> {
        self.script.dials.fetch_add(1, Ordering::SeqCst);
        match self.script.queue.lock().pop_front() {
            Some(Some(conn)) => Ok((
                ScriptedReader {
                    inbound: conn.inbound,
                },
                ScriptedWriter {
                    written: conn.written,
                },
            )),
            _ => Err(AppError::TransportBroken("connection refused".to_string())),
        }
    }
}

pub(crate) struct ScriptedReader {
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameReader for ScriptedReader {
    async fn read_frame(&mut self) -> Result<Option<String>> {
        Ok(self.inbound.recv().await)
    }
}

pub(crate) struct ScriptedWriter {
    written: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FrameWriter for ScriptedWriter {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        self.written.lock().push(frame.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Remote end of a scripted connection
pub(crate) struct ScriptedRemote {
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    written: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRemote {
    pub(crate) fn send(&self, frame: &str) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(frame.to_string());
        }
    }

    /// Close the connection from the remote side
    pub(crate) fn hang_up(&self) {
        self.inbound.lock().take();
    }

    pub(crate) fn written(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    pub(crate) async fn wait_for_written(&self, frames: usize) {
        wait_until("written frames", || self.written.lock().len() >= frames).await;
    }
}
