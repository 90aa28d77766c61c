//! Node orchestration
//!
//! Turns inbound signaling and sensor events into calls on the session
//! registry and the recording controller, and sends the replies the backend
//! expects. Also reacts to [`NodeEvent`]s: closed connections are removed
//! from the registry and the viewer list is re-requested after the
//! signaling link comes back.

pub mod wire;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::events::NodeEvent;
use crate::recording::RecordingController;
use crate::transport::{EventRouter, LinkState, SensorRouter, SignalingSink};
use crate::upload::{spawn_upload, MediaKind, MediaUploader};
use crate::utils::{stamp_file_name, MonotonicStamp};
use crate::video::shared_stream::SharedStream;
use crate::video::snapshot::{take_snapshot, FrameEncoder, SNAPSHOT_TIMEOUT};
use crate::webrtc::session::SessionRegistry;
use crate::webrtc::signaling::{SdpType, SessionDescription};
use wire::*;

/// Recording source driven by the motion sensor
pub const SENSOR_SLOT: &str = "pir-slot";

/// Transport name of the signaling channel
pub const SIGNALING_CHANNEL: &str = "signaling";
/// Transport name of the sensor channel
pub const SENSOR_CHANNEL: &str = "sensor";

/// Where snapshots are encoded, stored and sent
pub struct SnapshotTarget {
    pub encoder: Arc<dyn FrameEncoder>,
    pub uploader: Arc<dyn MediaUploader>,
    pub image_dir: PathBuf,
}

pub struct Orchestrator {
    device_id: String,
    sessions: Arc<SessionRegistry>,
    recordings: Arc<RecordingController>,
    stream: Arc<SharedStream>,
    signaling: Arc<dyn SignalingSink>,
    snapshots: SnapshotTarget,
    shutdown: CancellationToken,
    stamps: Mutex<MonotonicStamp>,
}

impl Orchestrator {
    pub fn new(
        device_id: impl Into<String>,
        sessions: Arc<SessionRegistry>,
        recordings: Arc<RecordingController>,
        stream: Arc<SharedStream>,
        signaling: Arc<dyn SignalingSink>,
        snapshots: SnapshotTarget,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.into(),
            sessions,
            recordings,
            stream,
            signaling,
            snapshots,
            shutdown,
            stamps: Mutex::new(MonotonicStamp::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn recordings(&self) -> &Arc<RecordingController> {
        &self.recordings
    }

    /// Handlers for the signaling channel
    pub fn signaling_router(self: &Arc<Self>) -> EventRouter {
        EventRouter::new()
            .on(USER_CONNECT, self.bind(Self::on_user_connect))
            .on(USER_DISCONNECT, self.bind(Self::on_user_disconnect))
            .on(RESPONSE_LIST_USERS, self.bind(Self::on_list_users))
            .on(OFFER_SD, self.bind(Self::on_offer))
            .on(ICE_CANDIDATE, |_| async {})
            .on(TAKE_IMAGE, self.bind(Self::on_take_image))
            .on(START_RECORD, self.bind(Self::on_start_record))
            .on(STOP_RECORD, self.bind(Self::on_stop_record))
    }

    /// Handlers for the motion sensor channel
    pub fn sensor_router(self: &Arc<Self>, pid: u32) -> SensorRouter {
        let on_motion = self.clone();
        let on_still = self.clone();
        SensorRouter::new(pid)
            .on("PIR", "ok", move |_| {
                let this = on_motion.clone();
                async move { this.motion_started() }
            })
            .on("PIR", "ko", move |_| {
                let this = on_still.clone();
                async move { this.motion_stopped().await }
            })
    }

    fn bind<F, Fut>(self: &Arc<Self>, handler: F) -> impl Fn(Value) -> Fut + Send + Sync + 'static
    where
        F: Fn(Arc<Self>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = self.clone();
        move |payload| handler(this.clone(), payload)
    }

    /// Ask the backend for the viewers already online
    pub async fn announce(&self) {
        if let Err(e) = self.signaling.emit(REQUEST_LIST_USERS, json!({})).await {
            warn!("Failed to request viewer list: {}", e);
        }
    }

    async fn on_user_connect(self: Arc<Self>, payload: Value) {
        let Some(viewer) = parse::<ViewerPayload>(USER_CONNECT, payload) else {
            return;
        };
        self.register(&viewer.uuid);
    }

    async fn on_list_users(self: Arc<Self>, payload: Value) {
        let viewers = if payload.is_null() {
            Vec::new()
        } else {
            match parse::<Vec<ViewerPayload>>(RESPONSE_LIST_USERS, payload) {
                Some(viewers) => viewers,
                None => return,
            }
        };
        info!("Backend reports {} viewer(s) online", viewers.len());
        for viewer in viewers {
            self.register(&viewer.uuid);
        }
    }

    fn register(&self, id: &str) {
        match self.sessions.register(id) {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => debug!("Viewer {} already registered", id),
            Err(e) => warn!("Failed to register viewer {}: {}", id, e),
        }
    }

    async fn on_user_disconnect(self: Arc<Self>, payload: Value) {
        let Some(viewer) = parse::<ViewerPayload>(USER_DISCONNECT, payload) else {
            return;
        };
        info!("Viewer {} disconnected", viewer.uuid);

        match self.sessions.deregister(&viewer.uuid).await {
            Ok(_) => {}
            Err(AppError::NotFound(_)) => {
                // A viewer may record without ever having been registered
                match self.recordings.stop_and_upload(&viewer.uuid).await {
                    Ok(finished) => {
                        info!("Video saved in {}", finished.path.display())
                    }
                    Err(AppError::NotRecording(_)) => {
                        debug!("Viewer {} was not registered", viewer.uuid)
                    }
                    Err(e) => warn!("Failed to stop recording of {}: {}", viewer.uuid, e),
                }
            }
            Err(e) => warn!("Failed to deregister {}: {}", viewer.uuid, e),
        }
    }

    async fn on_offer(self: Arc<Self>, payload: Value) {
        let Some(offer) = parse::<OfferPayload>(OFFER_SD, payload) else {
            return;
        };
        if offer.sdp_type != SdpType::Offer {
            warn!(
                "Ignoring {} description from {}, expected an offer",
                offer.sdp_type, offer.from
            );
            return;
        }

        let description = SessionDescription {
            sdp_type: offer.sdp_type,
            sdp: offer.sdp,
        };
        let answer = match self.sessions.answer(&offer.from, description).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to answer offer from {}: {}", offer.from, e);
                return;
            }
        };

        let reply = AnswerPayload {
            uuid: self.device_id.clone(),
            to: offer.from.clone(),
            sdp_type: answer.sdp_type,
            sdp: answer.sdp,
        };
        match serde_json::to_value(reply) {
            Ok(value) => {
                if let Err(e) = self.signaling.emit(ANSWER_SD, value).await {
                    warn!("Failed to send answer to {}: {}", offer.from, e);
                }
            }
            Err(e) => error!("Failed to encode answer: {}", e),
        }
    }

    async fn on_take_image(self: Arc<Self>, _payload: Value) {
        info!("Take image requested");
        self.take_image();
    }

    /// Capture a still in the background and upload it
    pub fn take_image(&self) -> JoinHandle<Result<PathBuf>> {
        let name = stamp_file_name(self.stamps.lock().next(), "jpeg");
        let dest = self.snapshots.image_dir.join(name);
        let stream = self.stream.clone();
        let encoder = self.snapshots.encoder.clone();
        let uploader = self.snapshots.uploader.clone();

        tokio::spawn(async move {
            if let Err(e) = take_snapshot(&stream, encoder.as_ref(), &dest, SNAPSHOT_TIMEOUT).await {
                warn!("Snapshot failed: {}", e);
                return Err(e);
            }
            match spawn_upload(uploader, MediaKind::Image, dest.clone()).await {
                Ok(result) => result?,
                Err(e) => return Err(AppError::Internal(format!("Upload task failed: {}", e))),
            }
            Ok(dest)
        })
    }

    async fn on_start_record(self: Arc<Self>, payload: Value) {
        let Some(request) = parse::<RecordPayload>(START_RECORD, payload) else {
            return;
        };

        match self.recordings.start(&request.from) {
            Ok(_) => {}
            Err(AppError::AlreadyRecording(_)) => {
                info!("Viewer {} is already recording", request.from);
                let payload = json!({ "uuid": request.from });
                if let Err(e) = self.signaling.emit(ALREADY_RECORDED, payload).await {
                    warn!("Failed to report duplicate recording: {}", e);
                }
            }
            Err(e) => warn!("Failed to start recording for {}: {}", request.from, e),
        }
    }

    async fn on_stop_record(self: Arc<Self>, payload: Value) {
        let Some(request) = parse::<RecordPayload>(STOP_RECORD, payload) else {
            return;
        };
        self.stop_record(&request.from).await;
    }

    /// Stop a viewer's recording; once uploaded, tell the viewer
    ///
    /// Returns the task that waits for the upload, if one was started.
    pub async fn stop_record(&self, viewer_id: &str) -> Option<JoinHandle<()>> {
        let finished = match self.recordings.stop_and_upload(viewer_id).await {
            Ok(finished) => finished,
            Err(AppError::NotRecording(_)) => {
                debug!("Stop record from {} without a recording", viewer_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to stop recording for {}: {}", viewer_id, e);
                return None;
            }
        };
        info!("Video saved in {}", finished.path.display());

        let upload = finished.upload?;
        let signaling = self.signaling.clone();
        let payload = VideoRecordedPayload {
            to: viewer_id.to_string(),
            from: self.device_id.clone(),
        };
        Some(tokio::spawn(async move {
            match upload.await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return,
                Err(e) => {
                    error!("Upload task failed: {}", e);
                    return;
                }
            }
            let value = match serde_json::to_value(&payload) {
                Ok(value) => value,
                Err(e) => {
                    error!("Failed to encode recording notice: {}", e);
                    return;
                }
            };
            if let Err(e) = signaling.emit(VIDEO_RECORDED, value).await {
                warn!("Failed to notify {} of recorded video: {}", payload.to, e);
            }
        }))
    }

    fn motion_started(&self) {
        match self.recordings.start(SENSOR_SLOT) {
            Ok(path) => info!("Motion detected, recording to {}", path.display()),
            Err(AppError::AlreadyRecording(_)) => debug!("Motion recording already running"),
            Err(e) => warn!("Failed to start motion recording: {}", e),
        }
    }

    async fn motion_stopped(&self) {
        match self.recordings.stop_and_upload(SENSOR_SLOT).await {
            Ok(finished) => info!("Motion ended, video saved in {}", finished.path.display()),
            Err(AppError::NotRecording(_)) => debug!("Motion ended without a recording"),
            Err(e) => warn!("Failed to stop motion recording: {}", e),
        }
    }

    /// React to node events until shutdown
    ///
    /// Subscribe before spawning anything that publishes.
    pub async fn run_event_loop(self: Arc<Self>, mut events: broadcast::Receiver<NodeEvent>) {
        let mut signaling_down = false;
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(NodeEvent::ConnectionClosed {
                    viewer_id,
                    generation,
                }) => {
                    self.sessions.remove_closed(&viewer_id, generation);
                }
                Ok(NodeEvent::TransportStateChanged { channel, state })
                    if channel == SIGNALING_CHANNEL =>
                {
                    match state {
                        LinkState::Reconnecting => signaling_down = true,
                        LinkState::Connected if signaling_down => {
                            signaling_down = false;
                            info!("Signaling restored, requesting viewer list");
                            self.announce().await;
                        }
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Event loop missed {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Event loop stopped");
    }

    /// Finish recordings and close every viewer connection
    pub async fn shutdown(&self) {
        self.recordings.stop_all().await;
        info!("Recordings stopped");
        self.sessions.close_all().await;
        info!("Viewer connections closed");
    }
}

fn parse<T: DeserializeOwned>(event: &str, payload: Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("[{}] invalid payload: {}", event, e);
            None
        }
    }
}
