//! Recording task lifecycle
//!
//! One background task per recording source. Each task holds a camera
//! reference for its whole life, opens its container on the first key frame
//! (the frame size is only known from the bitstream) and runs until its stop
//! token fires. `stop` joins the task, so the file is finalized when it
//! returns.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::container::{ContainerFactory, ContainerWriter};
use crate::error::{AppError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::upload::{spawn_upload, MediaKind, MediaUploader};
use crate::utils::{stamp_file_name, MonotonicStamp};
use crate::video::capture::EncodedSample;
use crate::video::shared_stream::{SharedStream, StreamLease};
use crate::video::vp8;

struct RecordingTask {
    stop: CancellationToken,
    path: PathBuf,
    started_at: Instant,
    handle: JoinHandle<Result<u64>>,
}

#[derive(Default)]
struct RecordingTable {
    tasks: HashMap<String, RecordingTask>,
    stamps: MonotonicStamp,
}

/// A recording that was stopped and handed to the uploader
#[derive(Debug)]
pub struct FinishedRecording {
    pub path: PathBuf,
    /// Background upload, `None` when nothing was written
    pub upload: Option<JoinHandle<Result<()>>>,
}

/// Starts and stops recordings, keyed by source id
pub struct RecordingController {
    stream: Arc<SharedStream>,
    containers: Arc<dyn ContainerFactory>,
    uploader: Arc<dyn MediaUploader>,
    events: Arc<EventBus>,
    video_dir: PathBuf,
    /// Parent of every per-task stop token
    shutdown: CancellationToken,
    table: Mutex<RecordingTable>,
}

impl RecordingController {
    pub fn new(
        stream: Arc<SharedStream>,
        containers: Arc<dyn ContainerFactory>,
        uploader: Arc<dyn MediaUploader>,
        events: Arc<EventBus>,
        video_dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            containers,
            uploader,
            events,
            video_dir,
            shutdown,
            table: Mutex::new(RecordingTable::default()),
        }
    }

    /// Start recording for `id`, returning the destination path
    ///
    /// A second start for the same id reports `AlreadyRecording` and changes
    /// nothing, unless the earlier task already ended on its own (camera
    /// lost); that task is finalized and uploaded in the background and a new
    /// one takes the slot.
    pub fn start(&self, id: &str) -> Result<PathBuf> {
        let mut table = self.table.lock();
        let ended = match table.tasks.get(id) {
            Some(task) if !task.handle.is_finished() => {
                return Err(AppError::AlreadyRecording(id.to_string()))
            }
            Some(_) => true,
            None => false,
        };
        let stale = if ended { table.tasks.remove(id) } else { None };

        let lease = match self.stream.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                drop(table);
                self.finalize_stale(id, stale);
                return Err(e);
            }
        };
        let path = self
            .video_dir
            .join(stamp_file_name(table.stamps.next(), self.containers.extension()));
        let stop = self.shutdown.child_token();
        let samples = lease.handle().subscribe();

        let handle = tokio::spawn(record(
            id.to_string(),
            path.clone(),
            samples,
            self.containers.clone(),
            stop.clone(),
            lease,
        ));

        table.tasks.insert(
            id.to_string(),
            RecordingTask {
                stop,
                path: path.clone(),
                started_at: Instant::now(),
                handle,
            },
        );
        drop(table);
        self.finalize_stale(id, stale);

        info!("Recording {} started: {}", id, path.display());
        self.events.publish(NodeEvent::RecordingStarted {
            source: id.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }

    fn finalize_stale(&self, id: &str, stale: Option<RecordingTask>) {
        let Some(task) = stale else {
            return;
        };
        warn!(
            "Recording {} had already ended, finalizing {}",
            id,
            task.path.display()
        );
        let id = id.to_string();
        let events = self.events.clone();
        let uploader = self.uploader.clone();
        tokio::spawn(async move {
            let path = settle(&id, task, &events).await;
            if let Some(upload) = upload_if_written(uploader, &id, path).await {
                let _ = upload.await;
            }
        });
    }

    /// Stop recording for `id` and wait until the file is finalized
    pub async fn stop(&self, id: &str) -> Result<PathBuf> {
        let task = self
            .table
            .lock()
            .tasks
            .remove(id)
            .ok_or_else(|| AppError::NotRecording(id.to_string()))?;

        Ok(settle(id, task, &self.events).await)
    }

    /// Stop recording for `id` and upload the result in the background
    pub async fn stop_and_upload(&self, id: &str) -> Result<FinishedRecording> {
        let path = self.stop(id).await?;
        let upload = upload_if_written(self.uploader.clone(), id, path.clone()).await;
        Ok(FinishedRecording { path, upload })
    }

    /// Stop every recording without uploading (process shutdown)
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.table.lock().tasks.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                debug!("Recording {} already gone: {}", id, e);
            }
        }
    }

    /// Whether a live recording task exists for `id`
    pub fn is_recording(&self, id: &str) -> bool {
        self.table
            .lock()
            .tasks
            .get(id)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Ids with an active recording
    pub fn active(&self) -> Vec<String> {
        self.table.lock().tasks.keys().cloned().collect()
    }

    /// Destination paths of active recordings
    pub fn active_paths(&self) -> HashSet<PathBuf> {
        self.table
            .lock()
            .tasks
            .values()
            .map(|t| t.path.clone())
            .collect()
    }
}

/// Cancel and join a removed task, then announce the finished file
async fn settle(id: &str, task: RecordingTask, events: &EventBus) -> PathBuf {
    task.stop.cancel();
    let frames = match task.handle.await {
        Ok(Ok(frames)) => frames,
        Ok(Err(e)) => {
            warn!("Recording {} ended with error: {}", id, e);
            0
        }
        Err(e) => {
            error!("Recording {} task failed: {}", id, e);
            0
        }
    };

    info!(
        "Recording {} stopped after {:.1}s ({} frames): {}",
        id,
        task.started_at.elapsed().as_secs_f32(),
        frames,
        task.path.display()
    );
    events.publish(NodeEvent::RecordingFinished {
        source: id.to_string(),
        path: task.path.clone(),
        frames,
    });
    task.path
}

async fn upload_if_written(
    uploader: Arc<dyn MediaUploader>,
    id: &str,
    path: PathBuf,
) -> Option<JoinHandle<Result<()>>> {
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        Some(spawn_upload(uploader, MediaKind::Video, path))
    } else {
        warn!("Recording {} produced no file, skipping upload", id);
        None
    }
}

/// Recording task body; returns the number of frames written
async fn record(
    id: String,
    path: PathBuf,
    mut samples: tokio::sync::broadcast::Receiver<EncodedSample>,
    containers: Arc<dyn ContainerFactory>,
    stop: CancellationToken,
    lease: StreamLease,
) -> Result<u64> {
    let ended = lease.handle().ended();
    let mut writer: Option<Box<dyn ContainerWriter>> = None;
    let mut elapsed = Duration::ZERO;
    let mut frames = 0u64;

    let outcome: Result<()> = loop {
        let sample = tokio::select! {
            biased;
            _ = stop.cancelled() => break Ok(()),
            _ = ended.cancelled() => {
                warn!("Recording {}: camera stopped producing", id);
                break Ok(());
            }
            received = samples.recv() => match received {
                Ok(sample) => sample,
                Err(RecvError::Lagged(n)) => {
                    warn!("Recording {} dropped {} samples", id, n);
                    continue;
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        };

        if writer.is_none() {
            let Some((width, height)) = vp8::keyframe_dimensions(&sample.data) else {
                continue;
            };
            match containers.open(&path, width, height).await {
                Ok(opened) => {
                    debug!("Recording {}: writer opened at {}x{}", id, width, height);
                    writer = Some(opened);
                }
                Err(e) => break Err(e),
            }
        }

        if let Some(out) = writer.as_mut() {
            if let Err(e) = out.append(&sample.data, sample.is_keyframe, elapsed).await {
                break Err(e);
            }
            elapsed += sample.duration;
            frames += 1;
        }
    };

    if let Some(out) = writer {
        if let Err(e) = out.finish().await {
            warn!("Recording {}: failed to finalize {}: {}", id, path.display(), e);
        }
    }
    lease.release();

    outcome.map(|_| frames)
}
