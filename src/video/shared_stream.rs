//! Reference-counted gate around the camera
//!
//! The camera is a single exclusive resource shared by live viewers and
//! recorders. Every user takes a [`StreamLease`]; the device is opened by the
//! first lease and closed when the last one is released.
//!
//! ```text
//!  SessionRegistry ──acquire──┐
//!                             v
//!  RecordingController ──> SharedStream ──open/close──> CaptureDevice
//!                             ^
//!  take_snapshot ─────acquire─┘
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::capture::{CaptureConfig, CaptureDevice, CaptureHandle, LiveTrack};
use crate::error::{AppError, Result};

struct StreamState {
    ref_count: usize,
    /// `Some` exactly when `ref_count > 0`
    handle: Option<CaptureHandle>,
}

/// Lazily opened, reference-counted camera handle
pub struct SharedStream {
    device: Arc<dyn CaptureDevice>,
    config: CaptureConfig,
    state: Mutex<StreamState>,
}

impl SharedStream {
    pub fn new(device: Arc<dyn CaptureDevice>, config: CaptureConfig) -> Arc<Self> {
        Arc::new(Self {
            device,
            config,
            state: Mutex::new(StreamState {
                ref_count: 0,
                handle: None,
            }),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Take one reference, opening the camera on the first one
    ///
    /// On open failure the count is rolled back and the camera stays closed.
    pub fn acquire(self: &Arc<Self>) -> Result<StreamLease> {
        let mut state = self.state.lock();
        state.ref_count += 1;

        let live = state.handle.clone().filter(|h| !h.is_ended());
        let handle = match live {
            Some(handle) => handle,
            None => match self.device.open(&self.config) {
                Ok(handle) => {
                    match state.handle.replace(handle.clone()) {
                        Some(lost) => {
                            warn!("Camera stopped producing, reopened");
                            lost.close();
                        }
                        None => info!(
                            "Camera opened ({} {} @ {} kbps)",
                            self.config.resolution,
                            self.config.pixel_format,
                            self.config.bitrate_kbps
                        ),
                    }
                    handle
                }
                Err(e) => {
                    state.ref_count -= 1;
                    let reason = match e {
                        AppError::ResourceUnavailable(reason) => reason,
                        other => other.to_string(),
                    };
                    return Err(AppError::ResourceUnavailable(reason));
                }
            },
        };

        debug!("Camera acquired (refs: {})", state.ref_count);
        Ok(StreamLease {
            stream: self.clone(),
            handle,
            released: AtomicBool::new(false),
        })
    }

    /// Drop one reference, closing the camera when none remain
    ///
    /// Releasing with no outstanding references is a caller bug; it is
    /// logged and the count stays at zero.
    pub(crate) fn release(&self) {
        let closing = {
            let mut state = self.state.lock();
            if state.ref_count == 0 {
                warn!("Camera released with no outstanding references");
                return;
            }
            state.ref_count -= 1;
            debug!("Camera released (refs: {})", state.ref_count);
            if state.ref_count == 0 {
                state.handle.take()
            } else {
                None
            }
        };

        if let Some(handle) = closing {
            handle.close();
            info!("Camera closed, no more users");
        }
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Tracks exposed by the open capture, empty when closed
    pub fn tracks(&self) -> Vec<Arc<LiveTrack>> {
        self.state
            .lock()
            .handle
            .as_ref()
            .map(|h| h.tracks().to_vec())
            .unwrap_or_default()
    }
}

/// One acquisition of the [`SharedStream`]
///
/// Released at most once: explicitly via [`StreamLease::release`], or on drop.
pub struct StreamLease {
    stream: Arc<SharedStream>,
    handle: CaptureHandle,
    released: AtomicBool,
}

impl StreamLease {
    pub fn handle(&self) -> &CaptureHandle {
        &self.handle
    }

    /// Give the reference back; returns `false` if it was already released
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stream.release();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLease")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCamera;

    fn stream() -> (Arc<SharedStream>, Arc<FakeCamera>) {
        let camera = Arc::new(FakeCamera::new());
        (
            SharedStream::new(camera.clone(), CaptureConfig::default()),
            camera,
        )
    }

    #[test]
    fn test_open_on_first_close_on_last() {
        let (stream, camera) = stream();
        assert!(!stream.is_open());

        let a = stream.acquire().unwrap();
        let b = stream.acquire().unwrap();
        assert_eq!(stream.ref_count(), 2);
        assert_eq!(camera.open_count(), 1);
        assert!(stream.is_open());

        assert!(a.release());
        assert!(stream.is_open());
        assert!(b.release());
        assert_eq!(stream.ref_count(), 0);
        assert!(!stream.is_open());
        assert_eq!(camera.closed_count(), 1);
    }

    #[test]
    fn test_lease_release_is_idempotent() {
        let (stream, _) = stream();
        let keep = stream.acquire().unwrap();
        let lease = stream.acquire().unwrap();

        assert!(lease.release());
        assert!(!lease.release());
        drop(lease);
        assert_eq!(stream.ref_count(), 1);
        drop(keep);
        assert_eq!(stream.ref_count(), 0);
    }

    #[test]
    fn test_release_below_zero_is_clamped() {
        let (stream, camera) = stream();
        stream.release();
        assert_eq!(stream.ref_count(), 0);

        let lease = stream.acquire().unwrap();
        stream.release();
        stream.release();
        assert_eq!(stream.ref_count(), 0);
        assert!(!stream.is_open());
        assert_eq!(camera.closed_count(), 1);
        drop(lease);
        assert_eq!(stream.ref_count(), 0);
    }

    #[test]
    fn test_open_failure_rolls_back() {
        let (stream, camera) = stream();
        camera.fail_next_open();

        let err = stream.acquire().unwrap_err();
        assert!(matches!(err, AppError::ResourceUnavailable(_)));
        assert_eq!(stream.ref_count(), 0);
        assert!(!stream.is_open());

        let lease = stream.acquire().unwrap();
        assert_eq!(stream.ref_count(), 1);
        assert_eq!(camera.open_count(), 1);
        drop(lease);
    }

    #[test]
    fn test_open_iff_referenced_for_any_sequence() {
        let (stream, _) = stream();
        let mut leases = Vec::new();
        // acquire = true, release = false
        let ops = [
            true, true, false, true, false, false, false, true, false, true, true, true, false,
            false, false, false,
        ];

        for op in ops {
            if op {
                leases.push(stream.acquire().unwrap());
            } else if let Some(lease) = leases.pop() {
                lease.release();
            } else {
                stream.release();
            }
            assert_eq!(stream.ref_count(), leases.len());
            assert_eq!(stream.is_open(), stream.ref_count() > 0);
        }
    }

    #[test]
    fn test_tracks_follow_capture() {
        let (stream, _) = stream();
        assert!(stream.tracks().is_empty());
        let lease = stream.acquire().unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(lease.handle().tracks().len(), 1);
        drop(lease);
        assert!(stream.tracks().is_empty());
    }

    #[test]
    fn test_lost_capture_is_reopened() {
        let (stream, camera) = stream();
        let first = stream.acquire().unwrap();
        first.handle().mark_ended();

        let second = stream.acquire().unwrap();
        assert_eq!(camera.open_count(), 2);
        assert_eq!(stream.ref_count(), 2);
        assert!(!second.handle().is_ended());

        drop(first);
        assert!(stream.is_open());
        drop(second);
        assert!(!stream.is_open());
    }
}
