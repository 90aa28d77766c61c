//! Viewer session registry
//!
//! Tracks every known viewer and drives its negotiation:
//!
//! ```text
//! register ──> Registered ──answer──> Negotiating ──ok──> Connected
//!                  ^                      │                   │
//!                  └────── setup failed ──┘     connection Closed / deregister
//!                                                             v
//!                                                          (removed)
//! ```
//!
//! Each successful `answer` takes one camera reference. It is handed to a
//! connection observer task and given back exactly once, either when the
//! connection reaches `Closed` or earlier if the outgoing track ends.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer::{PeerConnector, PeerLink};
use super::signaling::{ConnectionState, SessionDescription};
use crate::error::{AppError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::recording::{FinishedRecording, RecordingController};
use crate::video::shared_stream::{SharedStream, StreamLease};

/// Negotiation state of a registered viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Known viewer, no connection
    Registered,
    /// Offer received, answer being built
    Negotiating,
    /// Answer sent, connection live
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Registered => write!(f, "registered"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

struct Session {
    state: SessionState,
    connection: Option<Arc<dyn PeerLink>>,
    /// Negotiation this entry belongs to; 0 before the first offer
    generation: u64,
}

/// Registry of viewer sessions
pub struct SessionRegistry {
    connector: Arc<dyn PeerConnector>,
    stream: Arc<SharedStream>,
    recordings: Arc<RecordingController>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
    sessions: Mutex<HashMap<String, Session>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        stream: Arc<SharedStream>,
        recordings: Arc<RecordingController>,
        events: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            stream,
            recordings,
            events,
            shutdown,
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Add a viewer in the `Registered` state
    pub fn register(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(id) {
            return Err(AppError::AlreadyExists(id.to_string()));
        }
        sessions.insert(
            id.to_string(),
            Session {
                state: SessionState::Registered,
                connection: None,
                generation: 0,
            },
        );
        info!("Viewer {} registered ({} total)", id, sessions.len());
        Ok(())
    }

    /// Remove a viewer, closing its connection and finishing its recording
    ///
    /// Returns the finished recording when one was active.
    pub async fn deregister(&self, id: &str) -> Result<Option<FinishedRecording>> {
        let session = self
            .sessions
            .lock()
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("Viewer {}", id)))?;
        info!("Viewer {} deregistered (was {})", id, session.state);

        if let Some(connection) = session.connection {
            if let Err(e) = connection.close().await {
                warn!("Failed to close connection of {}: {}", id, e);
            }
        }

        match self.recordings.stop_and_upload(id).await {
            Ok(finished) => {
                info!(
                    "Stopped recording of departed viewer {}: {}",
                    id,
                    finished.path.display()
                );
                Ok(Some(finished))
            }
            Err(AppError::NotRecording(_)) => Ok(None),
            Err(e) => {
                warn!("Failed to stop recording of {}: {}", id, e);
                Ok(None)
            }
        }
    }

    /// Negotiate a connection for `id` from a remote offer
    ///
    /// Returns the local answer once ICE gathering has completed. On failure
    /// the session is back in `Registered` and no camera reference is held.
    pub async fn answer(&self, id: &str, offer: SessionDescription) -> Result<SessionDescription> {
        let (generation, previous) = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("Viewer {}", id)))?;
            if session.state == SessionState::Negotiating {
                return Err(AppError::InvalidState(format!(
                    "Viewer {} is already negotiating",
                    id
                )));
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            session.state = SessionState::Negotiating;
            session.generation = generation;
            (generation, session.connection.take())
        };

        if let Some(previous) = previous {
            info!("Viewer {} renegotiating, closing previous connection", id);
            if let Err(e) = previous.close().await {
                warn!("Failed to close previous connection of {}: {}", id, e);
            }
        }

        let lease = match self.stream.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                self.revert(id, generation);
                return Err(e);
            }
        };

        let link = match self.connector.connect(id).await {
            Ok(link) => link,
            Err(e) => {
                self.revert(id, generation);
                return Err(e);
            }
        };

        let answer = match Self::negotiate(link.as_ref(), &lease, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(close_err) = link.close().await {
                    debug!("Failed to close half-built connection of {}: {}", id, close_err);
                }
                self.revert(id, generation);
                return Err(e);
            }
        };

        let stored = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(id) {
                Some(session) if session.generation == generation => {
                    session.state = SessionState::Connected;
                    session.connection = Some(link.clone());
                    true
                }
                _ => false,
            }
        };

        if !stored {
            if let Err(e) = link.close().await {
                debug!("Failed to close orphaned connection of {}: {}", id, e);
            }
            return Err(AppError::NotFound(format!(
                "Viewer {} left during negotiation",
                id
            )));
        }

        tokio::spawn(observe_connection(
            id.to_string(),
            generation,
            link,
            lease,
            self.events.clone(),
            self.shutdown.clone(),
        ));

        info!("Viewer {} connected (negotiation {})", id, generation);
        Ok(answer)
    }

    async fn negotiate(
        link: &dyn PeerLink,
        lease: &StreamLease,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        for track in lease.handle().tracks() {
            link.add_send_only_track(track).await?;
        }
        link.set_remote_description(offer).await?;
        link.create_answer().await
    }

    /// Put a failed negotiation back to `Registered`
    fn revert(&self, id: &str, generation: u64) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(id) {
            if session.generation == generation {
                session.state = SessionState::Registered;
                session.connection = None;
            }
        }
    }

    /// Drop the session whose connection of `generation` has closed
    ///
    /// Newer negotiations and re-registered viewers are left alone.
    pub fn remove_closed(&self, id: &str, generation: u64) -> bool {
        let mut sessions = self.sessions.lock();
        let matches = sessions
            .get(id)
            .map(|s| s.generation == generation && s.state == SessionState::Connected)
            .unwrap_or(false);
        if matches {
            sessions.remove(id);
            info!("Viewer {} removed after connection closed", id);
        }
        matches
    }

    /// Close every connection and forget all viewers (process shutdown)
    pub async fn close_all(&self) {
        let drained: Vec<(String, Session)> = self.sessions.lock().drain().collect();
        for (id, session) in drained {
            if let Some(connection) = session.connection {
                if let Err(e) = connection.close().await {
                    warn!("Failed to close connection of {}: {}", id, e);
                }
            }
        }
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.lock().get(id).map(|s| s.state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Watch one connection until it closes, then give its camera reference back
async fn observe_connection(
    viewer_id: String,
    generation: u64,
    link: Arc<dyn PeerLink>,
    lease: StreamLease,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    let mut state_rx = link.state_watch();
    let track_ended = lease.handle().ended();
    let mut last_state: Option<ConnectionState> = None;
    let mut closing = false;

    loop {
        let state = *state_rx.borrow_and_update();
        if last_state != Some(state) {
            last_state = Some(state);
            events.publish(NodeEvent::ConnectionStateChanged {
                viewer_id: viewer_id.clone(),
                state,
            });
        }

        if state == ConnectionState::Closed {
            break;
        }
        if state.is_broken() && !closing {
            closing = true;
            info!("Viewer {} connection {}, closing", viewer_id, state);
            if let Err(e) = link.close().await {
                warn!("Failed to close connection of {}: {}", viewer_id, e);
            }
            continue;
        }

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    debug!("Viewer {} state channel dropped", viewer_id);
                    break;
                }
            }
            _ = track_ended.cancelled(), if !lease.is_released() => {
                if lease.release() {
                    warn!("Viewer {} track ended, camera reference released", viewer_id);
                    events.publish(NodeEvent::TrackEnded {
                        viewer_id: viewer_id.clone(),
                    });
                }
            }
            _ = shutdown.cancelled(), if !closing => {
                closing = true;
                if let Err(e) = link.close().await {
                    debug!("Failed to close connection of {}: {}", viewer_id, e);
                }
            }
        }
    }

    if lease.release() {
        debug!("Viewer {} camera reference released", viewer_id);
    }
    events.publish(NodeEvent::ConnectionClosed {
        viewer_id,
        generation,
    });
}
