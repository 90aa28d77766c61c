//! Reconnecting duplex transports
//!
//! Two channels share one implementation:
//!
//! - [`websocket`]: JSON signaling with the backend
//! - [`unix`]: plain-text commands from the local motion sensor daemon
//!
//! A [`ReconnectingTransport`] owns the current connection and a small
//! `Connected`/`Reconnecting`/`Closed` state machine. Its read loop hands
//! every frame to a [`FrameHandler`] in arrival order; when a read fails it
//! drops the connection and redials according to its [`RetryPolicy`].
//! Outbound frames are never buffered: sending while the link is down fails
//! with `TransportBroken`.

pub mod envelope;
pub mod sensor;
pub mod unix;
pub mod websocket;

pub use envelope::{decode_event, encode_event, EventRouter, InboundEnvelope};
pub use sensor::{SensorFrame, SensorRouter};
pub use unix::UnixDialer;
pub use websocket::WsDialer;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::events::{EventBus, NodeEvent};

/// Default delay between redial attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Link state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connection established, frames flow
    Connected,
    /// Connection lost, redialing
    Reconnecting,
    /// Not connected and not trying (before connect, after shutdown)
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Redial policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause after a failed dial
    pub delay: Duration,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_DELAY)
    }
}

/// Read half of a connection
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next text frame; `Ok(None)` when the remote closed the connection
    async fn read_frame(&mut self) -> Result<Option<String>>;
}

/// Write half of a connection
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: &str) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Opens connections for a transport
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    /// Human readable target, safe to log
    fn describe(&self) -> String;

    async fn dial(&self) -> Result<(Self::Reader, Self::Writer)>;
}

/// Consumes inbound frames
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one frame; a returned frame is sent back on the same link
    async fn handle_frame(&self, frame: String) -> Option<String>;
}

/// Outbound signaling events
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()>;
}

/// Duplex connection that redials on failure
pub struct ReconnectingTransport<D: Dialer> {
    name: &'static str,
    dialer: D,
    policy: RetryPolicy,
    reader: Mutex<Option<D::Reader>>,
    writer: Mutex<Option<D::Writer>>,
    state: watch::Sender<LinkState>,
    events: Arc<EventBus>,
}

impl<D: Dialer> ReconnectingTransport<D> {
    pub fn new(name: &'static str, dialer: D, policy: RetryPolicy, events: Arc<EventBus>) -> Self {
        let (state, _) = watch::channel(LinkState::Closed);
        Self {
            name,
            dialer,
            policy,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            state,
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Dial once
    ///
    /// Used at start-up, where a failure is fatal for the caller.
    pub async fn connect(&self) -> Result<()> {
        let (reader, writer) = self.dialer.dial().await?;
        self.install(reader, writer).await;
        info!("[{}] connected to {}", self.name, self.dialer.describe());
        Ok(())
    }

    /// Write one frame on the current connection
    pub async fn send_frame(&self, frame: &str) -> Result<()> {
        let state = self.state();
        if state != LinkState::Connected {
            return Err(AppError::TransportBroken(format!(
                "{} is {}",
                self.name, state
            )));
        }

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| AppError::TransportBroken(format!("{} has no connection", self.name)))?;
        writer.write_frame(frame).await.map_err(|e| {
            warn!("[{}] send failed: {}", self.name, e);
            AppError::TransportBroken(format!("{}: {}", self.name, e))
        })
    }

    /// Read loop
    ///
    /// Dispatches frames to `handler` one at a time, redialing whenever the
    /// connection breaks. Returns after `shutdown` fires (the connection is
    /// closed) or when the retry policy gives up.
    pub async fn listen(&self, handler: &dyn FrameHandler, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let frame = {
                let mut reader = self.reader.lock().await;
                match reader.as_mut() {
                    Some(reader) => tokio::select! {
                        _ = shutdown.cancelled() => break,
                        frame = reader.read_frame() => frame,
                    },
                    None => Err(AppError::TransportBroken("not connected".to_string())),
                }
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Some(reply) = handler.handle_frame(frame).await {
                        if let Err(e) = self.send_frame(&reply).await {
                            debug!("[{}] reply dropped: {}", self.name, e);
                        }
                    }
                    continue;
                }
                Ok(None) => info!("[{}] connection closed by remote", self.name),
                Err(e) => warn!("[{}] read failed: {}", self.name, e),
            }

            if !self.reconnect(shutdown).await {
                break;
            }
        }

        self.close().await;
        if shutdown.is_cancelled() {
            Ok(())
        } else {
            Err(AppError::TransportBroken(format!(
                "{}: gave up reconnecting",
                self.name
            )))
        }
    }

    /// Drop the connection and redial until one succeeds
    ///
    /// Returns `false` when shutdown fired or the policy gave up.
    async fn reconnect(&self, shutdown: &CancellationToken) -> bool {
        self.set_state(LinkState::Reconnecting);
        self.drop_connection().await;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(max) = self.policy.max_attempts {
                if attempt > max {
                    error!("[{}] giving up after {} attempts", self.name, max);
                    return false;
                }
            }

            info!(
                "[{}] trying to reconnect to {} ({})",
                self.name,
                self.dialer.describe(),
                attempt
            );
            let dialed = tokio::select! {
                _ = shutdown.cancelled() => return false,
                dialed = self.dialer.dial() => dialed,
            };

            match dialed {
                Ok((reader, writer)) => {
                    self.install(reader, writer).await;
                    info!("[{}] reconnected after {} attempt(s)", self.name, attempt);
                    return true;
                }
                Err(e) => {
                    warn!("[{}] reconnect attempt {} failed: {}", self.name, attempt, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.policy.delay) => {}
                    }
                }
            }
        }
    }

    /// Close the connection and mark the link `Closed`
    pub async fn close(&self) {
        self.set_state(LinkState::Closed);
        self.drop_connection().await;
    }

    async fn install(&self, reader: D::Reader, writer: D::Writer) {
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.set_state(LinkState::Connected);
    }

    async fn drop_connection(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                debug!("[{}] close failed: {}", self.name, e);
            }
        }
        // The read loop is the only other user of the reader lock
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = None;
        }
    }

    fn set_state(&self, state: LinkState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("[{}] link {}", self.name, state);
            self.events.publish(NodeEvent::TransportStateChanged {
                channel: self.name.to_string(),
                state,
            });
        }
    }
}

#[async_trait]
impl<D: Dialer> SignalingSink for ReconnectingTransport<D> {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        let frame = encode_event(event, payload)?;
        self.send_frame(&frame).await
    }
}
