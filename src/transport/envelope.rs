//! Signaling envelope codec and event dispatch
//!
//! Inbound frames are `{"event": E, "payload": P}`. Outbound frames wrap the
//! same shape once more: `{"event": "message", "data": {"event": E,
//! "payload": P}}`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, warn};

use super::FrameHandler;
use crate::error::{AppError, Result};

/// Outer event name of every outbound frame
const OUTBOUND_EVENT: &str = "message";

/// Event frame as received from the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    event: &'static str,
    data: OutboundData<'a>,
}

#[derive(Serialize)]
struct OutboundData<'a> {
    event: &'a str,
    payload: Value,
}

/// Encode an outbound event frame
pub fn encode_event(event: &str, payload: Value) -> Result<String> {
    Ok(serde_json::to_string(&OutboundEnvelope {
        event: OUTBOUND_EVENT,
        data: OutboundData { event, payload },
    })?)
}

/// Decode an inbound event frame
pub fn decode_event(frame: &str) -> Result<InboundEnvelope> {
    serde_json::from_str(frame)
        .map_err(|e| AppError::Protocol(format!("Invalid event envelope: {}", e)))
}

type EventCallback = Box<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Maps event names to async callbacks
///
/// Callbacks run one at a time in frame order; each sees only its payload.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, EventCallback>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback for `event`, replacing any previous one
    pub fn on<F, Fut>(mut self, event: &str, callback: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            event.to_string(),
            Box::new(move |payload| Box::pin(callback(payload))),
        );
        self
    }

    /// Run the callback for `envelope`; `false` when none is registered
    pub async fn dispatch(&self, envelope: InboundEnvelope) -> bool {
        match self.handlers.get(&envelope.event) {
            Some(callback) => {
                debug!("Dispatching event [{}]", envelope.event);
                callback(envelope.payload).await;
                true
            }
            None => {
                debug!(
                    "Received event [{}]: {}",
                    envelope.event, envelope.payload
                );
                false
            }
        }
    }
}

#[async_trait]
impl FrameHandler for EventRouter {
    async fn handle_frame(&self, frame: String) -> Option<String> {
        match decode_event(&frame) {
            Ok(envelope) => {
                self.dispatch(envelope).await;
            }
            Err(e) => warn!("Dropping frame: {}", e),
        }
        None
    }
}
