//! Motion sensor channel protocol
//!
//! Frames are plain text. `HANDSHAKE` must be answered with
//! `HANDSHAKE <pid>`; anything else is `<category> <action> [param]`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, warn};

use super::FrameHandler;

pub const HANDSHAKE_TOKEN: &str = "HANDSHAKE";

/// A parsed sensor frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorFrame {
    Handshake,
    Command {
        category: String,
        action: String,
        /// Empty when absent
        param: String,
    },
    /// Fewer than two words
    Unparsed(String),
}

/// Parse one frame
pub fn parse_frame(frame: &str) -> SensorFrame {
    if frame == HANDSHAKE_TOKEN {
        return SensorFrame::Handshake;
    }

    let mut parts = frame.splitn(3, ' ');
    match (parts.next(), parts.next()) {
        (Some(category), Some(action)) => SensorFrame::Command {
            category: category.to_string(),
            action: action.to_string(),
            param: parts.next().unwrap_or_default().to_string(),
        },
        _ => SensorFrame::Unparsed(frame.to_string()),
    }
}

/// Reply to a handshake
pub fn handshake_reply(pid: u32) -> String {
    format!("{} {}", HANDSHAKE_TOKEN, pid)
}

type SensorCallback = Box<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatches sensor commands by `(category, action)`
pub struct SensorRouter {
    pid: u32,
    handlers: HashMap<(String, String), SensorCallback>,
}

impl SensorRouter {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            handlers: HashMap::new(),
        }
    }

    /// Register the callback for `category action`; it receives the param
    pub fn on<F, Fut>(mut self, category: &str, action: &str, callback: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(
            (category.to_string(), action.to_string()),
            Box::new(move |param| Box::pin(callback(param))),
        );
        self
    }
}

#[async_trait]
impl FrameHandler for SensorRouter {
    async fn handle_frame(&self, frame: String) -> Option<String> {
        match parse_frame(&frame) {
            SensorFrame::Handshake => {
                info!("Sensor handshake, answering with pid {}", self.pid);
                Some(handshake_reply(self.pid))
            }
            SensorFrame::Command {
                category,
                action,
                param,
            } => {
                match self.handlers.get(&(category.clone(), action.clone())) {
                    Some(callback) => {
                        debug!("Sensor command {} {}", category, action);
                        callback(param).await;
                    }
                    None => warn!("Unknown sensor command {} {}", category, action),
                }
                None
            }
            SensorFrame::Unparsed(text) => {
                info!("Sensor: {}", text);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_parse_frame() {
        assert_eq!(parse_frame("HANDSHAKE"), SensorFrame::Handshake);
        assert_eq!(
            parse_frame("PIR ok"),
            SensorFrame::Command {
                category: "PIR".into(),
                action: "ok".into(),
                param: String::new(),
            }
        );
        assert_eq!(
            parse_frame("LED set on and off"),
            SensorFrame::Command {
                category: "LED".into(),
                action: "set".into(),
                param: "on and off".into(),
            }
        );
        assert_eq!(parse_frame("hello"), SensorFrame::Unparsed("hello".into()));
        assert_eq!(parse_frame("HANDSHAKE 12"), SensorFrame::Command {
            category: "HANDSHAKE".into(),
            action: "12".into(),
            param: String::new(),
        });
    }

    #[test]
    fn test_outbound_formats() {
        assert_eq!(handshake_reply(4242), "HANDSHAKE 4242");
    }

    #[tokio::test]
    async fn test_router() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let router = {
            let on = calls.clone();
            let off = calls.clone();
            SensorRouter::new(99)
                .on("PIR", "ok", move |_| {
                    let calls = on.clone();
                    async move { calls.lock().push("start") }
                })
                .on("PIR", "ko", move |_| {
                    let calls = off.clone();
                    async move { calls.lock().push("stop") }
                })
        };

        assert_eq!(
            router.handle_frame("HANDSHAKE".into()).await.as_deref(),
            Some("HANDSHAKE 99")
        );
        assert!(router.handle_frame("PIR ok".into()).await.is_none());
        assert!(router.handle_frame("PIR maybe".into()).await.is_none());
        assert!(router.handle_frame("PIR ko".into()).await.is_none());
        assert_eq!(*calls.lock(), vec!["start", "stop"]);
    }
}
