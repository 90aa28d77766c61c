//! pirtc - camera node controller
//!
//! Streams a single camera to remote viewers over WebRTC, records clips on
//! request from the signaling server or from a local motion sensor, and
//! uploads the results to the backend.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recording;
pub mod transport;
pub mod upload;
pub mod utils;
pub mod video;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AppError, Result};
