//! WebRTC viewer sessions
//!
//! - [`signaling`]: wire types for offers, answers and candidates
//! - [`peer`]: peer connection engine (webrtc-rs)
//! - [`session`]: per-viewer negotiation state machine

pub mod config;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{TurnServer, WebRtcConfig};
pub use peer::{PeerConnector, PeerLink, WebRtcConnector};
pub use session::{SessionRegistry, SessionState};
pub use signaling::{ConnectionState, SdpType, SessionDescription};
