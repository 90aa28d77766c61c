//! Node event types
//!
//! Events published on the [`EventBus`](super::EventBus) by connection
//! observers, the recording controller and the transports.

use std::path::PathBuf;

use crate::transport::LinkState;
use crate::webrtc::signaling::ConnectionState;

/// Node event
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// Peer connection state changed
    ConnectionStateChanged {
        viewer_id: String,
        state: ConnectionState,
    },

    /// Peer connection reached its terminal state and gave back its
    /// camera reference
    ConnectionClosed {
        viewer_id: String,
        /// Negotiation the connection belonged to
        generation: u64,
    },

    /// The outgoing track stopped before the connection closed
    TrackEnded { viewer_id: String },

    RecordingStarted { source: String, path: PathBuf },

    RecordingFinished {
        source: String,
        path: PathBuf,
        /// Frames written, 0 when no key frame ever arrived
        frames: u64,
    },

    /// A transport link went up or down
    TransportStateChanged { channel: String, state: LinkState },
}
