//! Peer connection engine
//!
//! [`PeerConnector`] creates one [`PeerLink`] per viewer. The webrtc-rs
//! implementation answers offers non-trickle: the answer is returned only
//! after ICE gathering finished, so it carries every local candidate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};

use super::config::WebRtcConfig;
use super::signaling::{ConnectionState, SdpType, SessionDescription};
use crate::error::{AppError, Result};
use crate::video::capture::LiveTrack;

/// One viewer's peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach an outgoing track as send-only
    async fn add_send_only_track(&self, track: &LiveTrack) -> Result<()>;

    /// Connection state updates
    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Create and apply the local answer, then wait for candidate gathering
    /// to finish; returns the final local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Close the connection; the state moves to `Closed`
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, viewer_id: &str) -> Result<Arc<dyn PeerLink>>;
}

/// webrtc-rs backed connector
pub struct WebRtcConnector {
    config: WebRtcConfig,
}

impl WebRtcConnector {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// Dynamic payload type offered for VP8
const VP8_PAYLOAD_TYPE: u8 = 96;

/// Media engine that only knows the codec the camera produces
fn vp8_media_engine() -> Result<MediaEngine> {
    let feedback = |typ: &str, parameter: &str| RTCPFeedback {
        typ: typ.to_owned(),
        parameter: parameter.to_owned(),
    };

    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![
                        feedback("goog-remb", ""),
                        feedback("ccm", "fir"),
                        feedback("nack", ""),
                        feedback("nack", "pli"),
                    ],
                },
                payload_type: VP8_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| AppError::WebRtcError(format!("Failed to register VP8: {}", e)))?;
    Ok(media_engine)
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, viewer_id: &str) -> Result<Arc<dyn PeerLink>> {
        let mut media_engine = vp8_media_engine()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = WebRtcPeer::new(
            viewer_id.to_string(),
            Arc::new(pc),
            Duration::from_millis(self.config.gathering_timeout_ms),
        );
        Ok(Arc::new(peer))
    }
}

/// Peer connection wrapper publishing its state on a watch channel
pub struct WebRtcPeer {
    viewer_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    gathering_timeout: Duration,
}

impl WebRtcPeer {
    fn new(viewer_id: String, pc: Arc<RTCPeerConnection>, gathering_timeout: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let peer = Self {
            viewer_id,
            pc,
            state: Arc::new(state_tx),
            state_rx,
            gathering_timeout,
        };
        peer.setup_event_handlers();
        peer
    }

    fn setup_event_handlers(&self) {
        let state = self.state.clone();
        let viewer_id = self.viewer_id.clone();

        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let viewer_id = viewer_id.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!("Peer {} connection state: {}", viewer_id, new_state);
                    let _ = state.send(new_state);
                })
            }));
    }
}

#[async_trait]
impl PeerLink for WebRtcPeer {
    async fn add_send_only_track(&self, track: &LiveTrack) -> Result<()> {
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                track.local(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add track: {}", e)))?;

        // RTCP has to be read for the interceptors (NACK, reports) to run
        let sender = transceiver.sender().await;
        let viewer_id = self.viewer_id.clone();
        tokio::spawn(async move {
            while sender.read_rtcp().await.is_ok() {}
            debug!("RTCP reader for {} stopped", viewer_id);
        });

        debug!("Peer {}: added send-only track {}", self.viewer_id, track.id());
        Ok(())
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let sdp = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(AppError::WebRtcError(
                    "Rollback is not supported".to_string(),
                ))
            }
        }
        .map_err(|e| AppError::WebRtcError(format!("Invalid SDP: {}", e)))?;

        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gathering_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "Peer {}: ICE gathering not complete after {:?}, answering with partial candidates",
                self.viewer_id, self.gathering_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("Local description unavailable".to_string()))?;

        let sdp_type = match local.sdp_type {
            RTCSdpType::Pranswer => SdpType::Pranswer,
            _ => SdpType::Answer,
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: local.sdp,
        })
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)));
        let _ = self.state.send(ConnectionState::Closed);
        info!("Peer {} closed", self.viewer_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_media_engine_offers_only_vp8() {
        let api = APIBuilder::new()
            .with_media_engine(vp8_media_engine().unwrap())
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();

        let offer = pc.create_offer(None).await.unwrap();
        assert!(offer.sdp.contains("VP8/90000"));
        assert!(!offer.sdp.contains("VP9"));
        assert!(!offer.sdp.contains("H264"));
        pc.close().await.unwrap();
    }
}
