//! Signaling event names and payloads

use serde::{Deserialize, Serialize};

use crate::webrtc::signaling::SdpType;

// Inbound
pub const USER_CONNECT: &str = "user-connect";
pub const USER_DISCONNECT: &str = "user-disconnect";
pub const RESPONSE_LIST_USERS: &str = "response-list-users";
pub const OFFER_SD: &str = "offer-sd";
pub const ICE_CANDIDATE: &str = "ice-candidate";
pub const TAKE_IMAGE: &str = "take-image";
pub const START_RECORD: &str = "start-record";
pub const STOP_RECORD: &str = "stop-record";

// Outbound
pub const REQUEST_LIST_USERS: &str = "request-list-users";
pub const ANSWER_SD: &str = "answer-sd";
pub const ALREADY_RECORDED: &str = "already-recorded";
pub const VIDEO_RECORDED: &str = "video-recorded";

/// `{uuid}` for user-connect, user-disconnect and list entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerPayload {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfferPayload {
    pub from: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// `{from}` for start-record and stop-record
#[derive(Debug, Clone, Deserialize)]
pub struct RecordPayload {
    pub from: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerPayload {
    /// This camera
    pub uuid: String,
    /// The viewer that sent the offer
    pub to: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoRecordedPayload {
    pub to: String,
    pub from: String,
}
