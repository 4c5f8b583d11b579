use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::RoomError;
use crate::id_types::{PeerId, RoomId};

/// Method names on the signaling channel.
pub mod methods {
    pub const JOIN: &str = "join";
    pub const PEER_ADDED: &str = "peer_added";
    pub const REQUEST_CONNECTION: &str = "request_connection";
    pub const CONNECTION_REQUEST: &str = "connection_request";
    pub const RELAY_ICE_CANDIDATE: &str = "relay_ice_candidate";
    pub const ADD_ICE_CANDIDATE: &str = "add_ice_candidate";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinParams {
    pub room_id: RoomId,
    pub self_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingPeer {
    pub peer_id: PeerId,
    pub self_description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinReply {
    #[serde(default)]
    pub existing_peers: Vec<ExistingPeer>,
}

/// Params of `peer_added`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: PeerId,
    #[serde(default)]
    pub self_description: String,
}

/// Params of both `request_connection` (outbound) and `connection_request` (inbound).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOffer {
    pub peer_id: PeerId,
    #[serde(default)]
    pub self_description: String,
    pub offer: RTCSessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateParams {
    pub peer_id: PeerId,
    pub candidate: RTCIceCandidateInit,
}

/// Reply to `request_connection`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionReply {
    pub answer: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub declined: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ConnectionReply {
    pub fn accepted(answer: RTCSessionDescription) -> Self {
        Self {
            answer: Some(answer),
            declined: false,
        }
    }

    pub fn declined() -> Self {
        Self {
            answer: None,
            declined: true,
        }
    }

    /// Reads a reply. Besides `{answer, declined?}` this accepts a bare
    /// description (`{type: "answer", sdp}`) and `null`, which older peers send
    /// when they answer or decline directly.
    pub fn from_value(value: Value) -> Result<Self, RoomError> {
        match &value {
            Value::Null => return Ok(Self::default()),
            Value::Object(obj) if obj.contains_key("sdp") && !obj.contains_key("answer") => {
                let answer: RTCSessionDescription = serde_json::from_value(value)
                    .map_err(|e| RoomError::Protocol(format!("invalid answer: {}", e)))?;
                return Ok(Self::accepted(answer));
            }
            _ => {}
        }
        serde_json::from_value(value)
            .map_err(|e| RoomError::Protocol(format!("invalid request_connection reply: {}", e)))
    }

    /// The answer, if the remote actually sent one of the right type.
    pub fn into_answer(self) -> Option<RTCSessionDescription> {
        if self.declined {
            return None;
        }
        self.answer.filter(|a| a.sdp_type == RTCSdpType::Answer)
    }
}

/// Decodes params or a reply body, naming the method on failure.
pub fn decode_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Value,
) -> Result<T, RoomError> {
    serde_json::from_value(params)
        .map_err(|e| RoomError::Protocol(format!("invalid {} payload: {}", method, e)))
}
