use std::time::Duration;
use thiserror::Error;

use crate::id_types::PeerId;
use crate::media::MediaKind;

/// Failure of the duplex message channel to the relay.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to signaling server: {0}")]
    Connect(String),
    #[error("signaling transport failed: {0}")]
    Failed(String),
    #[error("signaling transport is closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("call to '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("transport closed before a response arrived")]
    TransportClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cannot register handler for '{0}': message handling already started")]
    HandlersSealed(String),
    #[error("no handler registered for method '{0}'")]
    NoHandler(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("remote returned an error: {0}")]
    Remote(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("local media unavailable: {0}")]
    LocalMedia(String),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no {kind} device with id '{device_id}'")]
    DeviceNotFound { kind: MediaKind, device_id: String },
    #[error("no local {0} track")]
    NoLocalTrack(MediaKind),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent invite request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent server answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room is already joined or joining")]
    AlreadyJoined,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("peer {0} is not registered")]
    PeerNotFound(PeerId),
    #[error("peer {0} was declined by the local policy")]
    PolicyRejected(PeerId),
    #[error("peer {0} declined the connection")]
    Declined(PeerId),
    #[error("negotiation with {0} was cancelled by leave")]
    NegotiationCancelled(PeerId),
    #[error("join was cancelled by leave")]
    JoinCancelled,
}

impl RoomError {
    /// Short label used for negotiation-failure metrics and events.
    pub fn reason(&self) -> &'static str {
        match self {
            RoomError::Rpc(RpcError::Timeout { .. }) => "timeout",
            RoomError::Rpc(RpcError::Remote(_)) => "remote_error",
            RoomError::Rpc(_) | RoomError::Transport(_) => "transport",
            RoomError::Session(_) => "session",
            RoomError::Declined(_) => "declined",
            RoomError::NegotiationCancelled(_) | RoomError::JoinCancelled => "cancelled",
            RoomError::Protocol(_) => "protocol",
            RoomError::PolicyRejected(_) => "policy",
            RoomError::PeerNotFound(_) => "peer_not_found",
            RoomError::AlreadyJoined => "already_joined",
        }
    }
}
