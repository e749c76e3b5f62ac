//! Rendezvous signaling frames
//!
//! JSON text frames exchanged with the rendezvous server. They are only used
//! to discover peers and relay link negotiation; application data never
//! travels over the rendezvous channel.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::NodeId;

/// Session description role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer produced by a transport link
///
/// The `sdp` body is opaque to everything but the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Address candidate discovered by a transport link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        IceCandidate {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// A frame on the rendezvous channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Announce `id` into `room`
    Join { id: NodeId, room: String },

    /// Roster of the room at join time
    PeerList { peers: Vec<NodeId> },

    /// A new node joined the room
    PeerJoined { id: NodeId },

    Offer {
        offer: SessionDescription,
        target: NodeId,
        from: NodeId,
    },

    Answer {
        answer: SessionDescription,
        target: NodeId,
        from: NodeId,
    },

    IceCandidate {
        candidate: IceCandidate,
        target: NodeId,
        from: NodeId,
    },

    /// Any frame type this node does not understand
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    /// Node a relayed negotiation frame is addressed to
    pub fn target(&self) -> Option<&NodeId> {
        match self {
            SignalMessage::Offer { target, .. }
            | SignalMessage::Answer { target, .. }
            | SignalMessage::IceCandidate { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Node that sent a relayed negotiation frame
    pub fn sender(&self) -> Option<&NodeId> {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => Some(from),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::PeerList { .. } => "peer-list",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Unknown => "unknown",
        }
    }
}
