//! Mesh frames exchanged over direct peer channels
//!
//! Two control frames drive on-demand route discovery:
//! - `{"type":"RREQ", id, source, destination, hopCount, timestamp}`
//! - `{"type":"RREP", id, source, destination, hopCount}`
//!
//! Any frame without one of those tags is an application message
//! `{sender, destination, payload, timestamp, kind}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};
use crate::types::{Destination, NodeId};

/// Maximum application payload size (1 MB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire tag of a route request
pub const RREQ_TYPE: &str = "RREQ";

/// Wire tag of a route reply
pub const RREP_TYPE: &str = "RREP";

/// Kind of application payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Voice => "voice",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(MessageKind::Text),
            "voice" => Ok(MessageKind::Voice),
            other => Err(ProtocolError::MalformedFrame(format!(
                "unknown message kind: {}",
                other
            ))),
        }
    }
}

/// A message carried by the mesh on behalf of the application layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    /// Originating node
    pub sender: NodeId,

    /// Target node, or every node
    pub destination: Destination,

    /// Opaque payload (text, or encoded audio for voice notes)
    pub payload: String,

    /// Origination time (Unix milliseconds); unique per sender
    pub timestamp: u64,

    #[serde(default)]
    pub kind: MessageKind,
}

impl ApplicationMessage {
    pub fn new(
        sender: NodeId,
        destination: Destination,
        payload: impl Into<String>,
        kind: MessageKind,
        timestamp: u64,
    ) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(ApplicationMessage {
            sender,
            destination,
            payload,
            timestamp,
            kind,
        })
    }

    /// Key used to recognize this message when it arrives again
    pub fn dedup_key(&self) -> String {
        format!("msg:{}-{}", self.sender, self.timestamp)
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}

/// Route Request, flooded to discover a path to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    /// `<source>-<sequence>`, unique per originator
    pub id: String,
    pub source: NodeId,
    pub destination: NodeId,
    pub hop_count: u32,
    pub timestamp: u64,
}

impl RouteRequest {
    pub fn dedup_key(&self) -> String {
        format!("rreq:{}", self.id)
    }
}

/// Route Reply, unicast back along the reverse path of a request
///
/// `source` is the node that asked for the route, `destination` the node
/// that answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReply {
    pub id: String,
    pub source: NodeId,
    pub destination: NodeId,
    pub hop_count: u32,
}

impl RouteReply {
    pub fn dedup_key(&self) -> String {
        format!("rrep:{}", self.id)
    }
}

/// A frame on a peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshFrame {
    RouteRequest(RouteRequest),
    RouteReply(RouteReply),
    Application(ApplicationMessage),
}

impl MeshFrame {
    /// Encode to the JSON text sent over a channel
    pub fn encode(&self) -> Result<String> {
        match self {
            MeshFrame::RouteRequest(rreq) => tagged(RREQ_TYPE, rreq),
            MeshFrame::RouteReply(rrep) => tagged(RREP_TYPE, rrep),
            MeshFrame::Application(message) => serde_json::to_string(message)
                .map_err(|e| ProtocolError::SerializationFailed(e.to_string())),
        }
    }

    /// Decode a frame received from a channel
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

        if !value.is_object() {
            return Err(ProtocolError::MalformedFrame(
                "frame is not a JSON object".to_string(),
            ));
        }

        let frame = match value.get("type").and_then(Value::as_str) {
            Some(RREQ_TYPE) => MeshFrame::RouteRequest(from_value(value)?),
            Some(RREP_TYPE) => MeshFrame::RouteReply(from_value(value)?),
            _ => MeshFrame::Application(from_value(value)?),
        };

        if let MeshFrame::Application(message) = &frame {
            if message.payload.len() > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::MessageTooLarge {
                    size: message.payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
        }

        Ok(frame)
    }

    /// Short name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            MeshFrame::RouteRequest(_) => RREQ_TYPE,
            MeshFrame::RouteReply(_) => RREP_TYPE,
            MeshFrame::Application(_) => "message",
        }
    }
}

fn tagged<T: Serialize>(tag: &str, body: &T) -> Result<String> {
    let mut value =
        serde_json::to_value(body).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))?;

    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::String(tag.to_string()));
    }

    serde_json::to_string(&value).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}
