//! Core protocol types

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Length of a freshly generated node ID
pub const NODE_ID_LEN: usize = 13;

/// Longest node ID accepted from the wire
pub const MAX_NODE_ID_LEN: usize = 64;

/// Destination literal addressing every node in the mesh
pub const BROADCAST: &str = "broadcast";

const NODE_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Current Unix time in milliseconds
pub fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// An opaque identifier for a node in the mesh
///
/// Generated once per process and never changed afterwards. Identities
/// received from peers are accepted as long as they are non-empty, printable
/// and not the broadcast literal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Generate a random base-36 node ID
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..NODE_ID_LEN)
            .map(|_| NODE_ID_ALPHABET[rng.gen_range(0..NODE_ID_ALPHABET.len())] as char)
            .collect();
        NodeId(id)
    }

    /// Parse and validate a node ID
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(ProtocolError::InvalidNodeId("empty".to_string()));
        }

        if s.len() > MAX_NODE_ID_LEN {
            return Err(ProtocolError::InvalidNodeId(format!(
                "length {} exceeds {}",
                s.len(),
                MAX_NODE_ID_LEN
            )));
        }

        if s == BROADCAST {
            return Err(ProtocolError::InvalidNodeId(
                "broadcast is reserved".to_string(),
            ));
        }

        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtocolError::InvalidNodeId(format!("{:?}", s)));
        }

        Ok(NodeId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        NodeId::parse(&value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl FromStr for NodeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        NodeId::parse(s)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an application message is headed
///
/// Encoded on the wire as either a node ID or the literal `"broadcast"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Every node in the mesh
    Broadcast,
    /// A single node
    Node(NodeId),
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }

    /// The addressed node, if this is a unicast destination
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Destination::Broadcast => None,
            Destination::Node(id) => Some(id),
        }
    }

    /// Whether a node with `id` should deliver a message with this destination
    pub fn includes(&self, id: &NodeId) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::Node(target) => target == id,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Destination::Broadcast => BROADCAST,
            Destination::Node(id) => id.as_str(),
        }
    }
}

impl From<NodeId> for Destination {
    fn from(id: NodeId) -> Self {
        Destination::Node(id)
    }
}

impl FromStr for Destination {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        if s == BROADCAST {
            Ok(Destination::Broadcast)
        } else {
            NodeId::parse(s).map(Destination::Node)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Destination {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Destination {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_base36() {
        let id = NodeId::generate();
        assert_eq!(id.as_str().len(), NODE_ID_LEN);
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn test_parse_rejects_reserved_and_empty() {
        assert!(NodeId::parse("").is_err());
        assert!(NodeId::parse(BROADCAST).is_err());
        assert!(NodeId::parse("has space").is_err());
        assert!(NodeId::parse(&"x".repeat(MAX_NODE_ID_LEN + 1)).is_err());
        assert!(NodeId::parse("k3j9x0a1b2c3d").is_ok());
    }

    #[test]
    fn test_destination_wire_form() {
        let json = serde_json::to_string(&Destination::Broadcast).unwrap();
        assert_eq!(json, "\"broadcast\"");

        let dest: Destination = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(dest, Destination::Node(NodeId::parse("abc123").unwrap()));
        assert!(serde_json::from_str::<Destination>("\"\"").is_err());
    }

    #[test]
    fn test_destination_includes() {
        let me = NodeId::parse("me").unwrap();
        let other = NodeId::parse("other").unwrap();

        assert!(Destination::Broadcast.includes(&me));
        assert!(Destination::Node(me.clone()).includes(&me));
        assert!(!Destination::Node(other).includes(&me));
    }

    #[test]
    fn test_node_id_deserialize_validates() {
        assert!(serde_json::from_str::<NodeId>("\"broadcast\"").is_err());
        let id: NodeId = serde_json::from_str("\"peer-1\"").unwrap();
        assert_eq!(id.to_string(), "peer-1");
    }
}
