//! MeshRadio Protocol Module
//!
//! This module defines the wire-level data structures shared by the mesh:
//! - Node identities and message destinations
//! - Mesh frames (route requests, route replies, application messages)
//! - Rendezvous signaling frames used to negotiate direct links
//! - Local discovery records

pub mod discovery;
pub mod error;
pub mod message;
pub mod signaling;
pub mod types;

pub use discovery::{announce_and_prune, live_peers, PeerRecord, DEFAULT_DISCOVERY_WINDOW_MS};
pub use error::{ProtocolError, Result};
pub use message::{ApplicationMessage, MeshFrame, MessageKind, RouteReply, RouteRequest};
pub use signaling::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
pub use types::{unix_millis, Destination, NodeId, BROADCAST};
