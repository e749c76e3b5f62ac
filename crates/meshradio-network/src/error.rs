//! Network error types

use meshradio_protocol::NodeId;
use thiserror::Error;

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Rendezvous unavailable: {0}")]
    RendezvousUnavailable(String),

    #[error("Signaling session closed")]
    SessionClosed,

    #[error("Negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: NodeId, reason: String },

    #[error("Negotiation with {0} timed out")]
    NegotiationTimedOut(NodeId),

    #[error("Link closed")]
    LinkClosed,

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Orchestrator is shut down")]
    ShutDown,

    #[error("Protocol error: {0}")]
    Protocol(#[from] meshradio_protocol::ProtocolError),

    #[error("Routing error: {0}")]
    Routing(#[from] meshradio_routing::RoutingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
