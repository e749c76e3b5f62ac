//! Routing error types

use meshradio_protocol::NodeId;
use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Channel to {0} is not open")]
    ChannelClosed(NodeId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Mesh node is shut down")]
    ShutDown,

    #[error("Protocol error: {0}")]
    Protocol(#[from] meshradio_protocol::ProtocolError),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
