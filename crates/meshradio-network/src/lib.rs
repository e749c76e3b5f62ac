//! MeshRadio Network Layer
//!
//! This module connects a mesh node to its neighbours:
//! - Transport substrates that negotiate point-to-point links (TCP, in-memory)
//! - Rendezvous signaling (WebSocket client, in-process hub)
//! - Local discovery directories for when no rendezvous is reachable
//! - The connection orchestrator driving discovery and negotiation

pub mod config;
pub mod directory;
pub mod error;
pub mod orchestrator;
pub mod rendezvous;
pub mod state;
pub mod transport;

pub use config::OrchestratorConfig;
pub use directory::{FileDirectory, MemoryDirectory, PeerDirectory, SignalMailbox};
pub use error::{NetworkError, Result};
pub use orchestrator::{ConnectionOrchestrator, OrchestratorBuilder, SignalingMode};
pub use rendezvous::{
    MemoryRendezvous, Rendezvous, RendezvousHub, SignalingSession, WebSocketRendezvous,
};
pub use state::PeerState;
pub use transport::{
    LinkEvent, LinkFactory, LinkHandle, LinkOptions, LinkState, MemoryTransport, NewLink,
    TcpTransport, TcpTransportConfig, TransportLink,
};
