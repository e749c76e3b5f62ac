//! Transport substrate
//!
//! A substrate creates point-to-point links between two nodes. Links are
//! negotiated out of band: the initiator produces an offer, the responder
//! answers it, and both sides trade address candidates through whatever
//! signaling path is active. Once negotiated, each side sees exactly one
//! data channel open and receives the remote side's frames as events.

pub mod memory;
pub mod tcp;

use crate::error::Result;
use meshradio_protocol::{IceCandidate, NodeId, SessionDescription};
use meshradio_routing::{PeerChannel, PeerConnection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::MemoryTransport;
pub use tcp::{TcpTransport, TcpTransportConfig};

/// Label of the data channel carrying mesh frames
pub const MESH_CHANNEL_LABEL: &str = "mesh";

/// Connection state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Whether the link can no longer carry frames
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Something that happened on a link
pub enum LinkEvent {
    /// A local address candidate to relay to the remote side
    LocalCandidate(IceCandidate),
    /// The data channel opened and accepts frames
    ChannelOpen(Arc<dyn PeerChannel>),
    /// A text frame arrived on the data channel
    Frame(String),
    /// The data channel closed
    ChannelClosed,
    StateChanged(LinkState),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            LinkEvent::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
            LinkEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
        }
    }
}

/// Options for a new link
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub local: NodeId,
    pub remote: NodeId,
    /// Ask for in-order delivery on the data channel
    pub ordered: bool,
}

/// A freshly created link and the stream of its events
pub struct NewLink {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// One negotiated point-to-point link
#[async_trait::async_trait]
pub trait TransportLink: Send + Sync {
    /// Initiator side: create the outgoing channel and describe how to reach it
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Responder side: apply the remote offer and produce an answer
    async fn accept_offer(&self, offer: &SessionDescription) -> Result<SessionDescription>;

    /// Initiator side: apply the remote answer
    async fn accept_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// Apply a candidate relayed from the remote side
    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    fn state(&self) -> LinkState;

    /// Tear the link down; closing twice is a no-op
    fn close(&self);
}

/// Creates links
#[async_trait::async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(&self, options: LinkOptions) -> Result<NewLink>;
}

/// Lets the mesh node own a transport link as its peer connection
pub struct LinkHandle(pub Arc<dyn TransportLink>);

impl PeerConnection for LinkHandle {
    fn is_closed(&self) -> bool {
        self.0.state().is_terminal()
    }

    fn close(&self) {
        self.0.close();
    }
}
