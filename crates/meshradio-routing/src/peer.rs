//! Direct peer links owned by the mesh node

use crate::error::Result;
use meshradio_protocol::NodeId;
use std::fmt;
use std::sync::Arc;

/// Send half of a direct data channel
///
/// `send` must not block: transports queue the frame and return.
pub trait PeerChannel: Send + Sync {
    /// Whether the channel currently accepts frames
    fn is_open(&self) -> bool;

    /// Queue a text frame for the remote peer
    fn send(&self, frame: &str) -> Result<()>;
}

/// The transport link a channel runs over
pub trait PeerConnection: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Tear the link down; closing twice is a no-op
    fn close(&self);
}

/// A directly connected peer
#[derive(Clone)]
pub struct Peer {
    pub peer_id: NodeId,
    pub channel: Arc<dyn PeerChannel>,
    pub connection: Arc<dyn PeerConnection>,
}

impl Peer {
    pub fn new(
        peer_id: NodeId,
        channel: Arc<dyn PeerChannel>,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        Peer {
            peer_id,
            channel,
            connection,
        }
    }

    /// Close the underlying link unless it already is
    pub fn disconnect(&self) {
        if !self.connection.is_closed() {
            self.connection.close();
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.peer_id)
            .field("open", &self.channel.is_open())
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}
