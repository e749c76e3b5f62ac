//! Rendezvous signaling
//!
//! A rendezvous service lets nodes that know nothing about each other find
//! one another and relay link negotiation. A session is a pair of message
//! queues; it has ended once `inbound` yields `None`.

pub mod hub;
pub mod memory;
pub mod websocket;

use crate::error::Result;
use meshradio_protocol::SignalMessage;
use tokio::sync::mpsc;

pub use hub::RendezvousHub;
pub use memory::MemoryRendezvous;
pub use websocket::WebSocketRendezvous;

/// An open rendezvous session
pub struct SignalingSession {
    pub outbound: mpsc::UnboundedSender<SignalMessage>,
    pub inbound: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalingSession {
    /// Queue a message for the rendezvous service
    ///
    /// Returns false once the session has ended.
    pub fn send(&self, message: SignalMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Opens rendezvous sessions
#[async_trait::async_trait]
pub trait Rendezvous: Send + Sync {
    async fn connect(&self) -> Result<SignalingSession>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}
