//! Rendezvous served by an in-process hub

use super::{Rendezvous, RendezvousHub, SignalingSession};
use crate::error::{NetworkError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connects sessions straight to a shared [`RendezvousHub`]
///
/// Can be switched offline to exercise the local discovery fallback.
#[derive(Clone)]
pub struct MemoryRendezvous {
    hub: Arc<RendezvousHub>,
    online: Arc<AtomicBool>,
}

impl MemoryRendezvous {
    pub fn new(hub: Arc<RendezvousHub>) -> Self {
        MemoryRendezvous {
            hub,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn hub(&self) -> &Arc<RendezvousHub> {
        &self.hub
    }

    /// Refuse new sessions and drop the open ones
    pub async fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.hub.disconnect_all().await;
    }

    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn connect(&self) -> Result<SignalingSession> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetworkError::RendezvousUnavailable(
                "in-process hub is offline".to_string(),
            ));
        }

        let (client_tx, hub_rx) = mpsc::unbounded_channel();
        let (hub_tx, client_rx) = mpsc::unbounded_channel();
        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move { hub.serve(hub_rx, hub_tx).await });

        Ok(SignalingSession {
            outbound: client_tx,
            inbound: client_rx,
        })
    }

    fn describe(&self) -> String {
        "in-process hub".to_string()
    }
}
