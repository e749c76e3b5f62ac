//! In-process transport substrate
//!
//! Links created by one `MemoryTransport` can reach each other through its
//! switchboard: an offer registers the initiator under a token, the
//! responder claims the token when it accepts the offer, and the channel
//! opens on both sides once the initiator applies the answer.

use super::{
    LinkEvent, LinkFactory, LinkOptions, LinkState, NewLink, TransportLink, MESH_CHANNEL_LABEL,
};
use crate::error::{NetworkError, Result};
use meshradio_protocol::{IceCandidate, NodeId, SdpKind, SessionDescription};
use meshradio_routing::{PeerChannel, RoutingError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

type Switchboard = Arc<Mutex<HashMap<String, Weak<MemoryLinkInner>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport whose links live inside this process
#[derive(Clone, Default)]
pub struct MemoryTransport {
    switchboard: Switchboard,
    next_offer: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers registered but not yet claimed by a responder
    pub fn pending_offers(&self) -> usize {
        lock(&self.switchboard)
            .values()
            .filter(|link| link.strong_count() > 0)
            .count()
    }
}

#[async_trait::async_trait]
impl LinkFactory for MemoryTransport {
    async fn create_link(&self, options: LinkOptions) -> Result<NewLink> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let token = format!(
            "memory:{}:{}",
            options.local,
            self.next_offer.fetch_add(1, Ordering::SeqCst)
        );

        let inner = Arc::new(MemoryLinkInner {
            options,
            token,
            state: Mutex::new(LinkState::New),
            events: events_tx,
            remote: Mutex::new(Weak::new()),
            remote_candidates: Mutex::new(Vec::new()),
            switchboard: Arc::clone(&self.switchboard),
        });

        Ok(NewLink {
            link: Arc::new(MemoryLink { inner }),
            events,
        })
    }
}

struct MemoryLinkInner {
    options: LinkOptions,
    token: String,
    state: Mutex<LinkState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    remote: Mutex<Weak<MemoryLinkInner>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    switchboard: Switchboard,
}

impl MemoryLinkInner {
    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Move to `next` unless the link already ended; returns the old state
    fn transition(&self, next: LinkState) -> Option<LinkState> {
        let previous = {
            let mut state = lock(&self.state);
            if state.is_terminal() || *state == next {
                return None;
            }
            std::mem::replace(&mut *state, next)
        };
        self.emit(LinkEvent::StateChanged(next));
        Some(previous)
    }

    fn open(self: &Arc<Self>) {
        if self.transition(LinkState::Connected).is_some() {
            self.emit(LinkEvent::ChannelOpen(Arc::new(MemoryChannel {
                link: Arc::downgrade(self),
                remote: self.options.remote.clone(),
            })));
        }
    }

    fn remote_dropped(&self) {
        if self.transition(LinkState::Disconnected) == Some(LinkState::Connected) {
            self.emit(LinkEvent::ChannelClosed);
        }
    }
}

/// A link created by [`MemoryTransport`]
pub struct MemoryLink {
    inner: Arc<MemoryLinkInner>,
}

impl MemoryLink {
    /// Candidates received from the remote side so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner.remote_candidates).clone()
    }
}

#[async_trait::async_trait]
impl TransportLink for MemoryLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.inner.state().is_terminal() {
            return Err(NetworkError::LinkClosed);
        }

        lock(&self.inner.switchboard)
            .insert(self.inner.token.clone(), Arc::downgrade(&self.inner));
        self.inner.transition(LinkState::Connecting);

        self.inner.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("memory {}", self.inner.token),
            sdp_mid: Some(MESH_CHANNEL_LABEL.to_string()),
            sdp_m_line_index: Some(0),
        }));

        Ok(SessionDescription::offer(self.inner.token.clone()))
    }

    async fn accept_offer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(NetworkError::InvalidDescription(
                "expected an offer".to_string(),
            ));
        }

        let initiator = lock(&self.inner.switchboard)
            .remove(&offer.sdp)
            .and_then(|link| link.upgrade())
            .ok_or_else(|| NetworkError::NegotiationFailed {
                peer: self.inner.options.remote.clone(),
                reason: format!("no pending offer {}", offer.sdp),
            })?;

        *lock(&self.inner.remote) = Arc::downgrade(&initiator);
        *lock(&initiator.remote) = Arc::downgrade(&self.inner);
        self.inner.transition(LinkState::Connecting);

        debug!(
            "Memory link {} <-> {} paired",
            self.inner.options.local, self.inner.options.remote
        );

        Ok(SessionDescription::answer(offer.sdp.clone()))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer || answer.sdp != self.inner.token {
            return Err(NetworkError::InvalidDescription(format!(
                "unexpected answer {}",
                answer.sdp
            )));
        }

        let remote = lock(&self.inner.remote).upgrade().ok_or_else(|| {
            NetworkError::NegotiationFailed {
                peer: self.inner.options.remote.clone(),
                reason: "answer arrived before the offer was claimed".to_string(),
            }
        })?;

        self.inner.open();
        remote.open();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if self.inner.state().is_terminal() {
            return Err(NetworkError::LinkClosed);
        }
        lock(&self.inner.remote_candidates).push(candidate.clone());
        Ok(())
    }

    fn state(&self) -> LinkState {
        self.inner.state()
    }

    fn close(&self) {
        let Some(previous) = self.inner.transition(LinkState::Closed) else {
            return;
        };
        if previous == LinkState::Connected {
            self.inner.emit(LinkEvent::ChannelClosed);
        }

        lock(&self.inner.switchboard).remove(&self.inner.token);

        let remote = lock(&self.inner.remote).upgrade();
        if let Some(remote) = remote {
            remote.remote_dropped();
        }
    }
}

struct MemoryChannel {
    link: Weak<MemoryLinkInner>,
    remote: NodeId,
}

impl PeerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.link
            .upgrade()
            .map(|link| link.state() == LinkState::Connected)
            .unwrap_or(false)
    }

    fn send(&self, frame: &str) -> meshradio_routing::Result<()> {
        let closed = || RoutingError::ChannelClosed(self.remote.clone());

        let link = self.link.upgrade().ok_or_else(closed)?;
        if link.state() != LinkState::Connected {
            return Err(closed());
        }

        let remote = lock(&link.remote).upgrade().ok_or_else(closed)?;
        remote.emit(LinkEvent::Frame(frame.to_string()));
        Ok(())
    }
}
