//! Connection orchestrator
//!
//! Discovers peers, negotiates a transport link with each of them and hands
//! every link whose data channel opens to the mesh node.
//!
//! Discovery runs in a supervisor task:
//! 1. Open a rendezvous session, join the room and react to `peer-list`,
//!    `peer-joined` and relayed negotiation frames until the session ends
//! 2. If no session can be opened, announce ourselves in the local
//!    directory and negotiate with every other live entry, relaying
//!    negotiation through the directory's mailbox when it has one
//! 3. Wait for the reconnect delay and start over, until shutdown
//!
//! Each link gets its own event task that relays local candidates, promotes
//! the peer when the channel opens, feeds inbound frames to the mesh node
//! and demotes the peer when the link goes away.

use crate::config::OrchestratorConfig;
use crate::directory::{self, PeerDirectory};
use crate::error::{NetworkError, Result};
use crate::rendezvous::{Rendezvous, SignalingSession};
use crate::state::PeerState;
use crate::transport::{
    LinkEvent, LinkFactory, LinkHandle, LinkOptions, NewLink, TransportLink,
};
use meshradio_protocol::{
    unix_millis, ApplicationMessage, Destination, IceCandidate, MessageKind, NodeId,
    SessionDescription, SignalMessage,
};
use meshradio_routing::{MeshNode, PeerChannel};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often expired keys are evicted from the mesh node's history
const HISTORY_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Candidates kept for a peer whose offer has not arrived yet
const MAX_EARLY_CANDIDATES: usize = 16;

/// Where negotiation messages currently go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingMode {
    /// No signaling path is available
    Offline,
    /// Connected to a rendezvous server
    Rendezvous,
    /// Using the local discovery directory
    LocalDiscovery,
}

#[derive(Clone)]
enum SignalingPath {
    Offline,
    Rendezvous(mpsc::UnboundedSender<SignalMessage>),
    /// Directory fallback; negotiation is relayed only if it has a mailbox
    Directory,
}

struct TrackedLink {
    link: Arc<dyn TransportLink>,
    state: PeerState,
    initiator: bool,
    generation: u64,
}

struct Inner {
    node: MeshNode,
    config: OrchestratorConfig,
    transport: Arc<dyn LinkFactory>,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    directory: Option<Arc<dyn PeerDirectory>>,
    links: RwLock<HashMap<NodeId, TrackedLink>>,
    early_candidates: RwLock<HashMap<NodeId, Vec<IceCandidate>>>,
    signaling: RwLock<SignalingPath>,
    next_generation: AtomicU64,
    initialized: AtomicBool,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds a [`ConnectionOrchestrator`]
pub struct OrchestratorBuilder {
    node: MeshNode,
    transport: Arc<dyn LinkFactory>,
    config: OrchestratorConfig,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    directory: Option<Arc<dyn PeerDirectory>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rendezvous(mut self, rendezvous: Arc<dyn Rendezvous>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn build(self) -> ConnectionOrchestrator {
        let (shutdown_tx, _) = watch::channel(false);
        ConnectionOrchestrator {
            inner: Arc::new(Inner {
                node: self.node,
                config: self.config,
                transport: self.transport,
                rendezvous: self.rendezvous,
                directory: self.directory,
                links: RwLock::new(HashMap::new()),
                early_candidates: RwLock::new(HashMap::new()),
                signaling: RwLock::new(SignalingPath::Offline),
                next_generation: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Owns peer discovery and link negotiation for one mesh node
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl ConnectionOrchestrator {
    pub fn builder(node: MeshNode, transport: Arc<dyn LinkFactory>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            node,
            transport,
            config: OrchestratorConfig::default(),
            rendezvous: None,
            directory: None,
        }
    }

    pub fn node(&self) -> &MeshNode {
        &self.inner.node
    }

    pub fn local_id(&self) -> &NodeId {
        self.inner.local_id()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Start discovery in the background
    ///
    /// Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.is_shut_down() {
            return Err(NetworkError::ShutDown);
        }
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            "Starting node {} (rendezvous: {}, directory: {})",
            self.local_id(),
            self.inner
                .rendezvous
                .as_ref()
                .map(|r| r.describe())
                .unwrap_or_else(|| "none".to_string()),
            self.inner
                .directory
                .as_ref()
                .map(|d| d.describe())
                .unwrap_or_else(|| "none".to_string()),
        );

        let supervisor = tokio::spawn(Arc::clone(&self.inner).supervise());
        let maintenance = tokio::spawn(Arc::clone(&self.inner).maintain());
        self.inner.tasks.lock().await.extend([supervisor, maintenance]);
        Ok(())
    }

    /// Broadcast an application message to the whole mesh
    pub async fn send_message(
        &self,
        payload: impl Into<String>,
        kind: MessageKind,
    ) -> Result<ApplicationMessage> {
        if self.inner.is_shut_down() {
            return Err(NetworkError::ShutDown);
        }
        Ok(self
            .inner
            .node
            .send(Destination::Broadcast, payload, kind)
            .await?)
    }

    /// Send an application message to a single node
    pub async fn send_to(
        &self,
        destination: NodeId,
        payload: impl Into<String>,
        kind: MessageKind,
    ) -> Result<ApplicationMessage> {
        if self.inner.is_shut_down() {
            return Err(NetworkError::ShutDown);
        }
        Ok(self
            .inner
            .node
            .send(Destination::Node(destination), payload, kind)
            .await?)
    }

    /// Number of peers with an open channel
    pub async fn peer_count(&self) -> usize {
        self.inner.node.peer_count().await
    }

    pub async fn peer_state(&self, peer: &NodeId) -> PeerState {
        self.inner
            .links
            .read()
            .await
            .get(peer)
            .map(|tracked| tracked.state)
            .unwrap_or_default()
    }

    /// Negotiations that have not opened a channel yet
    pub async fn pending_count(&self) -> usize {
        self.inner
            .links
            .read()
            .await
            .values()
            .filter(|tracked| tracked.state == PeerState::Pending)
            .count()
    }

    pub async fn signaling_mode(&self) -> SignalingMode {
        match &*self.inner.signaling.read().await {
            SignalingPath::Offline => SignalingMode::Offline,
            SignalingPath::Rendezvous(_) => SignalingMode::Rendezvous,
            SignalingPath::Directory => SignalingMode::LocalDiscovery,
        }
    }

    /// Start negotiating with `peer` right away
    pub fn connect(&self, peer: NodeId) {
        self.inner.spawn_connect(peer);
    }

    /// Close every link and the rendezvous session and stop all tasks
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = inner.shutdown_tx.send(true);

        for task in inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        let links: Vec<Arc<dyn TransportLink>> = inner
            .links
            .write()
            .await
            .drain()
            .map(|(_, tracked)| tracked.link)
            .collect();
        for link in &links {
            link.close();
        }

        inner.early_candidates.write().await.clear();
        *inner.signaling.write().await = SignalingPath::Offline;
        inner.node.shutdown().await;

        info!(
            "Node {} shut down ({} link(s) closed)",
            inner.local_id(),
            links.len()
        );
    }
}

impl Inner {
    fn local_id(&self) -> &NodeId {
        self.node.node_id()
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn shutdown_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        while !self.is_shut_down() {
            match &self.rendezvous {
                Some(rendezvous) => match rendezvous.connect().await {
                    Ok(session) => {
                        self.run_session(session).await;
                        info!("Rendezvous session ended");
                    }
                    Err(e) => {
                        warn!("Rendezvous unavailable: {}", e);
                        self.local_discovery().await;
                    }
                },
                None => self.local_discovery().await,
            }

            if !self.wait_before_reconnect().await {
                break;
            }
        }
    }

    async fn run_session(self: &Arc<Self>, session: SignalingSession) {
        let SignalingSession {
            outbound,
            mut inbound,
        } = session;

        let join = SignalMessage::Join {
            id: self.local_id().clone(),
            room: self.config.room.clone(),
        };
        if outbound.send(join).is_err() {
            return;
        }
        *self.signaling.write().await = SignalingPath::Rendezvous(outbound);
        info!("Joined rendezvous room {}", self.config.room);

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => break,
                },
                _ = self.shutdown_signal() => break,
            }
        }

        *self.signaling.write().await = SignalingPath::Offline;
    }

    async fn local_discovery(self: &Arc<Self>) {
        let Some(store) = &self.directory else {
            debug!("No local discovery directory configured");
            return;
        };

        *self.signaling.write().await = SignalingPath::Directory;
        info!("Using local discovery fallback ({})", store.describe());

        let window_ms = self.config.discovery_window_ms();
        match directory::announce(store.as_ref(), self.local_id(), unix_millis(), window_ms)
            .await
        {
            Ok(peers) => {
                debug!("{} live peer(s) in local directory", peers.len());
                for peer in peers {
                    self.spawn_connect(peer);
                }
            }
            Err(e) => warn!("Local discovery failed: {}", e),
        }
    }

    /// Sleep out the reconnect delay, polling the mailbox meanwhile
    ///
    /// Returns false if shutdown was requested.
    async fn wait_before_reconnect(self: &Arc<Self>) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.reconnect_delay();
        loop {
            if matches!(*self.signaling.read().await, SignalingPath::Directory) {
                self.drain_mailbox().await;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return !self.is_shut_down();
            }
            let step = self.config.mailbox_poll_interval().min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = self.shutdown_signal() => return false,
            }
        }
    }

    async fn drain_mailbox(self: &Arc<Self>) {
        let Some(mailbox) = self.directory.as_ref().and_then(|d| d.mailbox()) else {
            return;
        };
        match mailbox.take(self.local_id()).await {
            Ok(messages) => {
                for message in messages {
                    self.handle_signal(message).await;
                }
            }
            Err(e) => warn!("Failed to read signaling mailbox: {}", e),
        }
    }

    async fn maintain(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HISTORY_CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = self.node.cleanup_history().await;
                    if evicted > 0 {
                        debug!("Evicted {} expired message key(s)", evicted);
                    }
                }
                _ = self.shutdown_signal() => break,
            }
        }
    }

    async fn handle_signal(self: &Arc<Self>, message: SignalMessage) {
        if message
            .target()
            .map(|target| target != self.local_id())
            .unwrap_or(false)
        {
            debug!("Ignoring {} addressed to someone else", message.type_name());
            return;
        }

        match message {
            SignalMessage::PeerList { peers } => {
                debug!("Room has {} other member(s)", peers.len());
                for peer in peers {
                    self.spawn_connect(peer);
                }
            }
            SignalMessage::PeerJoined { id } => self.spawn_connect(id),
            SignalMessage::Offer { offer, from, .. } => {
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.handle_offer(from, offer).await });
            }
            SignalMessage::Answer { answer, from, .. } => self.handle_answer(&from, answer).await,
            SignalMessage::IceCandidate {
                candidate, from, ..
            } => self.handle_candidate(&from, candidate).await,
            other => debug!("Ignoring {} signal", other.type_name()),
        }
    }

    /// Route a negotiation message over the active signaling path
    async fn signal(&self, message: SignalMessage) {
        let path = self.signaling.read().await.clone();
        match path {
            SignalingPath::Rendezvous(outbound) => {
                if outbound.send(message).is_err() {
                    debug!("Rendezvous session is gone, dropping signal");
                }
            }
            SignalingPath::Directory => {
                match self.directory.as_ref().and_then(|d| d.mailbox()) {
                    Some(mailbox) => {
                        if let Err(e) = mailbox.post(&message).await {
                            warn!("Failed to post {} to mailbox: {}", message.type_name(), e);
                        }
                    }
                    None => debug!("Directory has no mailbox, dropping {}", message.type_name()),
                }
            }
            SignalingPath::Offline => {
                debug!("No signaling path, dropping {}", message.type_name());
            }
        }
    }

    fn link_options(&self, remote: &NodeId) -> LinkOptions {
        LinkOptions {
            local: self.local_id().clone(),
            remote: remote.clone(),
            ordered: self.config.ordered_channels,
        }
    }

    fn spawn_connect(self: &Arc<Self>, peer: NodeId) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.connect_to(peer).await });
    }

    /// Negotiate with `peer` as the initiator
    async fn connect_to(self: Arc<Self>, peer: NodeId) {
        if &peer == self.local_id() || self.is_shut_down() {
            return;
        }
        if self.node.has_peer(&peer).await || !self.accepts_negotiation(&peer).await {
            return;
        }

        let NewLink { link, events } = match self.transport.create_link(self.link_options(&peer)).await
        {
            Ok(new_link) => new_link,
            Err(e) => {
                warn!("Failed to create link to {}: {}", peer, e);
                return;
            }
        };

        let Some(generation) = self.track(&peer, &link, true).await else {
            link.close();
            return;
        };
        info!("Connecting to {} (initiator)", peer);
        self.spawn_link_task(peer.clone(), generation, Arc::clone(&link), events);

        match link.create_offer().await {
            Ok(offer) => {
                self.signal(SignalMessage::Offer {
                    offer,
                    target: peer,
                    from: self.local_id().clone(),
                })
                .await
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", peer, e);
                self.demote(&peer, generation, "offer failed").await;
            }
        }
    }

    /// Negotiate with `from` as the responder
    async fn handle_offer(self: Arc<Self>, from: NodeId, offer: SessionDescription) {
        if &from == self.local_id() || self.is_shut_down() {
            return;
        }
        if self.node.has_peer(&from).await {
            debug!("Ignoring offer from connected peer {}", from);
            return;
        }

        // Both sides offered at once: the smaller id keeps its offer
        let yielded = {
            let links = self.links.read().await;
            match links.get(&from) {
                Some(tracked) if tracked.state == PeerState::Pending => {
                    if !tracked.initiator || self.local_id() < &from {
                        debug!("Ignoring offer from {}, negotiation already pending", from);
                        return;
                    }
                    Some(tracked.generation)
                }
                Some(tracked) if tracked.state == PeerState::Open => return,
                _ => None,
            }
        };
        if let Some(generation) = yielded {
            debug!("Offer collision with {}, answering theirs", from);
            self.demote(&from, generation, "offer collision").await;
        }

        let NewLink { link, events } = match self.transport.create_link(self.link_options(&from)).await
        {
            Ok(new_link) => new_link,
            Err(e) => {
                warn!("Failed to create link to {}: {}", from, e);
                return;
            }
        };

        let Some(generation) = self.track(&from, &link, false).await else {
            link.close();
            return;
        };
        info!("Answering offer from {}", from);
        self.spawn_link_task(from.clone(), generation, Arc::clone(&link), events);

        match link.accept_offer(&offer).await {
            Ok(answer) => {
                self.signal(SignalMessage::Answer {
                    answer,
                    target: from.clone(),
                    from: self.local_id().clone(),
                })
                .await;

                let early = self
                    .early_candidates
                    .write()
                    .await
                    .remove(&from)
                    .unwrap_or_default();
                for candidate in early {
                    if let Err(e) = link.add_candidate(&candidate).await {
                        debug!("Candidate from {} rejected: {}", from, e);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to accept offer from {}: {}", from, e);
                self.demote(&from, generation, "offer rejected").await;
            }
        }
    }

    async fn handle_answer(&self, from: &NodeId, answer: SessionDescription) {
        let pending = {
            let links = self.links.read().await;
            match links.get(from) {
                Some(tracked) if tracked.state == PeerState::Pending && tracked.initiator => {
                    Some((Arc::clone(&tracked.link), tracked.generation))
                }
                _ => None,
            }
        };

        let Some((link, generation)) = pending else {
            debug!("Ignoring unexpected answer from {}", from);
            return;
        };

        if let Err(e) = link.accept_answer(&answer).await {
            warn!("Failed to apply answer from {}: {}", from, e);
            self.demote(from, generation, "answer rejected").await;
        }
    }

    async fn handle_candidate(&self, from: &NodeId, candidate: IceCandidate) {
        let link = {
            let links = self.links.read().await;
            links
                .get(from)
                .filter(|tracked| matches!(tracked.state, PeerState::Pending | PeerState::Open))
                .map(|tracked| Arc::clone(&tracked.link))
        };

        match link {
            Some(link) => {
                if let Err(e) = link.add_candidate(&candidate).await {
                    debug!("Candidate from {} rejected: {}", from, e);
                }
            }
            None => {
                let mut early = self.early_candidates.write().await;
                let queued = early.entry(from.clone()).or_default();
                if queued.len() < MAX_EARLY_CANDIDATES {
                    queued.push(candidate);
                }
            }
        }
    }

    async fn accepts_negotiation(&self, peer: &NodeId) -> bool {
        self.links
            .read()
            .await
            .get(peer)
            .map(|tracked| tracked.state.accepts_negotiation())
            .unwrap_or(true)
    }

    /// Record a new pending negotiation; `None` if one may not start now
    async fn track(
        &self,
        peer: &NodeId,
        link: &Arc<dyn TransportLink>,
        initiator: bool,
    ) -> Option<u64> {
        if self.is_shut_down() {
            return None;
        }

        let mut links = self.links.write().await;
        let state = links.get(peer).map(|tracked| tracked.state).unwrap_or_default();
        if !state.can_transition_to(PeerState::Pending) {
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        links.insert(
            peer.clone(),
            TrackedLink {
                link: Arc::clone(link),
                state: PeerState::Pending,
                initiator,
                generation,
            },
        );
        Some(generation)
    }

    /// Hand an opened channel to the mesh node
    async fn promote(&self, peer: &NodeId, generation: u64, channel: Arc<dyn PeerChannel>) -> bool {
        let link = {
            let mut links = self.links.write().await;
            match links.get_mut(peer) {
                Some(tracked)
                    if tracked.generation == generation
                        && tracked.state.can_transition_to(PeerState::Open) =>
                {
                    tracked.state = PeerState::Open;
                    Arc::clone(&tracked.link)
                }
                _ => return false,
            }
        };

        info!("Channel open with {}", peer);
        self.node
            .add_peer(peer.clone(), channel, Arc::new(LinkHandle(link)))
            .await;
        true
    }

    /// Close a pending or open link and drop the peer from the mesh
    async fn demote(&self, peer: &NodeId, generation: u64, reason: &str) {
        let link = {
            let mut links = self.links.write().await;
            match links.get_mut(peer) {
                Some(tracked)
                    if tracked.generation == generation
                        && tracked.state.can_transition_to(PeerState::Closed) =>
                {
                    tracked.state = PeerState::Closed;
                    Arc::clone(&tracked.link)
                }
                _ => return,
            }
        };

        info!("Link with {} closed: {}", peer, reason);
        self.early_candidates.write().await.remove(peer);
        link.close();
        self.node.remove_peer(peer).await;
    }

    fn spawn_link_task(
        self: &Arc<Self>,
        peer: NodeId,
        generation: u64,
        link: Arc<dyn TransportLink>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_link(peer, generation, link, events).await });
    }

    async fn run_link(
        self: Arc<Self>,
        peer: NodeId,
        generation: u64,
        link: Arc<dyn TransportLink>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let deadline = tokio::time::sleep(self.config.negotiation_timeout());
        tokio::pin!(deadline);
        let mut open = false;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        self.demote(&peer, generation, "link dropped").await;
                        break;
                    };

                    match event {
                        LinkEvent::LocalCandidate(candidate) => {
                            self.signal(SignalMessage::IceCandidate {
                                candidate,
                                target: peer.clone(),
                                from: self.local_id().clone(),
                            })
                            .await;
                        }
                        LinkEvent::ChannelOpen(channel) => {
                            if !self.promote(&peer, generation, channel).await {
                                debug!("Stale link with {} opened, closing it", peer);
                                link.close();
                                break;
                            }
                            open = true;
                        }
                        LinkEvent::Frame(raw) if open => {
                            self.node.receive_frame(&peer, &raw).await;
                        }
                        LinkEvent::Frame(_) => {}
                        LinkEvent::ChannelClosed => {
                            self.demote(&peer, generation, "channel closed").await;
                            break;
                        }
                        LinkEvent::StateChanged(state) => {
                            debug!("Link with {} is {}", peer, state);
                            if state.is_terminal() {
                                self.demote(&peer, generation, &format!("link {}", state)).await;
                                break;
                            }
                        }
                    }
                }
                _ = &mut deadline, if !open => {
                    warn!("Negotiation with {} timed out", peer);
                    self.demote(&peer, generation, "negotiation timed out").await;
                    break;
                }
            }
        }
    }
}
