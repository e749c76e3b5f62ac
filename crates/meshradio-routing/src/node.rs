//! Mesh node
//!
//! Owns the local identity, the direct peer set, the routing table and the
//! deduplication history, and runs the forwarding and route discovery
//! algorithm over them. The three structures share one lock so every frame
//! is processed against a consistent view.
//!
//! Forwarding, for every inbound or locally originated application message:
//! 1. Drop it if its key is already in the history, otherwise record it
//! 2. Deliver locally if addressed to this node or to everyone
//! 3. Broadcasts are flooded to every peer except the one they came from
//! 4. Unicasts follow the routing table; without a route a discovery is
//!    started and delivery is re-attempted later per the retry policy

use crate::config::MeshConfig;
use crate::deduplication::DeduplicationCache;
use crate::error::{Result, RoutingError};
use crate::peer::{Peer, PeerChannel, PeerConnection};
use crate::routing_table::{RouteEntry, RoutingTable};
use meshradio_protocol::{
    unix_millis, ApplicationMessage, Destination, MeshFrame, MessageKind, NodeId, RouteReply,
    RouteRequest,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Mesh node statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct MeshStats {
    pub messages_delivered: u64,
    pub messages_forwarded: u64,
    pub duplicates_dropped: u64,
    pub malformed_frames: u64,
    pub route_discoveries: u64,
    pub route_requests_relayed: u64,
    pub route_replies_sent: u64,
    pub route_replies_dropped: u64,
    pub undeliverable: u64,
}

/// A message given up on after every retry found no route
#[derive(Debug, Clone)]
pub struct Undeliverable {
    pub message: ApplicationMessage,
    pub attempts: u32,
}

/// Streams the application layer consumes
pub struct MeshEvents {
    /// Messages delivered to this node
    pub messages: mpsc::UnboundedReceiver<ApplicationMessage>,
    /// Connected peer IDs, sent on every change of the peer set
    pub peers: mpsc::UnboundedReceiver<Vec<NodeId>>,
    /// Locally originated messages that could not be routed
    pub undeliverable: mpsc::UnboundedReceiver<Undeliverable>,
}

struct MeshState {
    peers: HashMap<NodeId, Peer>,
    routes: RoutingTable,
    history: DeduplicationCache,
    stats: MeshStats,
    /// Last timestamp handed to a locally originated message
    last_timestamp: u64,
}

struct Inner {
    node_id: NodeId,
    config: MeshConfig,
    state: RwLock<MeshState>,
    sequence: AtomicU64,
    shutdown: AtomicBool,
    message_tx: mpsc::UnboundedSender<ApplicationMessage>,
    peer_tx: mpsc::UnboundedSender<Vec<NodeId>>,
    undeliverable_tx: mpsc::UnboundedSender<Undeliverable>,
}

/// A node of the mesh
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<Inner>,
}

impl MeshNode {
    /// Create a node with identity `node_id`
    ///
    /// Returns the node and the event streams it reports into.
    pub fn new(node_id: NodeId, config: MeshConfig) -> (Self, MeshEvents) {
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (peer_tx, peers) = mpsc::unbounded_channel();
        let (undeliverable_tx, undeliverable) = mpsc::unbounded_channel();

        let state = MeshState {
            peers: HashMap::new(),
            routes: RoutingTable::new(),
            history: DeduplicationCache::new(config.dedup_capacity, config.dedup_ttl_secs),
            stats: MeshStats::default(),
            last_timestamp: 0,
        };

        let node = MeshNode {
            inner: Arc::new(Inner {
                node_id,
                config,
                state: RwLock::new(state),
                sequence: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                message_tx,
                peer_tx,
                undeliverable_tx,
            }),
        };

        let events = MeshEvents {
            messages,
            peers,
            undeliverable,
        };

        (node, events)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Register a direct link that just opened
    ///
    /// Seeds a one-hop route to the peer and publishes the new peer set.
    pub async fn add_peer(
        &self,
        peer_id: NodeId,
        channel: Arc<dyn PeerChannel>,
        connection: Arc<dyn PeerConnection>,
    ) {
        if self.is_shut_down() {
            connection.close();
            return;
        }

        if peer_id == self.inner.node_id {
            warn!("Refusing to add a link to ourselves");
            connection.close();
            return;
        }

        let (replaced, peers) = {
            let mut state = self.inner.state.write().await;
            let peer = Peer::new(peer_id.clone(), channel, Arc::clone(&connection));
            let replaced = state
                .peers
                .insert(peer_id.clone(), peer)
                .filter(|previous| !Arc::ptr_eq(&previous.connection, &connection));
            state.routes.update(peer_id.clone(), peer_id.clone(), 1);
            (replaced, sorted_peer_ids(&state.peers))
        };

        if let Some(previous) = replaced {
            previous.disconnect();
        }

        info!("Peer {} added ({} connected)", peer_id, peers.len());
        self.notify_peers(peers);
    }

    /// Drop a direct peer
    ///
    /// Closes its link, removes its direct route and every route that used it
    /// as next hop. Returns false if the peer was not connected.
    pub async fn remove_peer(&self, peer_id: &NodeId) -> bool {
        let (removed, lost, peers) = {
            let mut state = self.inner.state.write().await;
            let removed = state.peers.remove(peer_id);
            let lost = state.routes.purge_via(peer_id);
            (removed, lost, sorted_peer_ids(&state.peers))
        };

        let Some(peer) = removed else {
            return false;
        };

        peer.disconnect();
        info!("Peer {} removed ({} connected)", peer_id, peers.len());
        if !lost.is_empty() {
            debug!("Invalidated {} route(s) through {}", lost.len(), peer_id);
        }
        self.notify_peers(peers);
        true
    }

    /// Originate an application message
    pub async fn send(
        &self,
        destination: Destination,
        payload: impl Into<String>,
        kind: MessageKind,
    ) -> Result<ApplicationMessage> {
        if self.is_shut_down() {
            return Err(RoutingError::ShutDown);
        }

        let timestamp = {
            let mut state = self.inner.state.write().await;
            let timestamp = unix_millis().max(state.last_timestamp + 1);
            state.last_timestamp = timestamp;
            timestamp
        };

        let message = ApplicationMessage::new(
            self.inner.node_id.clone(),
            destination,
            payload,
            kind,
            timestamp,
        )?;

        self.route_message(message.clone(), None).await;
        Ok(message)
    }

    /// Run the forwarding algorithm on `message`
    ///
    /// `from` is the peer the message arrived from, `None` for local origin.
    pub async fn route_message(&self, message: ApplicationMessage, from: Option<&NodeId>) {
        let mut state = self.inner.state.write().await;

        if !state.history.insert(&message.dedup_key()) {
            state.stats.duplicates_dropped += 1;
            debug!("Dropping duplicate message {}", message.dedup_key());
            return;
        }

        if message.destination.includes(&self.inner.node_id) {
            self.deliver_local(&mut state, &message);
        }

        match &message.destination {
            Destination::Broadcast => {
                if let Some(frame) = encode(&MeshFrame::Application(message.clone())) {
                    let sent = flood(&state, &frame, from);
                    state.stats.messages_forwarded += sent as u64;
                }
            }
            Destination::Node(target) if target == &self.inner.node_id => {}
            Destination::Node(target) => {
                let target = target.clone();
                if !self.forward(&mut state, &message) {
                    debug!("No route to {}, starting discovery", target);
                    self.discover_route(&mut state, &target);
                    drop(state);
                    self.spawn_retry(message);
                }
            }
        }
    }

    /// Decode a frame received from `from` and dispatch it
    ///
    /// Malformed frames are logged and ignored.
    pub async fn receive_frame(&self, from: &NodeId, raw: &str) {
        if self.is_shut_down() {
            return;
        }

        let frame = match MeshFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring malformed frame from {}: {}", from, e);
                self.inner.state.write().await.stats.malformed_frames += 1;
                return;
            }
        };

        debug!("Received {} from {}", frame.kind_name(), from);

        match frame {
            MeshFrame::RouteRequest(rreq) => self.handle_route_request(rreq, from).await,
            MeshFrame::RouteReply(rrep) => self.handle_route_reply(rrep, from).await,
            MeshFrame::Application(message) => self.route_message(message, Some(from)).await,
        }
    }

    /// Process a route request that arrived from `from`
    pub async fn handle_route_request(&self, mut rreq: RouteRequest, from: &NodeId) {
        let mut state = self.inner.state.write().await;

        if !state.history.insert(&rreq.dedup_key()) {
            state.stats.duplicates_dropped += 1;
            return;
        }

        self.learn_route(
            &mut state,
            &rreq.source,
            from,
            rreq.hop_count.saturating_add(1),
        );

        if rreq.destination == self.inner.node_id {
            let rrep = RouteReply {
                id: self.next_control_id(),
                source: rreq.source.clone(),
                destination: self.inner.node_id.clone(),
                hop_count: 0,
            };
            state.history.mark_seen(rrep.dedup_key());

            if let Some(frame) = encode(&MeshFrame::RouteReply(rrep)) {
                if send_to_peer(&state, from, &frame) {
                    state.stats.route_replies_sent += 1;
                }
            }
            debug!("Answered route request {} from {}", rreq.id, rreq.source);
            return;
        }

        rreq.hop_count = rreq.hop_count.saturating_add(1);
        if rreq.hop_count >= self.inner.config.max_hops {
            debug!(
                "Route request {} reached {} hops, not relaying",
                rreq.id, rreq.hop_count
            );
            return;
        }

        if let Some(frame) = encode(&MeshFrame::RouteRequest(rreq)) {
            if flood(&state, &frame, Some(from)) > 0 {
                state.stats.route_requests_relayed += 1;
            }
        }
    }

    /// Process a route reply that arrived from `from`
    pub async fn handle_route_reply(&self, mut rrep: RouteReply, from: &NodeId) {
        let mut state = self.inner.state.write().await;

        if !state.history.insert(&rrep.dedup_key()) {
            state.stats.duplicates_dropped += 1;
            return;
        }

        self.learn_route(
            &mut state,
            &rrep.destination,
            from,
            rrep.hop_count.saturating_add(1),
        );

        if rrep.source == self.inner.node_id {
            debug!("Route to {} established via {}", rrep.destination, from);
            return;
        }

        let Some(next_hop) = state.routes.next_hop(&rrep.source).cloned() else {
            state.stats.route_replies_dropped += 1;
            debug!("No reverse route to {}, dropping reply {}", rrep.source, rrep.id);
            return;
        };

        rrep.hop_count = rrep.hop_count.saturating_add(1);
        if let Some(frame) = encode(&MeshFrame::RouteReply(rrep)) {
            send_to_peer(&state, &next_hop, &frame);
        }
    }

    /// Connected peer IDs, sorted
    pub async fn peers(&self) -> Vec<NodeId> {
        sorted_peer_ids(&self.inner.state.read().await.peers)
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.state.read().await.peers.len()
    }

    pub async fn has_peer(&self, peer_id: &NodeId) -> bool {
        self.inner.state.read().await.peers.contains_key(peer_id)
    }

    pub async fn route(&self, destination: &NodeId) -> Option<RouteEntry> {
        self.inner.state.read().await.routes.get(destination).cloned()
    }

    pub async fn routes(&self) -> Vec<(NodeId, RouteEntry)> {
        self.inner.state.read().await.routes.snapshot()
    }

    pub async fn stats(&self) -> MeshStats {
        self.inner.state.read().await.stats.clone()
    }

    /// Evict expired keys from the deduplication history
    pub async fn cleanup_history(&self) -> usize {
        self.inner.state.write().await.history.cleanup_expired()
    }

    /// Close every peer link and stop pending retries
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let peers: Vec<Peer> = {
            let mut state = self.inner.state.write().await;
            state.routes.clear();
            state.peers.drain().map(|(_, peer)| peer).collect()
        };

        for peer in &peers {
            peer.disconnect();
        }

        info!(
            "Mesh node {} shut down ({} peer(s) closed)",
            self.inner.node_id,
            peers.len()
        );

        if !peers.is_empty() {
            self.notify_peers(Vec::new());
        }
    }

    fn deliver_local(&self, state: &mut MeshState, message: &ApplicationMessage) {
        state.stats.messages_delivered += 1;
        debug!("Delivering message {} locally", message.dedup_key());
        let _ = self.inner.message_tx.send(message.clone());
    }

    /// Send a unicast towards its next hop; false if there is no route or
    /// the next hop did not take the frame
    fn forward(&self, state: &mut MeshState, message: &ApplicationMessage) -> bool {
        let Some(target) = message.destination.node() else {
            return false;
        };
        let Some(next_hop) = state.routes.next_hop(target).cloned() else {
            return false;
        };
        let Some(frame) = encode(&MeshFrame::Application(message.clone())) else {
            return false;
        };

        if !send_to_peer(state, &next_hop, &frame) {
            debug!("Next hop {} for {} is not reachable", next_hop, target);
            return false;
        }
        state.stats.messages_forwarded += 1;
        true
    }

    fn discover_route(&self, state: &mut MeshState, destination: &NodeId) {
        let rreq = RouteRequest {
            id: self.next_control_id(),
            source: self.inner.node_id.clone(),
            destination: destination.clone(),
            hop_count: 0,
            timestamp: unix_millis(),
        };

        // Our own request echoing back must not be relayed again
        state.history.mark_seen(rreq.dedup_key());
        state.stats.route_discoveries += 1;

        if let Some(frame) = encode(&MeshFrame::RouteRequest(rreq)) {
            let sent = flood(state, &frame, None);
            debug!("Route request for {} sent to {} peer(s)", destination, sent);
        }
    }

    fn learn_route(&self, state: &mut MeshState, destination: &NodeId, via: &NodeId, hops: u32) {
        if destination == &self.inner.node_id {
            return;
        }
        if state
            .routes
            .update(destination.clone(), via.clone(), hops)
        {
            debug!("Route to {} via {} ({} hops)", destination, via, hops);
        }
    }

    fn spawn_retry(&self, message: ApplicationMessage) {
        let node = self.clone();
        tokio::spawn(async move {
            node.retry_delivery(message).await;
        });
    }

    async fn retry_delivery(&self, message: ApplicationMessage) {
        let policy = self.inner.config.retry.clone();
        let mut attempt = 1;

        while policy.allows(attempt) {
            tokio::time::sleep(policy.delay_for(attempt)).await;
            if self.is_shut_down() {
                return;
            }

            let mut state = self.inner.state.write().await;
            if self.forward(&mut state, &message) {
                debug!(
                    "Delivered {} on retry {}",
                    message.dedup_key(),
                    attempt
                );
                return;
            }

            if policy.allows(attempt + 1) {
                if let Some(target) = message.destination.node() {
                    self.discover_route(&mut state, target);
                }
            }
            attempt += 1;
        }

        let attempts = attempt - 1;
        if message.sender != self.inner.node_id {
            debug!(
                "Dropping relayed message {} for {}, no route",
                message.dedup_key(),
                message.destination
            );
            return;
        }

        self.inner.state.write().await.stats.undeliverable += 1;
        warn!(
            "No route to {} after {} retr{}, dropping message {}",
            message.destination,
            attempts,
            if attempts == 1 { "y" } else { "ies" },
            message.dedup_key()
        );
        let _ = self
            .inner
            .undeliverable_tx
            .send(Undeliverable { message, attempts });
    }

    fn next_control_id(&self) -> String {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.inner.node_id, sequence)
    }

    fn notify_peers(&self, peers: Vec<NodeId>) {
        let _ = self.inner.peer_tx.send(peers);
    }
}

fn sorted_peer_ids(peers: &HashMap<NodeId, Peer>) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = peers.keys().cloned().collect();
    ids.sort();
    ids
}

fn encode(frame: &MeshFrame) -> Option<String> {
    match frame.encode() {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!("Failed to encode {}: {}", frame.kind_name(), e);
            None
        }
    }
}

/// Queue `frame` on a peer's channel if it is open
fn transmit(peer: &Peer, frame: &str) -> bool {
    if !peer.channel.is_open() {
        return false;
    }
    match peer.channel.send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send to peer {}: {}", peer.peer_id, e);
            false
        }
    }
}

fn send_to_peer(state: &MeshState, peer_id: &NodeId, frame: &str) -> bool {
    state
        .peers
        .get(peer_id)
        .map(|peer| transmit(peer, frame))
        .unwrap_or(false)
}

/// Send `frame` to every peer except `except`; returns how many took it
fn flood(state: &MeshState, frame: &str, except: Option<&NodeId>) -> usize {
    state
        .peers
        .iter()
        .filter(|(peer_id, _)| Some(*peer_id) != except)
        .filter(|(_, peer)| transmit(peer, frame))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        closed: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn frames(&self) -> Vec<MeshFrame> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|raw| MeshFrame::decode(raw).unwrap())
                .collect()
        }
    }

    impl PeerChannel for RecordingChannel {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn send(&self, frame: &str) -> Result<()> {
            self.sent.lock().unwrap().push(frame.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestConnection {
        closed: AtomicBool,
    }

    impl PeerConnection for TestConnection {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn create_test_node(name: &str) -> (MeshNode, MeshEvents) {
        MeshNode::new(node(name), MeshConfig::default())
    }

    async fn attach(
        mesh: &MeshNode,
        name: &str,
    ) -> (Arc<RecordingChannel>, Arc<TestConnection>) {
        let channel = Arc::new(RecordingChannel::default());
        let connection = Arc::new(TestConnection::default());
        mesh.add_peer(node(name), channel.clone(), connection.clone())
            .await;
        (channel, connection)
    }

    fn message(sender: &str, destination: Destination, timestamp: u64) -> ApplicationMessage {
        ApplicationMessage::new(node(sender), destination, "hello", MessageKind::Text, timestamp)
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_peer_seeds_direct_route() {
        let (mesh, mut events) = create_test_node("a");
        attach(&mesh, "b").await;

        assert_eq!(
            mesh.route(&node("b")).await,
            Some(RouteEntry {
                next_hop: node("b"),
                hop_count: 1
            })
        );
        assert_eq!(events.peers.try_recv().unwrap(), vec![node("b")]);
        assert_eq!(mesh.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_add_self_is_refused() {
        let (mesh, _events) = create_test_node("a");
        let (_, connection) = attach(&mesh, "a").await;

        assert_eq!(mesh.peer_count().await, 0);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_remove_peer_purges_routes_through_it() {
        let (mesh, mut events) = create_test_node("a");
        let (_, connection) = attach(&mesh, "b").await;
        attach(&mesh, "d").await;
        mesh.handle_route_reply(
            RouteReply {
                id: "c-1".to_string(),
                source: node("a"),
                destination: node("c"),
                hop_count: 1,
            },
            &node("b"),
        )
        .await;
        assert_eq!(mesh.route(&node("c")).await.unwrap().hop_count, 2);

        assert!(mesh.remove_peer(&node("b")).await);

        assert!(connection.is_closed());
        assert!(!mesh.has_peer(&node("b")).await);
        assert!(mesh.route(&node("b")).await.is_none());
        assert!(mesh.route(&node("c")).await.is_none());
        assert!(mesh.route(&node("d")).await.is_some());

        events.peers.try_recv().unwrap();
        events.peers.try_recv().unwrap();
        assert_eq!(events.peers.try_recv().unwrap(), vec![node("d")]);
    }

    #[tokio::test]
    async fn test_remove_unknown_peer_is_noop() {
        let (mesh, mut events) = create_test_node("a");
        assert!(!mesh.remove_peer(&node("ghost")).await);
        assert!(events.peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_is_delivered_and_flooded_except_origin() {
        let (mesh, mut events) = create_test_node("a");
        let (from_b, _) = attach(&mesh, "b").await;
        let (to_c, _) = attach(&mesh, "c").await;

        mesh.route_message(message("b", Destination::Broadcast, 10), Some(&node("b")))
            .await;

        assert_eq!(events.messages.try_recv().unwrap().sender, node("b"));
        assert!(from_b.frames().is_empty());
        assert_eq!(to_c.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_messages_are_handled_once() {
        let (mesh, mut events) = create_test_node("a");
        let (to_c, _) = attach(&mesh, "c").await;
        attach(&mesh, "b").await;

        let msg = message("b", Destination::Broadcast, 10);
        mesh.route_message(msg.clone(), Some(&node("b"))).await;
        mesh.route_message(msg, Some(&node("c"))).await;

        assert!(events.messages.try_recv().is_ok());
        assert!(events.messages.try_recv().is_err());
        assert_eq!(to_c.frames().len(), 1);
        assert_eq!(mesh.stats().await.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_unicast_follows_next_hop_only() {
        let (mesh, mut events) = create_test_node("a");
        let (to_b, _) = attach(&mesh, "b").await;
        let (to_c, _) = attach(&mesh, "c").await;

        mesh.route_message(message("x", Destination::Node(node("b")), 1), Some(&node("c")))
            .await;

        assert!(events.messages.try_recv().is_err());
        assert_eq!(to_b.frames().len(), 1);
        assert!(to_c.frames().is_empty());
    }

    #[tokio::test]
    async fn test_unicast_for_us_is_not_forwarded() {
        let (mesh, mut events) = create_test_node("a");
        let (to_b, _) = attach(&mesh, "b").await;

        mesh.route_message(message("b", Destination::Node(node("a")), 1), Some(&node("b")))
            .await;

        assert_eq!(events.messages.try_recv().unwrap().payload, "hello");
        assert!(to_b.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_message_triggers_discovery_then_reports() {
        let (mesh, mut events) = create_test_node("a");
        let (to_b, _) = attach(&mesh, "b").await;

        let sent = mesh
            .send(Destination::Node(node("z")), "anyone?", MessageKind::Text)
            .await
            .unwrap();

        let frames = to_b.frames();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            MeshFrame::RouteRequest(rreq) => {
                assert_eq!(rreq.source, node("a"));
                assert_eq!(rreq.destination, node("z"));
                assert_eq!(rreq.hop_count, 0);
                assert_eq!(rreq.id, "a-1");
            }
            other => panic!("expected route request, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let report = events.undeliverable.try_recv().unwrap();
        assert_eq!(report.message, sent);
        assert_eq!(report.attempts, 1);
        assert_eq!(mesh.stats().await.undeliverable, 1);
        // Single retry by default: no second discovery
        assert_eq!(to_b.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delivers_once_route_appears() {
        let (mesh, mut events) = create_test_node("a");
        let (to_b, _) = attach(&mesh, "b").await;

        mesh.send(Destination::Node(node("c")), "hi c", MessageKind::Voice)
            .await
            .unwrap();

        mesh.handle_route_reply(
            RouteReply {
                id: "c-1".to_string(),
                source: node("a"),
                destination: node("c"),
                hop_count: 0,
            },
            &node("b"),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let frames = to_b.frames();
        assert_eq!(frames.len(), 2);
        match &frames[1] {
            MeshFrame::Application(msg) => {
                assert_eq!(msg.payload, "hi c");
                assert_eq!(msg.kind, MessageKind::Voice);
            }
            other => panic!("expected application message, got {:?}", other),
        }
        assert!(events.undeliverable.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_with_backoff() {
        let config = MeshConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 100,
                backoff_multiplier: 2.0,
                max_delay_ms: 10_000,
            },
            ..Default::default()
        };
        let (mesh, mut events) = MeshNode::new(node("a"), config);
        let (to_b, _) = attach(&mesh, "b").await;

        mesh.send(Destination::Node(node("z")), "x", MessageKind::Text)
            .await
            .unwrap();

        // Discoveries at t=0, t=100ms, t=300ms; give up at t=700ms
        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(to_b.frames().len(), 3);
        assert!(events.undeliverable.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(events.undeliverable.try_recv().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_route_request_for_us_is_answered() {
        let (mesh, _events) = create_test_node("c");
        let (to_b, _) = attach(&mesh, "b").await;

        mesh.handle_route_request(
            RouteRequest {
                id: "a-1".to_string(),
                source: node("a"),
                destination: node("c"),
                hop_count: 1,
                timestamp: 0,
            },
            &node("b"),
        )
        .await;

        assert_eq!(
            mesh.route(&node("a")).await,
            Some(RouteEntry {
                next_hop: node("b"),
                hop_count: 2
            })
        );

        match &to_b.frames()[..] {
            [MeshFrame::RouteReply(rrep)] => {
                assert_eq!(rrep.source, node("a"));
                assert_eq!(rrep.destination, node("c"));
                assert_eq!(rrep.hop_count, 0);
            }
            other => panic!("expected one route reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_request_is_relayed_once() {
        let (mesh, _events) = create_test_node("b");
        let (to_a, _) = attach(&mesh, "a").await;
        let (to_c, _) = attach(&mesh, "c").await;
        let (to_d, _) = attach(&mesh, "d").await;

        let rreq = RouteRequest {
            id: "a-7".to_string(),
            source: node("a"),
            destination: node("z"),
            hop_count: 0,
            timestamp: 0,
        };
        mesh.handle_route_request(rreq.clone(), &node("a")).await;
        mesh.handle_route_request(rreq, &node("c")).await;

        assert!(to_a.frames().is_empty());
        assert_eq!(to_d.frames().len(), 1);
        match &to_c.frames()[..] {
            [MeshFrame::RouteRequest(relayed)] => assert_eq!(relayed.hop_count, 1),
            other => panic!("expected relayed request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_request_hop_limit() {
        let config = MeshConfig {
            max_hops: 3,
            ..Default::default()
        };
        let (mesh, _events) = MeshNode::new(node("b"), config);
        attach(&mesh, "a").await;
        let (to_c, _) = attach(&mesh, "c").await;

        mesh.handle_route_request(
            RouteRequest {
                id: "a-1".to_string(),
                source: node("a"),
                destination: node("z"),
                hop_count: 2,
                timestamp: 0,
            },
            &node("a"),
        )
        .await;

        assert!(to_c.frames().is_empty());
    }

    #[tokio::test]
    async fn test_route_reply_relayed_along_reverse_path() {
        let (mesh, _events) = create_test_node("b");
        let (to_a, _) = attach(&mesh, "a").await;
        attach(&mesh, "c").await;

        mesh.handle_route_reply(
            RouteReply {
                id: "c-1".to_string(),
                source: node("a"),
                destination: node("c"),
                hop_count: 0,
            },
            &node("c"),
        )
        .await;

        match &to_a.frames()[..] {
            [MeshFrame::RouteReply(rrep)] => assert_eq!(rrep.hop_count, 1),
            other => panic!("expected relayed reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_reply_without_reverse_route_is_dropped() {
        let (mesh, _events) = create_test_node("b");
        let (to_c, _) = attach(&mesh, "c").await;

        mesh.handle_route_reply(
            RouteReply {
                id: "c-1".to_string(),
                source: node("q"),
                destination: node("c"),
                hop_count: 0,
            },
            &node("c"),
        )
        .await;

        assert!(to_c.frames().is_empty());
        assert_eq!(mesh.stats().await.route_replies_dropped, 1);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let (mesh, mut events) = create_test_node("a");
        attach(&mesh, "b").await;

        mesh.receive_frame(&node("b"), "{not json").await;
        mesh.receive_frame(&node("b"), r#"{"type":"RREQ"}"#).await;

        assert_eq!(mesh.stats().await.malformed_frames, 2);
        assert!(events.messages.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaying_node_without_route_drops_silently() {
        let (mesh, mut events) = create_test_node("b");
        let (to_a, _) = attach(&mesh, "a").await;

        mesh.route_message(message("a", Destination::Node(node("z")), 1), Some(&node("a")))
            .await;

        // Discovery still runs on behalf of the relayed message
        assert!(matches!(to_a.frames()[0], MeshFrame::RouteRequest(_)));

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(events.undeliverable.try_recv().is_err());
        assert_eq!(mesh.stats().await.undeliverable, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_next_hop_is_not_delivery() {
        let (mesh, mut events) = create_test_node("a");
        let (to_b, _) = attach(&mesh, "b").await;
        to_b.closed.store(true, Ordering::SeqCst);

        let sent = mesh
            .send(Destination::Node(node("b")), "still there?", MessageKind::Text)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!(to_b.frames().is_empty());
        let report = events.undeliverable.try_recv().unwrap();
        assert_eq!(report.message, sent);
        let stats = mesh.stats().await;
        assert_eq!(stats.messages_forwarded, 0);
        assert_eq!(stats.undeliverable, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_is_skipped() {
        let (mesh, _events) = create_test_node("a");
        let (to_b, _) = attach(&mesh, "b").await;
        to_b.closed.store(true, Ordering::SeqCst);

        mesh.send(Destination::Broadcast, "hi", MessageKind::Text)
            .await
            .unwrap();

        assert!(to_b.frames().is_empty());
    }

    #[tokio::test]
    async fn test_local_timestamps_are_unique() {
        let (mesh, _events) = create_test_node("a");
        let first = mesh
            .send(Destination::Broadcast, "1", MessageKind::Text)
            .await
            .unwrap();
        let second = mesh
            .send(Destination::Broadcast, "2", MessageKind::Text)
            .await
            .unwrap();

        assert!(second.timestamp > first.timestamp);
        assert_ne!(first.dedup_key(), second.dedup_key());
    }

    #[tokio::test]
    async fn test_shutdown_closes_links_and_is_idempotent() {
        let (mesh, mut events) = create_test_node("a");
        let (_, connection) = attach(&mesh, "b").await;
        events.peers.try_recv().unwrap();

        mesh.shutdown().await;
        mesh.shutdown().await;

        assert!(connection.is_closed());
        assert_eq!(mesh.peer_count().await, 0);
        assert_eq!(events.peers.try_recv().unwrap(), Vec::<NodeId>::new());
        assert!(events.peers.try_recv().is_err());
        assert!(matches!(
            mesh.send(Destination::Broadcast, "late", MessageKind::Text)
                .await,
            Err(RoutingError::ShutDown)
        ));
    }
}
