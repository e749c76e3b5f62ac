//! Multi-node routing scenarios
//!
//! Nodes are wired together through an in-process "air" queue; `pump` hands
//! every queued frame to its receiver until the mesh goes quiet.

use meshradio_protocol::{ApplicationMessage, Destination, MessageKind, NodeId};
use meshradio_routing::{
    MeshConfig, MeshEvents, MeshNode, PeerChannel, PeerConnection, RouteEntry, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Frame = (NodeId, NodeId, String);

struct WireLink {
    from: NodeId,
    to: NodeId,
    closed: AtomicBool,
    air: mpsc::UnboundedSender<Frame>,
}

impl PeerChannel for WireLink {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &str) -> Result<()> {
        let _ = self
            .air
            .send((self.from.clone(), self.to.clone(), frame.to_string()));
        Ok(())
    }
}

impl PeerConnection for WireLink {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct TestMesh {
    nodes: HashMap<NodeId, MeshNode>,
    events: HashMap<NodeId, MeshEvents>,
    air_tx: mpsc::UnboundedSender<Frame>,
    air_rx: mpsc::UnboundedReceiver<Frame>,
    frames_pumped: usize,
}

impl TestMesh {
    fn new(names: &[&str]) -> Self {
        let (air_tx, air_rx) = mpsc::unbounded_channel();
        let mut nodes = HashMap::new();
        let mut events = HashMap::new();
        for name in names {
            let (node, node_events) = MeshNode::new(id(name), MeshConfig::default());
            nodes.insert(id(name), node);
            events.insert(id(name), node_events);
        }
        TestMesh {
            nodes,
            events,
            air_tx,
            air_rx,
            frames_pumped: 0,
        }
    }

    fn node(&self, name: &str) -> &MeshNode {
        &self.nodes[&id(name)]
    }

    async fn link(&self, a: &str, b: &str) {
        self.attach(a, b).await;
        self.attach(b, a).await;
    }

    async fn attach(&self, local: &str, remote: &str) {
        let link = Arc::new(WireLink {
            from: id(local),
            to: id(remote),
            closed: AtomicBool::new(false),
            air: self.air_tx.clone(),
        });
        self.node(local)
            .add_peer(id(remote), link.clone(), link)
            .await;
    }

    /// Deliver queued frames until none are left
    async fn pump(&mut self) {
        while let Ok((from, to, frame)) = self.air_rx.try_recv() {
            self.frames_pumped += 1;
            if let Some(node) = self.nodes.get(&to) {
                node.receive_frame(&from, &frame).await;
            }
        }
    }

    fn delivered(&mut self, name: &str) -> Vec<ApplicationMessage> {
        let events = self.events.get_mut(&id(name)).unwrap();
        let mut messages = Vec::new();
        while let Ok(message) = events.messages.try_recv() {
            messages.push(message);
        }
        messages
    }
}

fn id(name: &str) -> NodeId {
    NodeId::parse(name).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_line_topology_discovers_two_hop_route() {
    let mut mesh = TestMesh::new(&["a", "b", "c"]);
    mesh.link("a", "b").await;
    mesh.link("b", "c").await;

    mesh.node("a")
        .send(Destination::Node(id("c")), "over the hill", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;

    assert_eq!(
        mesh.node("a").route(&id("c")).await,
        Some(RouteEntry {
            next_hop: id("b"),
            hop_count: 2
        })
    );
    assert_eq!(mesh.node("c").route(&id("a")).await.unwrap().hop_count, 2);
    assert!(mesh.delivered("c").is_empty());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    mesh.pump().await;

    let at_c = mesh.delivered("c");
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].payload, "over the hill");
    assert_eq!(at_c[0].sender, id("a"));
    assert!(mesh.delivered("b").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_known_route_delivers_without_retry() {
    let mut mesh = TestMesh::new(&["a", "b", "c"]);
    mesh.link("a", "b").await;
    mesh.link("b", "c").await;

    mesh.node("a")
        .send(Destination::Node(id("c")), "first", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    mesh.pump().await;
    mesh.delivered("c");

    mesh.node("a")
        .send(Destination::Node(id("c")), "second", MessageKind::Voice)
        .await
        .unwrap();
    mesh.pump().await;

    let at_c = mesh.delivered("c");
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].kind, MessageKind::Voice);
}

#[tokio::test]
async fn test_triangle_broadcast_delivered_once_everywhere() {
    let mut mesh = TestMesh::new(&["a", "b", "c"]);
    mesh.link("a", "b").await;
    mesh.link("b", "c").await;
    mesh.link("a", "c").await;

    mesh.node("a")
        .send(Destination::Broadcast, "hello all", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;

    for name in ["a", "b", "c"] {
        assert_eq!(mesh.delivered(name).len(), 1, "node {}", name);
    }
}

#[tokio::test]
async fn test_broadcast_terminates_in_a_ring() {
    let names = ["n0", "n1", "n2", "n3", "n4", "n5"];
    let mut mesh = TestMesh::new(&names);
    for i in 0..names.len() {
        mesh.link(names[i], names[(i + 1) % names.len()]).await;
    }

    mesh.node("n0")
        .send(Destination::Broadcast, "around", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;

    for name in names {
        assert_eq!(mesh.delivered(name).len(), 1, "node {}", name);
    }
    // Every node sends at most once to each neighbour
    assert!(mesh.frames_pumped <= 2 * names.len());

    let stats = mesh.node("n3").stats().await;
    assert!(stats.duplicates_dropped <= 1);
}

#[tokio::test(start_paused = true)]
async fn test_ring_unicast_arrives_once() {
    let names = ["a", "b", "c", "d"];
    let mut mesh = TestMesh::new(&names);
    for i in 0..names.len() {
        mesh.link(names[i], names[(i + 1) % names.len()]).await;
    }

    mesh.node("a")
        .send(Destination::Node(id("c")), "across", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;

    let route = mesh.node("a").route(&id("c")).await.unwrap();
    assert_eq!(route.hop_count, 2);
    assert!(route.next_hop == id("b") || route.next_hop == id("d"));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    mesh.pump().await;

    assert_eq!(mesh.delivered("c").len(), 1);
    for name in ["a", "b", "d"] {
        assert!(mesh.delivered(name).is_empty(), "node {}", name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_removing_peer_invalidates_learned_routes() {
    let mut mesh = TestMesh::new(&["a", "b", "c"]);
    mesh.link("a", "b").await;
    mesh.link("b", "c").await;

    mesh.node("a")
        .send(Destination::Node(id("c")), "x", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;
    assert!(mesh.node("a").route(&id("c")).await.is_some());

    assert!(mesh.node("a").remove_peer(&id("b")).await);

    assert!(mesh.node("a").route(&id("b")).await.is_none());
    assert!(mesh.node("a").route(&id("c")).await.is_none());
    assert!(mesh.node("a").routes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_destination_is_reported_undeliverable() {
    let mut mesh = TestMesh::new(&["a", "b", "island"]);
    mesh.link("a", "b").await;

    let sent = mesh
        .node("a")
        .send(Destination::Node(id("island")), "anyone?", MessageKind::Text)
        .await
        .unwrap();
    mesh.pump().await;

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    mesh.pump().await;

    let events = mesh.events.get_mut(&id("a")).unwrap();
    let report = events.undeliverable.try_recv().unwrap();
    assert_eq!(report.message, sent);
    assert!(mesh.delivered("island").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_retries() {
    let mut mesh = TestMesh::new(&["a", "b"]);
    mesh.link("a", "b").await;

    mesh.node("a")
        .send(Destination::Node(id("nowhere")), "x", MessageKind::Text)
        .await
        .unwrap();
    mesh.node("a").shutdown().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    mesh.pump().await;

    let events = mesh.events.get_mut(&id("a")).unwrap();
    assert!(events.undeliverable.try_recv().is_err());
    assert_eq!(mesh.node("a").peer_count().await, 0);
}
