//! Rendezvous room logic
//!
//! - `join` registers the sender in a room, answers with the current
//!   `peer-list` and announces `peer-joined` to everybody else
//! - `offer`, `answer` and `ice-candidate` are relayed to their target in
//!   the sender's room
//! - a member leaves its room when its session ends

use meshradio_protocol::{NodeId, SignalMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

type Members = HashMap<NodeId, mpsc::UnboundedSender<SignalMessage>>;

/// In-process rendezvous server state
pub struct RendezvousHub {
    rooms: RwLock<HashMap<String, Members>>,
    generation: watch::Sender<u64>,
}

impl Default for RendezvousHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousHub {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        RendezvousHub {
            rooms: RwLock::new(HashMap::new()),
            generation,
        }
    }

    /// Serve one client session until it ends or the hub drops everybody
    ///
    /// `inbound` carries what the client sent; replies and relayed frames
    /// are written to `outbound`.
    pub async fn serve(
        &self,
        mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
        outbound: mpsc::UnboundedSender<SignalMessage>,
    ) {
        let mut generation = self.generation.subscribe();

        let mut membership: Option<(String, NodeId)> = None;

        loop {
            let message = tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = generation.changed() => break,
            };

            match message {
                SignalMessage::Join { id, room } => {
                    if membership.is_some() {
                        debug!("{} sent a second join, ignoring", id);
                        continue;
                    }
                    self.join(&room, &id, &outbound).await;
                    membership = Some((room, id));
                }
                SignalMessage::Offer { .. }
                | SignalMessage::Answer { .. }
                | SignalMessage::IceCandidate { .. } => {
                    let Some((room, id)) = &membership else {
                        debug!("Dropping {} from a client that never joined", message.type_name());
                        continue;
                    };
                    if message.sender() != Some(id) {
                        debug!("Dropping {} with forged sender from {}", message.type_name(), id);
                        continue;
                    }
                    self.relay(room, message).await;
                }
                other => {
                    debug!("Ignoring {} from client", other.type_name());
                }
            }
        }

        if let Some((room, id)) = membership {
            self.leave(&room, &id, &outbound).await;
        }
    }

    async fn join(&self, room: &str, id: &NodeId, outbound: &mpsc::UnboundedSender<SignalMessage>) {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();

        let mut peers: Vec<NodeId> = members.keys().filter(|peer| *peer != id).cloned().collect();
        peers.sort();

        for (peer, sender) in members.iter() {
            if peer != id {
                let _ = sender.send(SignalMessage::PeerJoined { id: id.clone() });
            }
        }
        let _ = outbound.send(SignalMessage::PeerList { peers });

        members.insert(id.clone(), outbound.clone());
        info!("{} joined room {} ({} members)", id, room, members.len());
    }

    async fn relay(&self, room: &str, message: SignalMessage) {
        let rooms = self.rooms.read().await;
        let target = message.target().and_then(|target| {
            rooms
                .get(room)
                .and_then(|members| members.get(target))
                .map(|sender| (target.clone(), sender))
        });

        match target {
            Some((target, sender)) => {
                debug!("Relaying {} to {}", message.type_name(), target);
                let _ = sender.send(message);
            }
            None => debug!("No member to relay {} to", message.type_name()),
        }
    }

    async fn leave(&self, room: &str, id: &NodeId, outbound: &mpsc::UnboundedSender<SignalMessage>) {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return;
        };

        // A rejoin under the same id replaced our sender; leave it alone
        if members
            .get(id)
            .map(|sender| sender.same_channel(outbound))
            .unwrap_or(false)
        {
            members.remove(id);
            info!("{} left room {}", id, room);
        }
        if members.is_empty() {
            rooms.remove(room);
        }
    }

    /// Members currently in `room`, sorted
    pub async fn members(&self, room: &str) -> Vec<NodeId> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<NodeId> = rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// End every session currently being served
    pub async fn disconnect_all(&self) {
        self.generation.send_modify(|generation| *generation += 1);
        self.rooms.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshradio_protocol::SessionDescription;
    use std::sync::Arc;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    struct Client {
        tx: mpsc::UnboundedSender<SignalMessage>,
        rx: mpsc::UnboundedReceiver<SignalMessage>,
    }

    fn connect(hub: &Arc<RendezvousHub>) -> Client {
        let (client_tx, hub_rx) = mpsc::unbounded_channel();
        let (hub_tx, client_rx) = mpsc::unbounded_channel();
        let hub = Arc::clone(hub);
        tokio::spawn(async move { hub.serve(hub_rx, hub_tx).await });
        Client {
            tx: client_tx,
            rx: client_rx,
        }
    }

    async fn join(client: &mut Client, id: &str) -> SignalMessage {
        client
            .tx
            .send(SignalMessage::Join {
                id: node(id),
                room: "mesh-radio".to_string(),
            })
            .unwrap();
        client.rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_join_returns_roster_and_announces() {
        let hub = Arc::new(RendezvousHub::new());
        let mut a = connect(&hub);
        let mut b = connect(&hub);

        assert_eq!(join(&mut a, "a").await, SignalMessage::PeerList { peers: vec![] });
        assert_eq!(
            join(&mut b, "b").await,
            SignalMessage::PeerList {
                peers: vec![node("a")]
            }
        );
        assert_eq!(
            a.rx.recv().await.unwrap(),
            SignalMessage::PeerJoined { id: node("b") }
        );
        assert_eq!(hub.members("mesh-radio").await, vec![node("a"), node("b")]);
    }

    #[tokio::test]
    async fn test_targeted_relay() {
        let hub = Arc::new(RendezvousHub::new());
        let mut a = connect(&hub);
        let mut b = connect(&hub);
        let mut c = connect(&hub);
        join(&mut a, "a").await;
        join(&mut b, "b").await;
        join(&mut c, "c").await;
        a.rx.recv().await.unwrap();
        a.rx.recv().await.unwrap();
        b.rx.recv().await.unwrap();

        let offer = SignalMessage::Offer {
            offer: SessionDescription::offer("x"),
            target: node("c"),
            from: node("a"),
        };
        a.tx.send(offer.clone()).unwrap();

        assert_eq!(c.rx.recv().await.unwrap(), offer);
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forged_sender_is_not_relayed() {
        let hub = Arc::new(RendezvousHub::new());
        let mut a = connect(&hub);
        let mut b = connect(&hub);
        join(&mut a, "a").await;
        join(&mut b, "b").await;
        a.rx.recv().await.unwrap();

        a.tx.send(SignalMessage::Answer {
            answer: SessionDescription::answer("x"),
            target: node("b"),
            from: node("mallory"),
        })
        .unwrap();
        // Round-trip through the hub so the forged frame has been processed
        a.tx.send(SignalMessage::Offer {
            offer: SessionDescription::offer("y"),
            target: node("b"),
            from: node("a"),
        })
        .unwrap();

        match b.rx.recv().await.unwrap() {
            SignalMessage::Offer { from, .. } => assert_eq!(from, node("a")),
            other => panic!("unexpected relay: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_member_leaves_when_session_ends() {
        let hub = Arc::new(RendezvousHub::new());
        let mut a = connect(&hub);
        join(&mut a, "a").await;

        drop(a);
        for _ in 0..10 {
            if hub.members("mesh-radio").await.is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("member was not removed");
    }

    #[tokio::test]
    async fn test_disconnect_all_ends_sessions() {
        let hub = Arc::new(RendezvousHub::new());
        let mut a = connect(&hub);
        join(&mut a, "a").await;

        hub.disconnect_all().await;

        assert!(a.rx.recv().await.is_none());
    }
}
