//! Best-known-path routing table
//!
//! Maps a destination to the direct peer to forward through and the number
//! of hops along that path. An entry is only ever replaced by a strictly
//! shorter path.

use meshradio_protocol::NodeId;
use serde::Serialize;
use std::collections::HashMap;

/// Route towards a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub next_hop: NodeId,
    pub hop_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<NodeId, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a path to `destination`; returns whether the table changed
    ///
    /// Equal or longer paths never overwrite an existing entry.
    pub fn update(&mut self, destination: NodeId, next_hop: NodeId, hop_count: u32) -> bool {
        match self.routes.get(&destination) {
            Some(existing) if existing.hop_count <= hop_count => false,
            _ => {
                self.routes.insert(
                    destination,
                    RouteEntry {
                        next_hop,
                        hop_count,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    pub fn next_hop(&self, destination: &NodeId) -> Option<&NodeId> {
        self.routes.get(destination).map(|entry| &entry.next_hop)
    }

    pub fn remove(&mut self, destination: &NodeId) -> Option<RouteEntry> {
        self.routes.remove(destination)
    }

    /// Remove every route forwarding through `peer`, returning the
    /// destinations that became unreachable
    pub fn purge_via(&mut self, peer: &NodeId) -> Vec<NodeId> {
        let lost: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|(_, entry)| &entry.next_hop == peer)
            .map(|(destination, _)| destination.clone())
            .collect();

        for destination in &lost {
            self.routes.remove(destination);
        }

        lost
    }

    /// All routes, ordered by destination
    pub fn snapshot(&self) -> Vec<(NodeId, RouteEntry)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(destination, entry)| (destination.clone(), entry.clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}
