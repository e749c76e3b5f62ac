//! Local discovery records
//!
//! When no rendezvous server is reachable, nodes sharing a store append
//! themselves to a list of `{id, timestamp}` records and try to reach every
//! other record that is still fresh.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Default freshness window for discovery records (5 minutes)
pub const DEFAULT_DISCOVERY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// A node seen in the shared discovery store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: NodeId,
    /// Last announcement (Unix milliseconds)
    pub timestamp: u64,
}

impl PeerRecord {
    pub fn new(id: NodeId, timestamp: u64) -> Self {
        PeerRecord { id, timestamp }
    }

    /// Whether this record is younger than `window_ms` at `now`
    pub fn is_fresh(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.timestamp) < window_ms
    }
}

/// Append `local` to `records` and drop everything stale
///
/// Earlier records of `local` are replaced so repeated announcements do not
/// pile up.
pub fn announce_and_prune(
    records: Vec<PeerRecord>,
    local: &NodeId,
    now: u64,
    window_ms: u64,
) -> Vec<PeerRecord> {
    let mut records: Vec<PeerRecord> = records
        .into_iter()
        .filter(|r| &r.id != local && r.is_fresh(now, window_ms))
        .collect();

    records.push(PeerRecord::new(local.clone(), now));
    records
}

/// Fresh records other than `local`, newest announcement per node
pub fn live_peers(records: &[PeerRecord], local: &NodeId, now: u64, window_ms: u64) -> Vec<NodeId> {
    let mut peers: Vec<NodeId> = Vec::new();
    for record in records {
        if &record.id == local || !record.is_fresh(now, window_ms) {
            continue;
        }
        if !peers.contains(&record.id) {
            peers.push(record.id.clone());
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    #[test]
    fn test_announce_prunes_stale_records() {
        let now = 10 * DEFAULT_DISCOVERY_WINDOW_MS;
        let records = vec![
            PeerRecord::new(node("old"), now - DEFAULT_DISCOVERY_WINDOW_MS),
            PeerRecord::new(node("recent"), now - 1_000),
        ];

        let updated = announce_and_prune(records, &node("me"), now, DEFAULT_DISCOVERY_WINDOW_MS);

        let ids: Vec<&str> = updated.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["recent", "me"]);
        assert_eq!(updated[1].timestamp, now);
    }

    #[test]
    fn test_announce_replaces_own_record() {
        let records = vec![PeerRecord::new(node("me"), 100)];
        let updated = announce_and_prune(records, &node("me"), 200, DEFAULT_DISCOVERY_WINDOW_MS);
        assert_eq!(updated, vec![PeerRecord::new(node("me"), 200)]);
    }

    #[test]
    fn test_live_peers_excludes_self_and_duplicates() {
        let records = vec![
            PeerRecord::new(node("me"), 100),
            PeerRecord::new(node("a"), 100),
            PeerRecord::new(node("a"), 150),
            PeerRecord::new(node("b"), 150),
        ];
        let peers = live_peers(&records, &node("me"), 200, DEFAULT_DISCOVERY_WINDOW_MS);
        assert_eq!(peers, vec![node("a"), node("b")]);
    }

    #[test]
    fn test_record_store_format() {
        let json = serde_json::to_string(&vec![PeerRecord::new(node("a"), 42)]).unwrap();
        assert_eq!(json, r#"[{"id":"a","timestamp":42}]"#);
    }
}
