//! MeshRadio Message Routing
//!
//! This module implements the mesh node core:
//! - On-demand route discovery (route requests flooded, replies unicast back)
//! - Best-known-path routing table
//! - Broadcast flooding with loop suppression
//! - Bounded message deduplication
//! - Deferred delivery retries with backoff

pub mod config;
pub mod deduplication;
pub mod error;
pub mod node;
pub mod peer;
pub mod retry;
pub mod routing_table;

pub use config::MeshConfig;
pub use deduplication::DeduplicationCache;
pub use error::{Result, RoutingError};
pub use node::{MeshEvents, MeshNode, MeshStats, Undeliverable};
pub use peer::{Peer, PeerChannel, PeerConnection};
pub use retry::RetryPolicy;
pub use routing_table::{RouteEntry, RoutingTable};

/// Size of message deduplication cache
pub const MESSAGE_DEDUP_CACHE_SIZE: usize = 10_000;

/// Message deduplication TTL (seconds)
pub const MESSAGE_DEDUP_TTL_SECS: u64 = 3600; // 1 hour

/// Hop count at which route requests stop being re-flooded
pub const DEFAULT_MAX_HOPS: u32 = 16;
