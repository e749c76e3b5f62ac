//! Mesh node configuration

use crate::retry::RetryPolicy;
use crate::{DEFAULT_MAX_HOPS, MESSAGE_DEDUP_CACHE_SIZE, MESSAGE_DEDUP_TTL_SECS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Most message keys remembered at once
    pub dedup_capacity: usize,
    /// How long a message key is remembered
    pub dedup_ttl_secs: u64,
    /// Route requests that travelled this many hops are not re-flooded
    pub max_hops: u32,
    pub retry: RetryPolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            dedup_capacity: MESSAGE_DEDUP_CACHE_SIZE,
            dedup_ttl_secs: MESSAGE_DEDUP_TTL_SECS,
            max_hops: DEFAULT_MAX_HOPS,
            retry: RetryPolicy::default(),
        }
    }
}
