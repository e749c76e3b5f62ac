//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default rendezvous room
pub const DEFAULT_ROOM: &str = "mesh-radio";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Rendezvous room to join
    pub room: String,

    /// Delay before reopening a dropped or unreachable rendezvous session
    pub reconnect_delay_secs: u64,

    /// Local discovery records older than this are pruned
    pub discovery_window_secs: u64,

    /// A negotiation that has not opened a channel by then is abandoned
    pub negotiation_timeout_secs: u64,

    /// Ask transports for ordered data channels
    pub ordered_channels: bool,

    /// How often the fallback mailbox is polled in local discovery mode
    pub mailbox_poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            room: DEFAULT_ROOM.to_string(),
            reconnect_delay_secs: 5,
            discovery_window_secs: 300,
            negotiation_timeout_secs: 30,
            ordered_channels: false,
            mailbox_poll_interval_ms: 1000,
        }
    }
}

impl OrchestratorConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn discovery_window_ms(&self) -> u64 {
        self.discovery_window_secs.saturating_mul(1000)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn mailbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mailbox_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.room, "mesh-radio");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.discovery_window_ms(), 300_000);
        assert!(!config.ordered_channels);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(r#"{"room":"lab"}"#).unwrap();
        assert_eq!(config.room, "lab");
        assert_eq!(config.negotiation_timeout_secs, 30);
    }
}
