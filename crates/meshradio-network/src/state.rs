//! Per-peer connection state machine
//!
//! ```text
//! unknown -> pending -> open -> closed
//!               |                 ^
//!               +-----------------+
//! ```
//!
//! A closed peer can only come back through a fresh pending cycle.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Unknown,
    Pending,
    Open,
    Closed,
}

impl PeerState {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Unknown, Pending)
                | (Closed, Pending)
                | (Pending, Open)
                | (Pending, Closed)
                | (Open, Closed)
        )
    }

    /// Whether a new negotiation may start from this state
    pub fn accepts_negotiation(self) -> bool {
        self.can_transition_to(PeerState::Pending)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Unknown => write!(f, "unknown"),
            PeerState::Pending => write!(f, "pending"),
            PeerState::Open => write!(f, "open"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}
