//! Recently delivered messages, for the console and the HTTP API

use meshradio_protocol::ApplicationMessage;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Bounded log of delivered messages, oldest dropped first
pub struct Inbox {
    capacity: usize,
    messages: RwLock<VecDeque<ApplicationMessage>>,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, message: ApplicationMessage) {
        let mut messages = self.messages.write().await;
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(message);
    }

    /// Up to `limit` messages, newest last
    pub async fn recent(&self, limit: usize) -> Vec<ApplicationMessage> {
        let messages = self.messages.read().await;
        let skip = messages.len().saturating_sub(limit);
        messages.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}
