//! Message deduplication history
//!
//! Remembers the keys of messages and control frames this node already
//! processed. The history is bounded both by size (least recently inserted
//! keys are evicted first) and by age.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct DeduplicationCache {
    entries: LruCache<String, Instant>,
    ttl: Duration,
}

impl DeduplicationCache {
    /// Create a cache holding at most `capacity` keys for `ttl_secs` each
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        DeduplicationCache {
            entries: LruCache::new(capacity),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Whether `key` was seen and has not expired yet
    pub fn has_seen(&mut self, key: &str) -> bool {
        match self.entries.peek(key) {
            Some(seen_at) if seen_at.elapsed() < self.ttl => true,
            Some(_) => {
                self.entries.pop(key);
                false
            }
            None => false,
        }
    }

    /// Record `key` as seen now
    pub fn mark_seen(&mut self, key: String) {
        self.entries.put(key, Instant::now());
    }

    /// Record `key` and report whether it was new
    pub fn insert(&mut self, key: &str) -> bool {
        if self.has_seen(key) {
            return false;
        }
        self.mark_seen(key.to_string());
        true
    }

    /// Drop expired keys, returning how many were removed
    pub fn cleanup_expired(&mut self) -> usize {
        let mut removed = 0;
        while let Some((_, seen_at)) = self.entries.peek_lru() {
            if seen_at.elapsed() < self.ttl {
                break;
            }
            self.entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
