// ABOUTME: Per-partition idempotency cache mapping keys to external message ids
// ABOUTME: A hit answers the caller without touching the adapter

use std::num::NonZeroUsize;

use lru::LruCache;

/// Bounded map `idempotency_key -> external_message_id`, owned by exactly
/// one partition (no cross-partition sharing). Only successful sends are
/// recorded.
#[derive(Debug)]
pub struct IdempotencyCache {
    sent: LruCache<String, String>,
}

impl IdempotencyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { sent: LruCache::new(capacity) }
    }

    /// External message id for a key already sent, if any.
    pub fn lookup(&mut self, key: &str) -> Option<String> {
        self.sent.get(key).cloned()
    }

    /// Record a successful send.
    pub fn record(&mut self, key: impl Into<String>, external_message_id: impl Into<String>) {
        self.sent.put(key.into(), external_message_id.into());
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_after_record() {
        let mut cache = IdempotencyCache::new(8);
        assert_eq!(cache.lookup("k1"), None);
        cache.record("k1", "ext-9");
        assert_eq!(cache.lookup("k1"), Some("ext-9".to_string()));
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let mut cache = IdempotencyCache::new(2);
        cache.record("a", "1");
        cache.record("b", "2");
        // touch "a" so "b" is the least recently used
        cache.lookup("a");
        cache.record("c", "3");
        assert_eq!(cache.lookup("a"), Some("1".to_string()));
        assert_eq!(cache.lookup("b"), None);
        assert_eq!(cache.lookup("c"), Some("3".to_string()));
    }
}
