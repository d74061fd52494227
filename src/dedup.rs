// ABOUTME: At-most-once inbound gate keyed by message fingerprint
// ABOUTME: Sharded LRU with TTL; concurrent readers, serialized writers per shard

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use switchboard_core::config::DedupConfig;

/// Identity of an incoming message across the whole instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub channel: String,
    pub bridge_id: String,
    pub external_room_id: String,
    pub external_message_id: String,
}

impl Fingerprint {
    pub fn new(
        channel: impl Into<String>,
        bridge_id: impl Into<String>,
        external_room_id: impl Into<String>,
        external_message_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            bridge_id: bridge_id.into(),
            external_room_id: external_room_id.into(),
            external_message_id: external_message_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    New,
    Duplicate,
}

struct Shard {
    seen: Mutex<LruCache<Fingerprint, Instant>>,
}

/// Bounded per-instance duplicate filter. Fingerprints are remembered for
/// `ttl` or until LRU eviction, whichever comes first. Messages without an
/// external message id bypass the filter entirely (the outbound idempotency
/// cache takes over for those).
pub struct DedupFilter {
    shards: Vec<Shard>,
    ttl: Duration,
}

impl DedupFilter {
    pub fn new(config: &DedupConfig) -> Self {
        let shard_count = config.effective_shards();
        let capacity =
            NonZeroUsize::new(config.capacity_per_shard.max(1)).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Shard { seen: Mutex::new(LruCache::new(capacity)) })
            .collect();
        Self {
            shards,
            ttl: Duration::from_millis(config.ttl_ms),
        }
    }

    fn shard_for(&self, fingerprint: &Fingerprint) -> &Shard {
        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Atomically check and remember a fingerprint.
    pub fn check_and_mark(&self, fingerprint: &Fingerprint) -> DedupVerdict {
        let shard = self.shard_for(fingerprint);
        let mut seen = shard.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if let Some(marked_at) = seen.get(fingerprint) {
            if now.duration_since(*marked_at) < self.ttl {
                return DedupVerdict::Duplicate;
            }
        }
        seen.put(fingerprint.clone(), now);
        DedupVerdict::New
    }

    /// Total live fingerprints across shards (expired entries included
    /// until touched or evicted).
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.seen.lock().map(|c| c.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_with(capacity: usize, ttl_ms: u64) -> DedupFilter {
        DedupFilter::new(&DedupConfig { shards: 2, capacity_per_shard: capacity, ttl_ms })
    }

    fn fp(id: &str) -> Fingerprint {
        Fingerprint::new("telegram", "tg-main", "chat-1", id)
    }

    #[test]
    fn test_first_is_new_then_duplicate() {
        let filter = filter_with(16, 60_000);
        assert_eq!(filter.check_and_mark(&fp("m1")), DedupVerdict::New);
        assert_eq!(filter.check_and_mark(&fp("m1")), DedupVerdict::Duplicate);
        assert_eq!(filter.check_and_mark(&fp("m2")), DedupVerdict::New);
    }

    #[test]
    fn test_distinct_rooms_do_not_collide() {
        let filter = filter_with(16, 60_000);
        let a = Fingerprint::new("telegram", "tg-main", "chat-1", "m1");
        let b = Fingerprint::new("telegram", "tg-main", "chat-2", "m1");
        assert_eq!(filter.check_and_mark(&a), DedupVerdict::New);
        assert_eq!(filter.check_and_mark(&b), DedupVerdict::New);
    }

    #[test]
    fn test_expired_entries_read_as_new() {
        let filter = filter_with(16, 0);
        assert_eq!(filter.check_and_mark(&fp("m1")), DedupVerdict::New);
        // ttl of zero means everything is immediately stale
        assert_eq!(filter.check_and_mark(&fp("m1")), DedupVerdict::New);
    }

    #[test]
    fn test_lru_eviction_bounds_memory() {
        let filter = filter_with(2, 60_000);
        for i in 0..100 {
            filter.check_and_mark(&fp(&format!("m{i}")));
        }
        // 2 shards * capacity 2
        assert!(filter.len() <= 4);
    }

    #[test]
    fn test_concurrent_checks_single_winner() {
        use std::sync::Arc;
        let filter = Arc::new(filter_with(1024, 60_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let filter = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .filter(|i| {
                        filter.check_and_mark(&fp(&format!("m{i}"))) == DedupVerdict::New
                    })
                    .count()
            }));
        }
        let total_new: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_new, 100, "each fingerprint admitted exactly once");
    }
}
