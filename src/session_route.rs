// ABOUTME: Sharded TTL map from session keys to outbound routes
// ABOUTME: Resolution degrades to caller-provided fallbacks, never fails the outbound path

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use switchboard_core::config::SessionStoreConfig;
use switchboard_core::delivery::{Route, SessionKey};

#[derive(Debug, Clone)]
struct SessionRecord {
    route: Route,
    updated_at: Instant,
    expires_at: Instant,
}

/// Where a resolved route came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Fresh session-store hit.
    Session,
    /// Expired session record used as a shard-local fallback.
    SessionStale,
    /// First caller-provided fallback route.
    Provided,
}

/// Why resolution fell back, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    Expired,
    NotFound,
    SessionUnavailable,
}

/// A resolved route, annotated with how it was found.
#[derive(Debug, Clone)]
pub struct RouteResolution {
    pub route: Route,
    pub source: RouteSource,
    pub fallback: bool,
    pub stale: bool,
    pub fallback_reason: Option<FallbackReason>,
}

/// Lookup outcome for a single key.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLookup {
    Fresh(Route),
    Expired,
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct SetOpts {
    /// Override the configured TTL for this entry.
    pub ttl: Option<Duration>,
}

struct Shard {
    entries: Mutex<LruCache<SessionKey, SessionRecord>>,
}

/// Sharded TTL map `SessionKey -> route`, used to resolve "reply into the
/// right conversation" on outbound paths. Shards bound memory with LRU
/// eviction; a background pruner removes expired entries.
pub struct SessionRouteStore {
    shards: Vec<Shard>,
    ttl: Duration,
    prune_interval: Duration,
}

impl SessionRouteStore {
    pub fn new(config: &SessionStoreConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.capacity_per_shard.max(1)).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..config.effective_shards())
            .map(|_| Shard { entries: Mutex::new(LruCache::new(capacity)) })
            .collect();
        Self {
            shards,
            ttl: Duration::from_millis(config.ttl_ms),
            prune_interval: Duration::from_millis(config.prune_interval_ms),
        }
    }

    fn shard_for(&self, key: &SessionKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Record the route for a session key.
    pub fn set(&self, key: SessionKey, route: Route, opts: SetOpts) {
        let now = Instant::now();
        let ttl = opts.ttl.unwrap_or(self.ttl);
        let record = SessionRecord { route, updated_at: now, expires_at: now + ttl };
        let shard = self.shard_for(&key);
        if let Ok(mut entries) = shard.entries.lock() {
            entries.put(key, record);
        }
    }

    pub fn get(&self, key: &SessionKey) -> SessionLookup {
        let shard = self.shard_for(key);
        let Ok(mut entries) = shard.entries.lock() else {
            return SessionLookup::NotFound;
        };
        match entries.get(key) {
            Some(record) if record.expires_at > Instant::now() => {
                SessionLookup::Fresh(record.route.clone())
            }
            Some(_) => SessionLookup::Expired,
            None => SessionLookup::NotFound,
        }
    }

    /// Resolve a route: fresh hit, else the shard's stale record, else the
    /// first provided fallback. A crashed shard degrades straight to the
    /// provided fallback.
    pub fn resolve(&self, key: &SessionKey, fallbacks: &[Route]) -> Option<RouteResolution> {
        let shard = self.shard_for(key);
        match shard.entries.lock() {
            Ok(mut entries) => match entries.get(key) {
                Some(record) if record.expires_at > Instant::now() => Some(RouteResolution {
                    route: record.route.clone(),
                    source: RouteSource::Session,
                    fallback: false,
                    stale: false,
                    fallback_reason: None,
                }),
                Some(record) => Some(RouteResolution {
                    route: record.route.clone(),
                    source: RouteSource::SessionStale,
                    fallback: true,
                    stale: true,
                    fallback_reason: Some(FallbackReason::Expired),
                }),
                None => fallbacks.first().map(|route| RouteResolution {
                    route: route.clone(),
                    source: RouteSource::Provided,
                    fallback: true,
                    stale: false,
                    fallback_reason: Some(FallbackReason::NotFound),
                }),
            },
            Err(_) => {
                tracing::warn!(key = %key, "session shard unavailable, using provided fallback");
                fallbacks.first().map(|route| RouteResolution {
                    route: route.clone(),
                    source: RouteSource::Provided,
                    fallback: true,
                    stale: false,
                    fallback_reason: Some(FallbackReason::SessionUnavailable),
                })
            }
        }
    }

    /// Remove expired entries from every shard. Returns how many were
    /// dropped.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let Ok(mut entries) = shard.entries.lock() else { continue };
            let expired: Vec<SessionKey> = entries
                .iter()
                .filter(|(_, record)| record.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                entries.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the periodic pruner for this store.
    pub fn start_pruner(store: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.prune_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let removed = store.prune();
                if removed > 0 {
                    tracing::debug!(removed, "pruned expired session routes");
                }
            }
        })
    }

    /// Age of the freshest record for a key, mostly for diagnostics.
    pub fn age(&self, key: &SessionKey) -> Option<Duration> {
        let shard = self.shard_for(key);
        let mut entries = shard.entries.lock().ok()?;
        entries.get(key).map(|r| r.updated_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.entries.lock().map(|e| e.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
