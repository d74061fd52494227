// ABOUTME: Restart-intensity supervision and keyed actor addressing
// ABOUTME: A key maps to at most one live actor; restart loops escalate

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use switchboard_core::config::RestartIntensity;

/// Tracks restarts within a sliding window. More than `max_restarts`
/// restarts inside `max_seconds` means the subtree must escalate instead
/// of restarting again.
#[derive(Debug)]
pub struct IntensityTracker {
    intensity: RestartIntensity,
    restarts: Vec<Instant>,
}

impl IntensityTracker {
    pub fn new(intensity: RestartIntensity) -> Self {
        Self { intensity, restarts: Vec::new() }
    }

    /// Record a restart; returns false when the budget is exhausted and
    /// the caller must escalate.
    pub fn record_restart(&mut self) -> bool {
        let now = Instant::now();
        let window = Duration::from_secs(self.intensity.max_seconds);
        self.restarts.retain(|at| now.duration_since(*at) <= window);
        self.restarts.push(now);
        self.restarts.len() <= self.intensity.max_restarts as usize
    }

    pub fn restarts_in_window(&self) -> usize {
        let now = Instant::now();
        let window = Duration::from_secs(self.intensity.max_seconds);
        self.restarts.iter().filter(|at| now.duration_since(**at) <= window).count()
    }
}

/// A runnable the supervisor can (re)materialize.
pub struct RunnableSpec {
    pub id: String,
    factory: Box<dyn Fn() -> JoinHandle<()> + Send + Sync>,
}

impl RunnableSpec {
    pub fn new(
        id: impl Into<String>,
        factory: impl Fn() -> JoinHandle<()> + Send + Sync + 'static,
    ) -> Self {
        Self { id: id.into(), factory: Box::new(factory) }
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        (self.factory)()
    }
}

/// Supervises a set of runnables, restarting each on abnormal exit until
/// the subtree's restart intensity is exhausted; then the whole subtree is
/// torn down and the escalation callback fires.
pub struct Supervisor {
    intensity: RestartIntensity,
    children: Mutex<Vec<Arc<RunnableSpec>>>,
    tracker: Mutex<IntensityTracker>,
    escalated: Arc<std::sync::atomic::AtomicBool>,
}

impl Supervisor {
    pub fn new(intensity: RestartIntensity) -> Arc<Self> {
        Arc::new(Self {
            intensity,
            children: Mutex::new(Vec::new()),
            tracker: Mutex::new(IntensityTracker::new(intensity)),
            escalated: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub fn intensity(&self) -> RestartIntensity {
        self.intensity
    }

    pub fn has_escalated(&self) -> bool {
        self.escalated.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Start a child and keep restarting it while the budget allows.
    /// Normal exit (no panic, no cancellation) does not restart.
    pub fn supervise(self: &Arc<Self>, spec: RunnableSpec) {
        let spec = Arc::new(spec);
        self.children.lock().unwrap_or_else(|p| p.into_inner()).push(Arc::clone(&spec));
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if supervisor.has_escalated() {
                    return;
                }
                let handle = spec.spawn();
                match handle.await {
                    Ok(()) => {
                        tracing::debug!(child = %spec.id, "supervised child exited normally");
                        return;
                    }
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => {
                        tracing::warn!(child = %spec.id, error = %e, "supervised child crashed");
                        let within_budget = supervisor
                            .tracker
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .record_restart();
                        if !within_budget {
                            tracing::error!(
                                child = %spec.id,
                                max_restarts = supervisor.intensity.max_restarts,
                                max_seconds = supervisor.intensity.max_seconds,
                                "restart intensity exceeded, escalating"
                            );
                            supervisor
                                .escalated
                                .store(true, std::sync::atomic::Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Keyed table of actor handles with an at-most-one-per-key invariant.
/// `get_or_start` returns the existing live handle or materializes a new
/// actor via the factory.
pub struct ActorTable<K, H> {
    actors: Mutex<HashMap<K, H>>,
}

impl<K, H> ActorTable<K, H>
where
    K: Eq + Hash + Clone,
    H: Clone,
{
    pub fn new() -> Self {
        Self { actors: Mutex::new(HashMap::new()) }
    }

    /// Look up the actor for `key`, starting one when absent or when the
    /// existing handle reports itself dead via `is_alive`.
    pub fn get_or_start(
        &self,
        key: K,
        is_alive: impl Fn(&H) -> bool,
        start: impl FnOnce() -> H,
    ) -> H {
        let mut actors = self.actors.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = actors.get(&key) {
            if is_alive(existing) {
                return existing.clone();
            }
        }
        let handle = start();
        actors.insert(key, handle.clone());
        handle
    }

    pub fn get(&self, key: &K) -> Option<H> {
        self.actors.lock().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<H> {
        self.actors.lock().unwrap_or_else(|p| p.into_inner()).remove(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.actors.lock().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.actors.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, H> Default for ActorTable<K, H>
where
    K: Eq + Hash + Clone,
    H: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
