// ABOUTME: Runtime configuration structs with serde defaults for every tunable
// ABOUTME: Invalid pressure thresholds are sanitized back to defaults

use serde::{Deserialize, Serialize};

use crate::delivery::Priority;

fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
}

/// Default shard/partition count for hot-path structures.
pub fn default_partition_count() -> usize {
    (2 * cpu_count()).max(2)
}

fn default_replay_partitions() -> usize {
    cpu_count().max(2)
}

// ---------------------------------------------------------------------------
// Dedup filter
// ---------------------------------------------------------------------------

fn default_dedup_capacity() -> usize {
    2048
}

fn default_dedup_ttl_ms() -> u64 {
    600_000
}

/// Dedup filter bounds. TTL and size defaults are declared here explicitly;
/// both limits apply together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// 0 = auto (`max(2, 2*cpus)`).
    #[serde(default)]
    pub shards: usize,
    #[serde(default = "default_dedup_capacity")]
    pub capacity_per_shard: usize,
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shards: 0,
            capacity_per_shard: default_dedup_capacity(),
            ttl_ms: default_dedup_ttl_ms(),
        }
    }
}

impl DedupConfig {
    pub fn effective_shards(&self) -> usize {
        if self.shards == 0 {
            default_partition_count()
        } else {
            self.shards
        }
    }
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

fn default_session_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_session_capacity() -> usize {
    10_000
}

fn default_prune_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// 0 = auto (`max(2, 2*cpus)`).
    #[serde(default)]
    pub shards: usize,
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_session_capacity")]
    pub capacity_per_shard: usize,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            shards: 0,
            ttl_ms: default_session_ttl_ms(),
            capacity_per_shard: default_session_capacity(),
            prune_interval_ms: default_prune_interval_ms(),
        }
    }
}

impl SessionStoreConfig {
    pub fn effective_shards(&self) -> usize {
        if self.shards == 0 {
            default_partition_count()
        } else {
            self.shards
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest: sender verification and policy hooks
// ---------------------------------------------------------------------------

/// What to do when a bounded hook times out or crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFallback {
    Deny,
    AllowWithFlag,
}

/// Whether a verification error blocks ingest or degrades to a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyFailurePolicy {
    Allow,
    Deny,
}

fn default_verify_timeout_ms() -> u64 {
    50
}

fn default_policy_timeout_ms() -> u64 {
    50
}

fn default_policy_fallback() -> PolicyFallback {
    PolicyFallback::Deny
}

fn default_verify_failure_policy() -> VerifyFailurePolicy {
    VerifyFailurePolicy::Deny
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Strict mode treats any verify error as a denial candidate;
    /// permissive mode only acts on explicit denials.
    #[serde(default)]
    pub strict_verification: bool,
    #[serde(default = "default_verify_failure_policy")]
    pub verify_failure_policy: VerifyFailurePolicy,
    #[serde(default = "default_policy_timeout_ms")]
    pub policy_timeout_ms: u64,
    #[serde(default = "default_policy_fallback")]
    pub policy_timeout_fallback: PolicyFallback,
    #[serde(default = "default_policy_fallback")]
    pub policy_error_fallback: PolicyFallback,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            verify_timeout_ms: default_verify_timeout_ms(),
            strict_verification: false,
            verify_failure_policy: default_verify_failure_policy(),
            policy_timeout_ms: default_policy_timeout_ms(),
            policy_timeout_fallback: default_policy_fallback(),
            policy_error_fallback: default_policy_fallback(),
        }
    }
}

// ---------------------------------------------------------------------------
// Media policy
// ---------------------------------------------------------------------------

use crate::model::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaViolationAction {
    /// A rejected item fails the whole ingest.
    Reject,
    /// A rejected item is dropped; the rest of the message continues.
    Drop,
}

fn default_max_media_items() -> usize {
    4
}

fn default_max_item_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_total_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_allowed_kinds() -> Vec<MediaKind> {
    vec![MediaKind::Image, MediaKind::Audio, MediaKind::Video, MediaKind::File]
}

fn default_violation_action() -> MediaViolationAction {
    MediaViolationAction::Reject
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPolicyConfig {
    #[serde(default = "default_max_media_items")]
    pub max_items: usize,
    #[serde(default = "default_max_item_bytes")]
    pub max_item_bytes: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    #[serde(default = "default_allowed_kinds")]
    pub allowed_kinds: Vec<MediaKind>,
    #[serde(default = "default_violation_action")]
    pub on_policy_violation: MediaViolationAction,
}

impl Default for MediaPolicyConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_media_items(),
            max_item_bytes: default_max_item_bytes(),
            max_total_bytes: default_max_total_bytes(),
            allowed_kinds: default_allowed_kinds(),
            on_policy_violation: default_violation_action(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedAction {
    Throttle,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedAction {
    DropLow,
    None,
}

fn default_warn_ratio() -> f64 {
    0.70
}

fn default_degraded_ratio() -> f64 {
    0.85
}

fn default_shed_ratio() -> f64 {
    0.95
}

fn default_throttle_ms() -> u64 {
    5
}

fn default_degraded_action() -> DegradedAction {
    DegradedAction::Throttle
}

fn default_shed_action() -> ShedAction {
    ShedAction::DropLow
}

fn default_shed_priorities() -> Vec<Priority> {
    vec![Priority::Low]
}

/// Queue fill-ratio thresholds. Invariant: `warn < degraded < shed`, all in
/// (0, 1]. `sanitize` replaces a violating config with the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureConfig {
    #[serde(default = "default_warn_ratio")]
    pub warn: f64,
    #[serde(default = "default_degraded_ratio")]
    pub degraded: f64,
    #[serde(default = "default_shed_ratio")]
    pub shed: f64,
    #[serde(default = "default_degraded_action")]
    pub degraded_action: DegradedAction,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_shed_action")]
    pub shed_action: ShedAction,
    #[serde(default = "default_shed_priorities")]
    pub shed_drop_priorities: Vec<Priority>,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            warn: default_warn_ratio(),
            degraded: default_degraded_ratio(),
            shed: default_shed_ratio(),
            degraded_action: default_degraded_action(),
            throttle_ms: default_throttle_ms(),
            shed_action: default_shed_action(),
            shed_drop_priorities: default_shed_priorities(),
        }
    }
}

impl PressureConfig {
    fn thresholds_valid(&self) -> bool {
        0.0 < self.warn
            && self.warn < self.degraded
            && self.degraded < self.shed
            && self.shed <= 1.0
    }

    /// Returns this config if its thresholds hold the invariant, otherwise
    /// the defaults with actions/priorities preserved.
    pub fn sanitize(self) -> Self {
        if self.thresholds_valid() {
            self
        } else {
            tracing::warn!(
                warn = self.warn,
                degraded = self.degraded,
                shed = self.shed,
                "pressure thresholds violate warn < degraded < shed, using defaults"
            );
            Self {
                warn: default_warn_ratio(),
                degraded: default_degraded_ratio(),
                shed: default_shed_ratio(),
                ..self
            }
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    25
}

fn default_backoff_max_ms() -> u64 {
    500
}

fn default_jitter() -> f64 {
    0.2
}

/// Exponential backoff: `min(base * 2^(attempt-1), max)` with uniform
/// jitter up to the given fraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Backoff before `attempt` (1-based) retries, without jitter.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.base_ms.saturating_mul(1u64 << exp).min(self.max_ms)
    }
}

fn default_queue_capacity() -> usize {
    128
}

fn default_idempotency_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// 0 = auto (`max(2, 2*cpus)`).
    #[serde(default)]
    pub partitions: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub pressure: PressureConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            partitions: 0,
            queue_capacity: default_queue_capacity(),
            pressure: PressureConfig::default(),
            retry: RetryConfig::default(),
            idempotency_capacity: default_idempotency_capacity(),
        }
    }
}

impl OutboundConfig {
    pub fn effective_partitions(&self) -> usize {
        if self.partitions == 0 {
            default_partition_count()
        } else {
            self.partitions
        }
    }
}

// ---------------------------------------------------------------------------
// Dead-letter store
// ---------------------------------------------------------------------------

fn default_dead_letter_capacity() -> usize {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    #[serde(default = "default_dead_letter_capacity")]
    pub capacity: usize,
    #[serde(default = "default_replay_partitions")]
    pub replay_partitions: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: default_dead_letter_capacity(),
            replay_partitions: default_replay_partitions(),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance lifecycle
// ---------------------------------------------------------------------------

fn default_probe_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    250
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_ms: default_reconnect_base_ms(),
            max_ms: default_reconnect_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.base_ms.saturating_mul(1u64 << exp).min(self.max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

/// Restart budget for a supervised subtree: more than `max_restarts`
/// restarts within `max_seconds` escalates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RestartIntensity {
    pub max_restarts: u32,
    pub max_seconds: u64,
}

fn default_domain_intensity() -> RestartIntensity {
    RestartIntensity { max_restarts: 6, max_seconds: 30 }
}

fn default_instance_intensity() -> RestartIntensity {
    RestartIntensity { max_restarts: 5, max_seconds: 30 }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_domain_intensity")]
    pub domain: RestartIntensity,
    #[serde(default = "default_instance_intensity")]
    pub instance: RestartIntensity,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            domain: default_domain_intensity(),
            instance: default_instance_intensity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Room / agent actors
// ---------------------------------------------------------------------------

fn default_history_capacity() -> usize {
    100
}

fn default_typing_timeout_ms() -> u64 {
    5000
}

fn default_hibernate_after_ms() -> u64 {
    5 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    #[serde(default = "default_hibernate_after_ms")]
    pub hibernate_after_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            typing_timeout_ms: default_typing_timeout_ms(),
            hibernate_after_ms: default_hibernate_after_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// All tunables for one messaging instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub session: SessionStoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub media: MediaPolicyConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub room: RoomConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_defaults_hold_invariant() {
        let p = PressureConfig::default();
        assert!(p.warn < p.degraded && p.degraded < p.shed);
        assert_eq!(p.warn, 0.70);
        assert_eq!(p.degraded, 0.85);
        assert_eq!(p.shed, 0.95);
    }

    #[test]
    fn test_pressure_sanitize_replaces_invalid_thresholds() {
        let bad = PressureConfig { warn: 0.9, degraded: 0.5, shed: 0.95, ..Default::default() };
        let fixed = bad.sanitize();
        assert_eq!(fixed.warn, 0.70);
        assert_eq!(fixed.degraded, 0.85);
        assert_eq!(fixed.shed, 0.95);
    }

    #[test]
    fn test_pressure_sanitize_keeps_valid_config() {
        let ok = PressureConfig { warn: 0.5, degraded: 0.6, shed: 0.7, ..Default::default() };
        let kept = ok.sanitize();
        assert_eq!(kept.warn, 0.5);
        assert_eq!(kept.shed, 0.7);
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let r = RetryConfig::default();
        assert_eq!(r.backoff_ms(1), 25);
        assert_eq!(r.backoff_ms(2), 50);
        assert_eq!(r.backoff_ms(3), 100);
        assert_eq!(r.backoff_ms(10), 500);
    }

    #[test]
    fn test_effective_partitions_auto() {
        let o = OutboundConfig::default();
        assert!(o.effective_partitions() >= 2);
        let fixed = OutboundConfig { partitions: 3, ..Default::default() };
        assert_eq!(fixed.effective_partitions(), 3);
    }

    #[test]
    fn test_config_deserializes_from_empty_toml() {
        let cfg: RuntimeConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(cfg.outbound.queue_capacity, 128);
        assert_eq!(cfg.media.max_items, 4);
        assert_eq!(cfg.room.history_capacity, 100);
        assert_eq!(cfg.lifecycle.probe_interval_ms, 30_000);
        assert_eq!(cfg.dedup.capacity_per_shard, 2048);
    }

    #[test]
    fn test_supervisor_intensity_defaults() {
        let s = SupervisorConfig::default();
        assert_eq!(s.domain.max_restarts, 6);
        assert_eq!(s.instance.max_restarts, 5);
        assert_eq!(s.domain.max_seconds, 30);
    }
}
