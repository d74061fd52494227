// ABOUTME: Control-plane entities: bridge configs and per-room routing policies
// ABOUTME: Both carry a revision for optimistic-concurrency-checked writes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::CapabilitySet;
use crate::error::Error;

/// A configured adapter binding. Writes go through the config store, which
/// checks the expected revision and bumps it on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub id: String,
    pub adapter_module: String,
    #[serde(default)]
    pub credentials: serde_json::Value,
    #[serde(default)]
    pub opts: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl BridgeConfig {
    pub fn new(id: impl Into<String>, adapter_module: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            adapter_module: adapter_module.into(),
            credentials: serde_json::Value::Null,
            opts: serde_json::Value::Null,
            enabled: true,
            capabilities: CapabilitySet::default(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How many targets an outbound dispatch fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    BestEffort,
    Primary,
    Broadcast,
}

/// What happens after a sequential dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    None,
    NextAvailable,
    Broadcast,
}

/// Scope within which outbound duplicates are collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeScope {
    MessageId,
    Thread,
    Room,
}

/// Per-room outbound routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub room_id: String,
    pub delivery_mode: DeliveryMode,
    pub failover_policy: FailoverPolicy,
    pub dedupe_scope: DedupeScope,
    /// Ordered bridge ids tried first.
    #[serde(default)]
    pub fallback_order: Vec<String>,
    #[serde(default)]
    pub revision: u64,
}

impl RoutingPolicy {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            delivery_mode: DeliveryMode::BestEffort,
            failover_policy: FailoverPolicy::NextAvailable,
            dedupe_scope: DedupeScope::MessageId,
            fallback_order: Vec::new(),
            revision: 0,
        }
    }

    /// Reject combinations with no defined semantics. `Primary` delivery
    /// with `Broadcast` failover is one: a single-target mode cannot fail
    /// over to everyone.
    pub fn validate(&self) -> Result<(), Error> {
        if self.delivery_mode == DeliveryMode::Primary
            && self.failover_policy == FailoverPolicy::Broadcast
        {
            return Err(Error::InvalidPolicy(
                "delivery_mode=primary cannot combine with failover_policy=broadcast".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let p = RoutingPolicy::new("r1");
        assert_eq!(p.delivery_mode, DeliveryMode::BestEffort);
        assert_eq!(p.failover_policy, FailoverPolicy::NextAvailable);
        assert_eq!(p.dedupe_scope, DedupeScope::MessageId);
        assert_eq!(p.revision, 0);
    }

    #[test]
    fn test_primary_broadcast_combination_rejected() {
        let mut p = RoutingPolicy::new("r1");
        p.delivery_mode = DeliveryMode::Primary;
        p.failover_policy = FailoverPolicy::Broadcast;
        assert!(matches!(p.validate(), Err(Error::InvalidPolicy(_))));
    }

    #[test]
    fn test_broadcast_mode_is_valid() {
        let mut p = RoutingPolicy::new("r1");
        p.delivery_mode = DeliveryMode::Broadcast;
        p.failover_policy = FailoverPolicy::Broadcast;
        assert!(p.validate().is_ok());
    }
}
