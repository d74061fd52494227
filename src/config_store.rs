// ABOUTME: Single-writer store for bridge configs and routing policies
// ABOUTME: Optimistic concurrency on revision; accepted writes notify reconciliation

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use switchboard_core::error::{Error, Result};
use switchboard_core::routing::{BridgeConfig, RoutingPolicy};
use switchboard_core::storage::Storage;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// What changed, for asynchronous bridge reconciliation.
#[derive(Debug, Clone)]
pub enum ConfigChange {
    BridgeUpserted(BridgeConfig),
    BridgeDeleted(String),
    PolicyUpserted(RoutingPolicy),
    PolicyDeleted(String),
}

/// Runtime-mutable control-plane store. All writes serialize through one
/// async mutex so revisions are linearized per instance.
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
    writer: Mutex<()>,
    changes: broadcast::Sender<ConfigChange>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn Storage>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self { storage, writer: Mutex::new(()), changes })
    }

    /// Subscribe to accepted mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    /// Check an expected revision against the stored one.
    ///
    /// `None` skips the check; `0` or `-1` demand a create (no existing
    /// record); anything else must equal the current revision exactly.
    fn check_revision(expected: Option<i64>, actual: Option<u64>) -> Result<()> {
        match (expected, actual) {
            (None, _) => Ok(()),
            (Some(0) | Some(-1), None) => Ok(()),
            (Some(e @ (0 | -1)), Some(current)) => {
                Err(Error::RevisionConflict { expected: e, actual: current })
            }
            (Some(e), Some(current)) if e >= 0 && e as u64 == current => Ok(()),
            (Some(e), Some(current)) => Err(Error::RevisionConflict { expected: e, actual: current }),
            (Some(e), None) => Err(Error::RevisionConflict { expected: e, actual: 0 }),
        }
    }

    /// Upsert a bridge config. The stored revision wins over whatever the
    /// caller set on the struct; accepted writes bump it by one.
    pub async fn put_bridge_config(
        &self,
        mut config: BridgeConfig,
        expected_revision: Option<i64>,
    ) -> Result<BridgeConfig> {
        let _writer = self.writer.lock().await;
        let current = self.storage.get_bridge_config(&config.id).await?;
        Self::check_revision(expected_revision, current.as_ref().map(|c| c.revision))?;

        let now = Utc::now();
        match &current {
            Some(existing) => {
                config.revision = existing.revision + 1;
                config.created_at = existing.created_at;
            }
            None => {
                config.revision = 1;
                config.created_at = now;
            }
        }
        config.updated_at = now;
        self.storage.save_bridge_config(&config).await?;
        tracing::info!(bridge_id = %config.id, revision = config.revision, "bridge config written");
        let _ = self.changes.send(ConfigChange::BridgeUpserted(config.clone()));
        Ok(config)
    }

    pub async fn get_bridge_config(&self, bridge_id: &str) -> Result<Option<BridgeConfig>> {
        self.storage.get_bridge_config(bridge_id).await
    }

    pub async fn list_bridge_configs(&self) -> Result<Vec<BridgeConfig>> {
        self.storage.list_bridge_configs().await
    }

    pub async fn delete_bridge_config(
        &self,
        bridge_id: &str,
        expected_revision: Option<i64>,
    ) -> Result<()> {
        let _writer = self.writer.lock().await;
        let current = self.storage.get_bridge_config(bridge_id).await?;
        if current.is_none() {
            return Err(Error::not_found(format!("bridge config '{bridge_id}'")));
        }
        Self::check_revision(expected_revision, current.as_ref().map(|c| c.revision))?;
        self.storage.delete_bridge_config(bridge_id).await?;
        let _ = self.changes.send(ConfigChange::BridgeDeleted(bridge_id.to_string()));
        Ok(())
    }

    /// Upsert a routing policy. Invalid mode/failover combinations are
    /// rejected before anything is written.
    pub async fn put_routing_policy(
        &self,
        mut policy: RoutingPolicy,
        expected_revision: Option<i64>,
    ) -> Result<RoutingPolicy> {
        policy.validate()?;
        let _writer = self.writer.lock().await;
        let current = self.storage.get_routing_policy(&policy.room_id).await?;
        Self::check_revision(expected_revision, current.as_ref().map(|p| p.revision))?;
        policy.revision = current.map(|p| p.revision).unwrap_or(0) + 1;
        self.storage.save_routing_policy(&policy).await?;
        tracing::info!(room_id = %policy.room_id, revision = policy.revision, "routing policy written");
        let _ = self.changes.send(ConfigChange::PolicyUpserted(policy.clone()));
        Ok(policy)
    }

    pub async fn get_routing_policy(&self, room_id: &str) -> Result<Option<RoutingPolicy>> {
        self.storage.get_routing_policy(room_id).await
    }

    pub async fn delete_routing_policy(
        &self,
        room_id: &str,
        expected_revision: Option<i64>,
    ) -> Result<()> {
        let _writer = self.writer.lock().await;
        let current = self.storage.get_routing_policy(room_id).await?;
        if current.is_none() {
            return Err(Error::not_found(format!("routing policy '{room_id}'")));
        }
        Self::check_revision(expected_revision, current.as_ref().map(|p| p.revision))?;
        self.storage.delete_routing_policy(room_id).await?;
        let _ = self.changes.send(ConfigChange::PolicyDeleted(room_id.to_string()));
        Ok(())
    }
}
