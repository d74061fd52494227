// ABOUTME: In-memory storage contract implementation backing tests and default instances
// ABOUTME: One lock over all tables keeps get-or-create operations atomic

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use switchboard_core::error::{Error, Result};
use switchboard_core::model::{
    ExternalBinding, Message, Participant, Room, RoomBinding, RoomType,
};
use switchboard_core::routing::{BridgeConfig, RoutingPolicy};
use switchboard_core::storage::{ParticipantAttrs, RoomAttrs, Storage};

#[derive(Default)]
struct Tables {
    rooms: HashMap<String, Room>,
    /// (channel, bridge_id, external_room_id) -> room_id
    room_bindings_by_key: HashMap<(String, String, String), String>,
    room_bindings: HashMap<String, RoomBinding>,
    participants: HashMap<String, Participant>,
    /// (channel, external_user_id) -> participant_id
    participants_by_external: HashMap<(String, String), String>,
    messages: HashMap<String, Message>,
    /// (channel, external_message_id) -> message_id
    messages_by_external: HashMap<(String, String), String>,
    bridge_configs: HashMap<String, BridgeConfig>,
    routing_policies: HashMap<String, RoutingPolicy>,
}

/// Reference `Storage` implementation. Upholds binding uniqueness and
/// atomic get-or-create under a single table lock.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_room(&self, room: &Room) -> Result<()> {
        self.tables.write().await.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        Ok(self.tables.read().await.rooms.get(room_id).cloned())
    }

    async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.tables.write().await.rooms.remove(room_id);
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<Room>> {
        Ok(self.tables.read().await.rooms.values().cloned().collect())
    }

    async fn get_or_create_room_by_external_binding(
        &self,
        channel: &str,
        bridge_id: &str,
        external_room_id: &str,
        attrs: RoomAttrs,
    ) -> Result<Room> {
        let mut tables = self.tables.write().await;
        let key = (channel.to_string(), bridge_id.to_string(), external_room_id.to_string());
        if let Some(room_id) = tables.room_bindings_by_key.get(&key) {
            let room_id = room_id.clone();
            return tables
                .rooms
                .get(&room_id)
                .cloned()
                .ok_or_else(|| Error::storage(format!("binding points at missing room '{room_id}'")));
        }

        let mut room = Room::new(attrs.room_type.unwrap_or(RoomType::Group));
        if let Some(name) = attrs.name {
            room = room.with_name(name);
        }
        room.metadata = attrs.metadata;
        room.external_bindings.insert(ExternalBinding {
            channel: channel.to_string(),
            bridge: bridge_id.to_string(),
            external_room_id: external_room_id.to_string(),
        });
        let binding = RoomBinding::new(&room.id, channel, bridge_id, external_room_id);
        tables.room_bindings_by_key.insert(key, room.id.clone());
        tables.room_bindings.insert(binding.id.clone(), binding);
        tables.rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn save_participant(&self, participant: &Participant) -> Result<()> {
        let mut tables = self.tables.write().await;
        for (channel, external_id) in &participant.external_ids {
            tables
                .participants_by_external
                .insert((channel.clone(), external_id.clone()), participant.id.clone());
        }
        tables.participants.insert(participant.id.clone(), participant.clone());
        Ok(())
    }

    async fn get_participant(&self, participant_id: &str) -> Result<Option<Participant>> {
        Ok(self.tables.read().await.participants.get(participant_id).cloned())
    }

    async fn delete_participant(&self, participant_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(participant) = tables.participants.remove(participant_id) {
            for (channel, external_id) in &participant.external_ids {
                tables.participants_by_external.remove(&(channel.clone(), external_id.clone()));
            }
        }
        Ok(())
    }

    async fn list_participants(&self) -> Result<Vec<Participant>> {
        Ok(self.tables.read().await.participants.values().cloned().collect())
    }

    async fn get_or_create_participant_by_external_id(
        &self,
        channel: &str,
        external_user_id: &str,
        attrs: ParticipantAttrs,
    ) -> Result<Participant> {
        let mut tables = self.tables.write().await;
        let key = (channel.to_string(), external_user_id.to_string());
        if let Some(participant_id) = tables.participants_by_external.get(&key) {
            let participant_id = participant_id.clone();
            return tables.participants.get(&participant_id).cloned().ok_or_else(|| {
                Error::storage(format!("external id points at missing participant '{participant_id}'"))
            });
        }
        let identity = attrs
            .identity
            .or(attrs.display_name)
            .unwrap_or_else(|| external_user_id.to_string());
        let participant = Participant::human(identity).with_external_id(channel, external_user_id);
        tables.participants_by_external.insert(key, participant.id.clone());
        tables.participants.insert(participant.id.clone(), participant.clone());
        Ok(participant)
    }

    async fn directory_search(&self, query: &str) -> Result<Vec<Participant>> {
        let needle = query.to_lowercase();
        Ok(self
            .tables
            .read()
            .await
            .participants
            .values()
            .filter(|p| p.identity.to_lowercase().starts_with(&needle))
            .cloned()
            .collect())
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let (Some(channel), Some(external_id)) = (
            message.metadata.get("channel").and_then(|v| v.as_str()),
            message.external_id.as_deref(),
        ) {
            tables
                .messages_by_external
                .insert((channel.to_string(), external_id.to_string()), message.id.clone());
        }
        tables.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self.tables.read().await.messages.get(message_id).cloned())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.tables.write().await.messages.remove(message_id);
        Ok(())
    }

    async fn list_room_messages(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut messages: Vec<Message> =
            tables.messages.values().filter(|m| m.room_id == room_id).cloned().collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn get_message_by_external_id(
        &self,
        channel: &str,
        external_id: &str,
    ) -> Result<Option<Message>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages_by_external
            .get(&(channel.to_string(), external_id.to_string()))
            .and_then(|id| tables.messages.get(id))
            .cloned())
    }

    async fn update_message_external_id(
        &self,
        message_id: &str,
        external_id: &str,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let channel = {
            let message = tables
                .messages
                .get_mut(message_id)
                .ok_or_else(|| Error::not_found(format!("message '{message_id}'")))?;
            message.external_id = Some(external_id.to_string());
            message.metadata.get("channel").and_then(|v| v.as_str()).map(str::to_string)
        };
        if let Some(channel) = channel {
            tables
                .messages_by_external
                .insert((channel, external_id.to_string()), message_id.to_string());
        }
        Ok(())
    }

    async fn create_room_binding(&self, binding: &RoomBinding) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = (
            binding.channel.clone(),
            binding.bridge_id.clone(),
            binding.external_room_id.clone(),
        );
        if let Some(existing_room) = tables.room_bindings_by_key.get(&key) {
            if existing_room != &binding.room_id {
                return Err(Error::storage(format!(
                    "binding {}/{}/{} already maps to room '{existing_room}'",
                    binding.channel, binding.bridge_id, binding.external_room_id
                )));
            }
        }
        tables.room_bindings_by_key.insert(key, binding.room_id.clone());
        tables.room_bindings.insert(binding.id.clone(), binding.clone());
        Ok(())
    }

    async fn delete_room_binding(&self, binding_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(binding) = tables.room_bindings.remove(binding_id) {
            tables.room_bindings_by_key.remove(&(
                binding.channel.clone(),
                binding.bridge_id.clone(),
                binding.external_room_id.clone(),
            ));
        }
        Ok(())
    }

    async fn list_room_bindings(&self, room_id: &str) -> Result<Vec<RoomBinding>> {
        Ok(self
            .tables
            .read()
            .await
            .room_bindings
            .values()
            .filter(|b| b.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn save_bridge_config(&self, config: &BridgeConfig) -> Result<()> {
        self.tables.write().await.bridge_configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_bridge_config(&self, bridge_id: &str) -> Result<Option<BridgeConfig>> {
        Ok(self.tables.read().await.bridge_configs.get(bridge_id).cloned())
    }

    async fn delete_bridge_config(&self, bridge_id: &str) -> Result<()> {
        self.tables.write().await.bridge_configs.remove(bridge_id);
        Ok(())
    }

    async fn list_bridge_configs(&self) -> Result<Vec<BridgeConfig>> {
        Ok(self.tables.read().await.bridge_configs.values().cloned().collect())
    }

    async fn save_routing_policy(&self, policy: &RoutingPolicy) -> Result<()> {
        self.tables.write().await.routing_policies.insert(policy.room_id.clone(), policy.clone());
        Ok(())
    }

    async fn get_routing_policy(&self, room_id: &str) -> Result<Option<RoutingPolicy>> {
        Ok(self.tables.read().await.routing_policies.get(room_id).cloned())
    }

    async fn delete_routing_policy(&self, room_id: &str) -> Result<()> {
        self.tables.write().await.routing_policies.remove(room_id);
        Ok(())
    }
}
