// ABOUTME: The storage contract the runtime persists through
// ABOUTME: Backends supply single-writer-per-entity semantics; the core does not serialize storage

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Message, Participant, Room, RoomBinding, RoomType};
use crate::routing::{BridgeConfig, RoutingPolicy};

/// Attributes used when an external binding creates a room on first contact.
#[derive(Debug, Clone, Default)]
pub struct RoomAttrs {
    pub room_type: Option<RoomType>,
    pub name: Option<String>,
    pub metadata: serde_json::Value,
}

/// Attributes used when an external id creates a participant on first contact.
#[derive(Debug, Clone, Default)]
pub struct ParticipantAttrs {
    pub identity: Option<String>,
    pub display_name: Option<String>,
}

/// Persistence boundary. Implementations must uphold:
/// - `{channel, bridge_id, external_room_id}` maps to at most one room;
/// - get-or-create operations are atomic per key;
/// - writes to a single entity are serialized.
#[async_trait]
pub trait Storage: Send + Sync {
    // Rooms
    async fn save_room(&self, room: &Room) -> Result<()>;
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>>;
    async fn delete_room(&self, room_id: &str) -> Result<()>;
    async fn list_rooms(&self) -> Result<Vec<Room>>;

    /// Resolve an external room to the internal one, creating room and
    /// binding when absent.
    async fn get_or_create_room_by_external_binding(
        &self,
        channel: &str,
        bridge_id: &str,
        external_room_id: &str,
        attrs: RoomAttrs,
    ) -> Result<Room>;

    // Participants
    async fn save_participant(&self, participant: &Participant) -> Result<()>;
    async fn get_participant(&self, participant_id: &str) -> Result<Option<Participant>>;
    async fn delete_participant(&self, participant_id: &str) -> Result<()>;
    async fn list_participants(&self) -> Result<Vec<Participant>>;

    async fn get_or_create_participant_by_external_id(
        &self,
        channel: &str,
        external_user_id: &str,
        attrs: ParticipantAttrs,
    ) -> Result<Participant>;

    /// Name-prefix directory search over participant identities.
    async fn directory_search(&self, query: &str) -> Result<Vec<Participant>>;

    // Messages
    async fn save_message(&self, message: &Message) -> Result<()>;
    async fn get_message(&self, message_id: &str) -> Result<Option<Message>>;
    async fn delete_message(&self, message_id: &str) -> Result<()>;
    /// Latest-first messages for a room, bounded by `limit`.
    async fn list_room_messages(&self, room_id: &str, limit: usize) -> Result<Vec<Message>>;
    async fn get_message_by_external_id(
        &self,
        channel: &str,
        external_id: &str,
    ) -> Result<Option<Message>>;
    async fn update_message_external_id(
        &self,
        message_id: &str,
        external_id: &str,
    ) -> Result<()>;

    // Room bindings
    async fn create_room_binding(&self, binding: &RoomBinding) -> Result<()>;
    async fn delete_room_binding(&self, binding_id: &str) -> Result<()>;
    async fn list_room_bindings(&self, room_id: &str) -> Result<Vec<RoomBinding>>;

    // Control plane
    async fn save_bridge_config(&self, config: &BridgeConfig) -> Result<()>;
    async fn get_bridge_config(&self, bridge_id: &str) -> Result<Option<BridgeConfig>>;
    async fn delete_bridge_config(&self, bridge_id: &str) -> Result<()>;
    async fn list_bridge_configs(&self) -> Result<Vec<BridgeConfig>>;

    async fn save_routing_policy(&self, policy: &RoutingPolicy) -> Result<()>;
    async fn get_routing_policy(&self, room_id: &str) -> Result<Option<RoutingPolicy>>;
    async fn delete_routing_policy(&self, room_id: &str) -> Result<()>;
}
