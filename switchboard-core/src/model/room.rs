// ABOUTME: Room and RoomBinding value types
// ABOUTME: A binding maps {channel, bridge, external_room_id} to at most one room

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Direct,
    Group,
    Channel,
    Thread,
}

/// External identity of a room on one platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalBinding {
    pub channel: String,
    pub bridge: String,
    pub external_room_id: String,
}

/// A conversation. Owned by its room actor while one is running; persisted
/// through the storage contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub room_type: RoomType,
    pub name: Option<String>,
    pub external_bindings: BTreeSet<ExternalBinding>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(room_type: RoomType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_type,
            name: None,
            external_bindings: BTreeSet::new(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Which directions a binding carries traffic in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingDirection {
    Inbound,
    Outbound,
    Both,
}

impl BindingDirection {
    pub fn allows_outbound(self) -> bool {
        matches!(self, BindingDirection::Outbound | BindingDirection::Both)
    }

    pub fn allows_inbound(self) -> bool {
        matches!(self, BindingDirection::Inbound | BindingDirection::Both)
    }
}

/// Link between an internal room and an external platform room.
/// `{channel, bridge_id, external_room_id}` is unique within an instance;
/// a room may carry many bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomBinding {
    pub id: String,
    pub room_id: String,
    pub channel: String,
    pub bridge_id: String,
    pub external_room_id: String,
    pub direction: BindingDirection,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl RoomBinding {
    pub fn new(
        room_id: impl Into<String>,
        channel: impl Into<String>,
        bridge_id: impl Into<String>,
        external_room_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            channel: channel.into(),
            bridge_id: bridge_id.into(),
            external_room_id: external_room_id.into(),
            direction: BindingDirection::Both,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_direction(mut self, direction: BindingDirection) -> Self {
        self.direction = direction;
        self
    }
}
