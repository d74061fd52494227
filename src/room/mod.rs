// ABOUTME: Room subsystem: per-room actors plus the pub/sub hub between them
// ABOUTME: Actors start on demand and restart transparently after hibernation

pub mod actor;
pub mod hub;

use std::sync::Arc;

use switchboard_core::config::RoomConfig;
use switchboard_core::model::Room;
use switchboard_core::storage::Storage;

use crate::supervisor::ActorTable;
use crate::telemetry::Telemetry;

pub use actor::{ReactionOutcome, ReadOpts, RoomHandle};
pub use hub::{RoomEvent, RoomHub};

/// Owns the actor table for all live rooms in one instance. A hibernated
/// or crashed actor is restarted on the next lookup.
pub struct RoomActors {
    table: ActorTable<String, RoomHandle>,
    config: RoomConfig,
    hub: RoomHub,
    telemetry: Telemetry,
    storage: Arc<dyn Storage>,
}

impl RoomActors {
    pub fn new(
        config: RoomConfig,
        hub: RoomHub,
        telemetry: Telemetry,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self { table: ActorTable::new(), config, hub, telemetry, storage }
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    /// Handle for a room, starting its actor when none is running.
    pub fn handle_for(&self, room: &Room) -> RoomHandle {
        let config = self.config.clone();
        let hub = self.hub.clone();
        let telemetry = self.telemetry.clone();
        let storage = Arc::clone(&self.storage);
        let room = room.clone();
        self.table.get_or_start(
            room.id.clone(),
            RoomHandle::is_alive,
            move || actor::spawn_room_actor(room, config, hub, telemetry, storage),
        )
    }

    /// Handle only if an actor is currently live.
    pub fn live_handle(&self, room_id: &str) -> Option<RoomHandle> {
        self.table.get(&room_id.to_string()).filter(RoomHandle::is_alive)
    }

    pub fn live_rooms(&self) -> usize {
        self.table.keys().len()
    }
}
