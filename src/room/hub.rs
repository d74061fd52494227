// ABOUTME: In-process pub/sub hub with one broadcast topic per room
// ABOUTME: Rooms publish, agents and observers subscribe; neither side holds the other

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use switchboard_core::model::{Message, Presence};

const TOPIC_CAPACITY: usize = 256;

/// Structured event published for every room mutation.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    MessageAdded {
        message: Message,
    },
    ParticipantAdded {
        participant_id: String,
    },
    ParticipantRemoved {
        participant_id: String,
    },
    PresenceChanged {
        participant_id: String,
        presence: Presence,
    },
    ReactionAdded {
        message_id: String,
        participant_id: String,
        reaction: String,
    },
    ReactionRemoved {
        message_id: String,
        participant_id: String,
        reaction: String,
    },
    MessageDelivered {
        message_id: String,
    },
    MessageRead {
        message_id: String,
    },
    TypingStarted {
        participant_id: String,
        thread_id: Option<String>,
    },
    TypingStopped {
        participant_id: String,
        thread_id: Option<String>,
    },
    ThreadCreated {
        root_id: String,
    },
    ThreadReplyAdded {
        root_id: String,
        message_id: String,
    },
}

/// Hub keyed by room id. Topics are created lazily on first publish or
/// subscribe and live for the life of the instance.
#[derive(Clone, Default)]
pub struct RoomHub {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<RoomEvent>>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, room_id: &str) -> broadcast::Sender<RoomEvent> {
        if let Some(sender) = self
            .topics
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(room_id)
        {
            return sender.clone();
        }
        let mut topics = self.topics.write().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish an event to a room's subscribers. No subscribers is fine.
    pub fn publish(&self, room_id: &str, event: RoomEvent) {
        let _ = self.topic(room_id).send(event);
    }

    /// Subscribe to one room's event stream.
    pub fn subscribe(&self, room_id: &str) -> broadcast::Receiver<RoomEvent> {
        self.topic(room_id).subscribe()
    }

    /// Number of live subscribers for a room.
    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(room_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::model::Role;

    #[tokio::test]
    async fn test_publish_reaches_room_subscribers() {
        let hub = RoomHub::new();
        let mut rx = hub.subscribe("room-1");
        let message = Message::new("room-1", "u1", Role::User).with_text("hi");
        hub.publish("room-1", RoomEvent::MessageAdded { message });
        match rx.recv().await.unwrap() {
            RoomEvent::MessageAdded { message } => assert_eq!(message.room_id, "room-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = RoomHub::new();
        let mut rx_other = hub.subscribe("room-2");
        hub.publish(
            "room-1",
            RoomEvent::ThreadCreated { root_id: "m1".into() },
        );
        assert!(matches!(
            rx_other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let hub = RoomHub::new();
        hub.publish(
            "lonely",
            RoomEvent::TypingStarted { participant_id: "p".into(), thread_id: None },
        );
        assert_eq!(hub.subscriber_count("lonely"), 0);
    }
}
