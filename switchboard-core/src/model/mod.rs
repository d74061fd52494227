// ABOUTME: Value types shared across the runtime
// ABOUTME: Rooms, participants, messages and their content blocks

mod message;
mod participant;
mod room;

pub use message::{ContentBlock, MediaKind, Message, MessageStatus, Receipt, Role};
pub use participant::{Participant, ParticipantType, Presence};
pub use room::{BindingDirection, ExternalBinding, Room, RoomBinding, RoomType};
