// ABOUTME: Integration tests for room actors
// ABOUTME: Receipt monotonicity, typing expiry, reactions, threads, history bounds

use std::sync::Arc;
use std::time::Duration;

use switchboard::core::config::RoomConfig;
use switchboard::core::model::{MessageStatus, Participant, Role};
use switchboard::core::storage::{RoomAttrs, Storage};
use switchboard::room::{ReactionOutcome, ReadOpts, RoomActors, RoomEvent, RoomHub};
use switchboard::{MemoryStorage, Telemetry};

struct Fixture {
    rooms: RoomActors,
    storage: Arc<MemoryStorage>,
    hub: RoomHub,
}

fn fixture(config: RoomConfig) -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let hub = RoomHub::new();
    let rooms = RoomActors::new(
        config,
        hub.clone(),
        Telemetry::new("room-test"),
        storage.clone(),
    );
    Fixture { rooms, storage, hub }
}

async fn seeded_room(f: &Fixture) -> switchboard::core::model::Room {
    f.storage
        .get_or_create_room_by_external_binding("mock", "b1", "c1", RoomAttrs::default())
        .await
        .unwrap()
}

fn participant(id: &str) -> Participant {
    let mut p = Participant::human(id);
    p.id = id.to_string();
    p
}

async fn message_in(
    f: &Fixture,
    room: &switchboard::core::model::Room,
    sender: &str,
    text: &str,
) -> switchboard::core::model::Message {
    let mut m = switchboard::core::model::Message::new(&room.id, sender, Role::User)
        .with_text(text);
    m.advance_status(MessageStatus::Sent);
    f.storage.save_message(&m).await.unwrap();
    f.rooms.handle_for(room).add_message(m).await.unwrap()
}

// =============================================================================
// PROPERTY: Receipts are monotone; message status never regresses
// =============================================================================
#[tokio::test]
async fn test_read_then_delivered_does_not_regress() {
    let f = fixture(RoomConfig::default());
    let room = seeded_room(&f).await;
    let handle = f.rooms.handle_for(&room);
    handle.add_participant(participant("alice")).await.unwrap();
    handle.add_participant(participant("bob")).await.unwrap();

    let message = message_in(&f, &room, "alice", "hi").await;

    // The only non-sender participant reads: status goes straight to read
    let status = handle.mark_read(&message.id, "bob").await.unwrap();
    assert_eq!(status, MessageStatus::Read);

    // A later delivered receipt for the same pair must not regress anything
    let status = handle.mark_delivered(&message.id, "bob").await.unwrap();
    assert_eq!(status, MessageStatus::Read);

    let stored = f.storage.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Read);
    let receipt = stored.receipts.get("bob").unwrap();
    assert!(receipt.read_at.is_some());
    assert!(receipt.delivered_at.is_some(), "read implied delivered");
}

#[tokio::test]
async fn test_status_advances_when_all_participants_reach_rank() {
    let f = fixture(RoomConfig::default());
    let room = seeded_room(&f).await;
    let handle = f.rooms.handle_for(&room);
    handle.add_participant(participant("alice")).await.unwrap();
    handle.add_participant(participant("bob")).await.unwrap();
    handle.add_participant(participant("carol")).await.unwrap();

    let message = message_in(&f, &room, "alice", "hi").await;

    // One of two non-senders delivered: status stays sent
    let status = handle.mark_delivered(&message.id, "bob").await.unwrap();
    assert_eq!(status, MessageStatus::Sent);
    // Both delivered: delivered
    let status = handle.mark_delivered(&message.id, "carol").await.unwrap();
    assert_eq!(status, MessageStatus::Delivered);
    // Both read: read
    handle.mark_read(&message.id, "bob").await.unwrap();
    let status = handle.mark_read(&message.id, "carol").await.unwrap();
    assert_eq!(status, MessageStatus::Read);
}

// =============================================================================
// Reactions: idempotent add, symmetric remove
// =============================================================================
#[tokio::test]
async fn test_reaction_add_remove_idempotence() {
    let f = fixture(RoomConfig::default());
    let room = seeded_room(&f).await;
    let handle = f.rooms.handle_for(&room);
    let message = message_in(&f, &room, "alice", "hi").await;

    assert_eq!(
        handle.add_reaction(&message.id, "bob", "👍").await.unwrap(),
        ReactionOutcome::Added
    );
    assert_eq!(
        handle.add_reaction(&message.id, "bob", "👍").await.unwrap(),
        ReactionOutcome::AlreadyExists
    );
    assert_eq!(
        handle.remove_reaction(&message.id, "bob", "👍").await.unwrap(),
        ReactionOutcome::Removed
    );
    assert_eq!(
        handle.remove_reaction(&message.id, "bob", "👍").await.unwrap(),
        ReactionOutcome::NotPresent
    );

    // Removing the last reactor removes the key entirely
    let stored = f.storage.get_message(&message.id).await.unwrap().unwrap();
    assert!(stored.reactions.is_empty());
}

// =============================================================================
// PROPERTY: Typing auto-expiry emits exactly one typing_stopped
// =============================================================================
#[tokio::test]
async fn test_typing_expires_exactly_once() {
    let f = fixture(RoomConfig { typing_timeout_ms: 50, ..Default::default() });
    let room = seeded_room(&f).await;
    let mut events = f.hub.subscribe(&room.id);
    let handle = f.rooms.handle_for(&room);

    handle.set_typing("alice", true, None).await.unwrap();

    let mut started = 0;
    let mut stopped = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(RoomEvent::TypingStarted { .. })) => started += 1,
            Ok(Ok(RoomEvent::TypingStopped { .. })) => stopped += 1,
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert_eq!(started, 1);
    assert_eq!(stopped, 1, "exactly one typing_stopped after expiry");
}

#[tokio::test]
async fn test_explicit_typing_stop_suppresses_expiry() {
    let f = fixture(RoomConfig { typing_timeout_ms: 50, ..Default::default() });
    let room = seeded_room(&f).await;
    let mut events = f.hub.subscribe(&room.id);
    let handle = f.rooms.handle_for(&room);

    handle.set_typing("alice", true, None).await.unwrap();
    handle.set_typing("alice", false, None).await.unwrap();

    let mut stopped = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(RoomEvent::TypingStopped { .. })) => stopped += 1,
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert_eq!(stopped, 1, "explicit stop, no expiry duplicate");
}

// =============================================================================
// Threads: idempotent creation, replies require a root
// =============================================================================
#[tokio::test]
async fn test_thread_lifecycle() {
    let f = fixture(RoomConfig::default());
    let room = seeded_room(&f).await;
    let handle = f.rooms.handle_for(&room);
    let root = message_in(&f, &room, "alice", "root").await;

    handle.create_thread(&root.id).await.unwrap();
    // Idempotent
    handle.create_thread(&root.id).await.unwrap();

    let reply = switchboard::core::model::Message::new(&room.id, "bob", Role::User)
        .with_text("reply");
    let reply = handle.add_thread_reply(&root.id, reply).await.unwrap();
    assert_eq!(reply.thread_root_id.as_deref(), Some(root.id.as_str()));

    let thread = handle
        .get_thread_messages(&root.id, ReadOpts::default())
        .await
        .unwrap();
    assert_eq!(thread.len(), 2, "root plus reply");

    // Replying to a non-thread message fails
    let other = message_in(&f, &room, "alice", "plain").await;
    let orphan = switchboard::core::model::Message::new(&room.id, "bob", Role::User)
        .with_text("lost");
    assert!(handle.add_thread_reply(&other.id, orphan).await.is_err());
}

// =============================================================================
// History is bounded and latest-first
// =============================================================================
#[tokio::test]
async fn test_history_truncates_to_capacity() {
    let f = fixture(RoomConfig { history_capacity: 3, ..Default::default() });
    let room = seeded_room(&f).await;
    let handle = f.rooms.handle_for(&room);
    for i in 0..5 {
        message_in(&f, &room, "alice", &format!("msg-{i}")).await;
    }
    let history = handle.get_messages(ReadOpts::default()).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].concatenated_text(), "msg-4", "latest first");
    assert_eq!(history[2].concatenated_text(), "msg-2");
}

// =============================================================================
// Hibernated actors restart transparently with persisted history
// =============================================================================
#[tokio::test]
async fn test_restart_after_hibernation_reloads_history() {
    let f = fixture(RoomConfig { hibernate_after_ms: 30, ..Default::default() });
    let room = seeded_room(&f).await;
    let message = message_in(&f, &room, "alice", "before hibernation").await;

    // Wait past the hibernation deadline
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.rooms.live_handle(&room.id).is_none(), "actor hibernated");

    // A fresh lookup restarts the actor; history comes back from storage
    let handle = f.rooms.handle_for(&room);
    let history = handle.get_messages(ReadOpts::default()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message.id);
}
