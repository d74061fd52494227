// ABOUTME: Per-room actor owning bounded history, participants, receipts, typing, threads
// ABOUTME: All operations serialize through the mailbox; every mutation publishes a hub event

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use switchboard_core::config::RoomConfig;
use switchboard_core::error::{Error, Result};
use switchboard_core::events::names;
use switchboard_core::model::{Message, MessageStatus, Participant, Presence, Room};
use switchboard_core::storage::Storage;

use crate::room::hub::{RoomEvent, RoomHub};
use crate::telemetry::Telemetry;

const MAILBOX_CAPACITY: usize = 256;

/// Outcome of an idempotent reaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Added,
    AlreadyExists,
    Removed,
    NotPresent,
}

/// Read options for message snapshots.
#[derive(Debug, Clone, Default)]
pub struct ReadOpts {
    pub limit: Option<usize>,
}

enum RoomCommand {
    AddMessage {
        message: Message,
        respond: oneshot::Sender<Result<Message>>,
    },
    AddParticipant {
        participant: Participant,
        respond: oneshot::Sender<Result<()>>,
    },
    RemoveParticipant {
        participant_id: String,
        respond: oneshot::Sender<Result<()>>,
    },
    SetPresence {
        participant_id: String,
        presence: Presence,
        respond: oneshot::Sender<Result<()>>,
    },
    AddReaction {
        message_id: String,
        participant_id: String,
        reaction: String,
        respond: oneshot::Sender<Result<ReactionOutcome>>,
    },
    RemoveReaction {
        message_id: String,
        participant_id: String,
        reaction: String,
        respond: oneshot::Sender<Result<ReactionOutcome>>,
    },
    MarkDelivered {
        message_id: String,
        participant_id: String,
        respond: oneshot::Sender<Result<MessageStatus>>,
    },
    MarkRead {
        message_id: String,
        participant_id: String,
        respond: oneshot::Sender<Result<MessageStatus>>,
    },
    SetTyping {
        participant_id: String,
        typing: bool,
        thread_id: Option<String>,
        respond: oneshot::Sender<Result<()>>,
    },
    CreateThread {
        root_id: String,
        respond: oneshot::Sender<Result<()>>,
    },
    AddThreadReply {
        root_id: String,
        message: Message,
        respond: oneshot::Sender<Result<Message>>,
    },
    GetMessages {
        opts: ReadOpts,
        respond: oneshot::Sender<Vec<Message>>,
    },
    GetThreadMessages {
        root_id: String,
        opts: ReadOpts,
        respond: oneshot::Sender<Vec<Message>>,
    },
    GetParticipants {
        respond: oneshot::Sender<Vec<Participant>>,
    },
}

/// Clonable handle to a room actor. Dropping every handle lets the actor
/// drain and hibernate.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| Error::not_found(format!("room actor '{}'", self.room_id)))?;
        rx.await
            .map_err(|_| Error::not_found(format!("room actor '{}'", self.room_id)))
    }

    pub async fn add_message(&self, message: Message) -> Result<Message> {
        self.call(|respond| RoomCommand::AddMessage { message, respond }).await?
    }

    pub async fn add_participant(&self, participant: Participant) -> Result<()> {
        self.call(|respond| RoomCommand::AddParticipant { participant, respond }).await?
    }

    pub async fn remove_participant(&self, participant_id: impl Into<String>) -> Result<()> {
        let participant_id = participant_id.into();
        self.call(|respond| RoomCommand::RemoveParticipant { participant_id, respond }).await?
    }

    pub async fn set_presence(
        &self,
        participant_id: impl Into<String>,
        presence: Presence,
    ) -> Result<()> {
        let participant_id = participant_id.into();
        self.call(|respond| RoomCommand::SetPresence { participant_id, presence, respond })
            .await?
    }

    pub async fn add_reaction(
        &self,
        message_id: impl Into<String>,
        participant_id: impl Into<String>,
        reaction: impl Into<String>,
    ) -> Result<ReactionOutcome> {
        let (message_id, participant_id, reaction) =
            (message_id.into(), participant_id.into(), reaction.into());
        self.call(|respond| RoomCommand::AddReaction {
            message_id,
            participant_id,
            reaction,
            respond,
        })
        .await?
    }

    pub async fn remove_reaction(
        &self,
        message_id: impl Into<String>,
        participant_id: impl Into<String>,
        reaction: impl Into<String>,
    ) -> Result<ReactionOutcome> {
        let (message_id, participant_id, reaction) =
            (message_id.into(), participant_id.into(), reaction.into());
        self.call(|respond| RoomCommand::RemoveReaction {
            message_id,
            participant_id,
            reaction,
            respond,
        })
        .await?
    }

    pub async fn mark_delivered(
        &self,
        message_id: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Result<MessageStatus> {
        let (message_id, participant_id) = (message_id.into(), participant_id.into());
        self.call(|respond| RoomCommand::MarkDelivered { message_id, participant_id, respond })
            .await?
    }

    pub async fn mark_read(
        &self,
        message_id: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Result<MessageStatus> {
        let (message_id, participant_id) = (message_id.into(), participant_id.into());
        self.call(|respond| RoomCommand::MarkRead { message_id, participant_id, respond })
            .await?
    }

    pub async fn set_typing(
        &self,
        participant_id: impl Into<String>,
        typing: bool,
        thread_id: Option<String>,
    ) -> Result<()> {
        let participant_id = participant_id.into();
        self.call(|respond| RoomCommand::SetTyping { participant_id, typing, thread_id, respond })
            .await?
    }

    pub async fn create_thread(&self, root_id: impl Into<String>) -> Result<()> {
        let root_id = root_id.into();
        self.call(|respond| RoomCommand::CreateThread { root_id, respond }).await?
    }

    pub async fn add_thread_reply(
        &self,
        root_id: impl Into<String>,
        message: Message,
    ) -> Result<Message> {
        let root_id = root_id.into();
        self.call(|respond| RoomCommand::AddThreadReply { root_id, message, respond }).await?
    }

    pub async fn get_messages(&self, opts: ReadOpts) -> Result<Vec<Message>> {
        self.call(|respond| RoomCommand::GetMessages { opts, respond }).await
    }

    pub async fn get_thread_messages(
        &self,
        root_id: impl Into<String>,
        opts: ReadOpts,
    ) -> Result<Vec<Message>> {
        let root_id = root_id.into();
        self.call(|respond| RoomCommand::GetThreadMessages { root_id, opts, respond }).await
    }

    pub async fn get_participants(&self) -> Result<Vec<Participant>> {
        self.call(|respond| RoomCommand::GetParticipants { respond }).await
    }
}

struct RoomActor {
    room: Room,
    /// Newest first, truncated to `config.history_capacity`.
    messages: VecDeque<Message>,
    participants: HashMap<String, Participant>,
    typing: HashMap<(String, Option<String>), Instant>,
    config: RoomConfig,
    hub: RoomHub,
    telemetry: Telemetry,
    storage: Arc<dyn Storage>,
    last_activity: Instant,
}

/// Spawn a room actor. History is loaded from storage so a restart after
/// hibernation is transparent to callers.
pub fn spawn_room_actor(
    room: Room,
    config: RoomConfig,
    hub: RoomHub,
    telemetry: Telemetry,
    storage: Arc<dyn Storage>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = RoomHandle { room_id: room.id.clone(), tx };
    tokio::spawn(run_room_actor(room, config, hub, telemetry, storage, rx));
    handle
}

async fn run_room_actor(
    room: Room,
    config: RoomConfig,
    hub: RoomHub,
    telemetry: Telemetry,
    storage: Arc<dyn Storage>,
    mut rx: mpsc::Receiver<RoomCommand>,
) {
    let history = storage
        .list_room_messages(&room.id, config.history_capacity)
        .await
        .unwrap_or_default();
    let mut actor = RoomActor {
        messages: history.into(),
        participants: HashMap::new(),
        typing: HashMap::new(),
        last_activity: Instant::now(),
        room,
        config,
        hub,
        telemetry,
        storage,
    };
    tracing::debug!(room_id = %actor.room.id, history = actor.messages.len(), "room actor started");

    loop {
        let typing_deadline = actor.typing.values().min().copied();
        let hibernate_at =
            actor.last_activity + Duration::from_millis(actor.config.hibernate_after_ms);

        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(command) => {
                        actor.last_activity = Instant::now();
                        actor.handle(command).await;
                    }
                    None => break,
                }
            }
            _ = sleep_until_opt(typing_deadline), if typing_deadline.is_some() => {
                actor.reap_typing();
            }
            _ = tokio::time::sleep_until(hibernate_at.into()) => {
                tracing::debug!(room_id = %actor.room.id, "room actor hibernating");
                if let Err(e) = actor.storage.save_room(&actor.room).await {
                    tracing::warn!(room_id = %actor.room.id, error = %e, "failed to persist room on hibernate");
                }
                break;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

impl RoomActor {
    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::AddMessage { message, respond } => {
                let _ = respond.send(self.add_message(message).await);
            }
            RoomCommand::AddParticipant { participant, respond } => {
                let _ = respond.send(self.add_participant(participant));
            }
            RoomCommand::RemoveParticipant { participant_id, respond } => {
                let _ = respond.send(self.remove_participant(&participant_id));
            }
            RoomCommand::SetPresence { participant_id, presence, respond } => {
                let _ = respond.send(self.set_presence(&participant_id, presence));
            }
            RoomCommand::AddReaction { message_id, participant_id, reaction, respond } => {
                let _ =
                    respond.send(self.add_reaction(&message_id, &participant_id, &reaction).await);
            }
            RoomCommand::RemoveReaction { message_id, participant_id, reaction, respond } => {
                let _ = respond
                    .send(self.remove_reaction(&message_id, &participant_id, &reaction).await);
            }
            RoomCommand::MarkDelivered { message_id, participant_id, respond } => {
                let _ = respond.send(
                    self.mark_receipt(&message_id, &participant_id, ReceiptKind::Delivered).await,
                );
            }
            RoomCommand::MarkRead { message_id, participant_id, respond } => {
                let _ = respond.send(
                    self.mark_receipt(&message_id, &participant_id, ReceiptKind::Read).await,
                );
            }
            RoomCommand::SetTyping { participant_id, typing, thread_id, respond } => {
                let _ = respond.send(self.set_typing(participant_id, typing, thread_id));
            }
            RoomCommand::CreateThread { root_id, respond } => {
                let _ = respond.send(self.create_thread(&root_id).await);
            }
            RoomCommand::AddThreadReply { root_id, message, respond } => {
                let _ = respond.send(self.add_thread_reply(&root_id, message).await);
            }
            RoomCommand::GetMessages { opts, respond } => {
                let _ = respond.send(self.snapshot(opts, None));
            }
            RoomCommand::GetThreadMessages { root_id, opts, respond } => {
                let _ = respond.send(self.snapshot(opts, Some(root_id)));
            }
            RoomCommand::GetParticipants { respond } => {
                let _ = respond.send(self.participants.values().cloned().collect());
            }
        }
    }

    async fn add_message(&mut self, message: Message) -> Result<Message> {
        self.messages.push_front(message.clone());
        self.messages.truncate(self.config.history_capacity);
        self.hub.publish(&self.room.id, RoomEvent::MessageAdded { message: message.clone() });
        Ok(message)
    }

    fn add_participant(&mut self, participant: Participant) -> Result<()> {
        let participant_id = participant.id.clone();
        let already = self.participants.insert(participant_id.clone(), participant).is_some();
        if !already {
            self.hub.publish(
                &self.room.id,
                RoomEvent::ParticipantAdded { participant_id: participant_id.clone() },
            );
            self.publish_presence(&participant_id, Presence::Online);
        }
        Ok(())
    }

    fn remove_participant(&mut self, participant_id: &str) -> Result<()> {
        if self.participants.remove(participant_id).is_some() {
            self.hub.publish(
                &self.room.id,
                RoomEvent::ParticipantRemoved { participant_id: participant_id.to_string() },
            );
            self.publish_presence(participant_id, Presence::Offline);
        }
        Ok(())
    }

    fn set_presence(&mut self, participant_id: &str, presence: Presence) -> Result<()> {
        let participant = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| Error::not_found(format!("participant '{participant_id}'")))?;
        if participant.presence != presence {
            participant.presence = presence;
            self.publish_presence(participant_id, presence);
        }
        Ok(())
    }

    fn publish_presence(&self, participant_id: &str, presence: Presence) {
        self.hub.publish(
            &self.room.id,
            RoomEvent::PresenceChanged { participant_id: participant_id.to_string(), presence },
        );
        self.telemetry.emit_correlated(
            names::PRESENCE_CHANGED,
            Some(&self.room.id),
            participant_id,
            serde_json::json!({"presence": format!("{presence:?}").to_lowercase()}),
        );
    }

    /// Fetch a message for mutation: bounded history first, then storage.
    async fn load_message(&mut self, message_id: &str) -> Result<Message> {
        if let Some(found) = self.messages.iter().find(|m| m.id == message_id) {
            return Ok(found.clone());
        }
        self.storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message '{message_id}'")))
    }

    /// Write back a mutated message to history and storage.
    async fn store_message(&mut self, message: Message) -> Result<()> {
        if let Some(slot) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        }
        self.storage.save_message(&message).await
    }

    async fn add_reaction(
        &mut self,
        message_id: &str,
        participant_id: &str,
        reaction: &str,
    ) -> Result<ReactionOutcome> {
        let mut message = self.load_message(message_id).await?;
        let inserted = message
            .reactions
            .entry(reaction.to_string())
            .or_default()
            .insert(participant_id.to_string());
        if !inserted {
            return Ok(ReactionOutcome::AlreadyExists);
        }
        message.updated_at = Utc::now();
        self.store_message(message).await?;
        self.hub.publish(
            &self.room.id,
            RoomEvent::ReactionAdded {
                message_id: message_id.to_string(),
                participant_id: participant_id.to_string(),
                reaction: reaction.to_string(),
            },
        );
        self.telemetry.emit_correlated(
            names::REACTION_ADDED,
            Some(&self.room.id),
            message_id,
            serde_json::json!({"reaction": reaction, "participant_id": participant_id}),
        );
        Ok(ReactionOutcome::Added)
    }

    async fn remove_reaction(
        &mut self,
        message_id: &str,
        participant_id: &str,
        reaction: &str,
    ) -> Result<ReactionOutcome> {
        let mut message = self.load_message(message_id).await?;
        let removed = match message.reactions.get_mut(reaction) {
            Some(reactors) => {
                let removed = reactors.remove(participant_id);
                if reactors.is_empty() {
                    message.reactions.remove(reaction);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return Ok(ReactionOutcome::NotPresent);
        }
        message.updated_at = Utc::now();
        self.store_message(message).await?;
        self.hub.publish(
            &self.room.id,
            RoomEvent::ReactionRemoved {
                message_id: message_id.to_string(),
                participant_id: participant_id.to_string(),
                reaction: reaction.to_string(),
            },
        );
        self.telemetry.emit_correlated(
            names::REACTION_REMOVED,
            Some(&self.room.id),
            message_id,
            serde_json::json!({"reaction": reaction, "participant_id": participant_id}),
        );
        Ok(ReactionOutcome::Removed)
    }

    async fn mark_receipt(
        &mut self,
        message_id: &str,
        participant_id: &str,
        kind: ReceiptKind,
    ) -> Result<MessageStatus> {
        let mut message = self.load_message(message_id).await?;
        let now = Utc::now();
        let receipt = message.receipts.entry(participant_id.to_string()).or_default();
        let changed = match kind {
            ReceiptKind::Delivered => receipt.mark_delivered(now),
            ReceiptKind::Read => receipt.mark_read(now),
        };

        let status_event = self.roll_up_status(&mut message);
        if changed || status_event.is_some() {
            message.updated_at = now;
            self.store_message(message.clone()).await?;
        }
        if let Some(status) = status_event {
            match status {
                MessageStatus::Delivered => {
                    self.hub.publish(
                        &self.room.id,
                        RoomEvent::MessageDelivered { message_id: message_id.to_string() },
                    );
                    self.telemetry.emit_correlated(
                        names::MESSAGE_DELIVERED,
                        Some(&self.room.id),
                        message_id,
                        serde_json::json!({}),
                    );
                }
                MessageStatus::Read => {
                    self.hub.publish(
                        &self.room.id,
                        RoomEvent::MessageRead { message_id: message_id.to_string() },
                    );
                    self.telemetry.emit_correlated(
                        names::MESSAGE_READ,
                        Some(&self.room.id),
                        message_id,
                        serde_json::json!({}),
                    );
                }
                _ => {}
            }
        }
        Ok(message.status)
    }

    /// Advance message status from the receipt set: all non-sender
    /// participants read => read; all delivered => delivered. Returns the
    /// new status when it changed.
    fn roll_up_status(&self, message: &mut Message) -> Option<MessageStatus> {
        let others: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.id != message.sender_id)
            .collect();
        if others.is_empty() {
            return None;
        }
        let all_read = others.iter().all(|p| {
            message.receipts.get(&p.id).map(|r| r.read_at.is_some()).unwrap_or(false)
        });
        let all_delivered = others.iter().all(|p| {
            message.receipts.get(&p.id).map(|r| r.delivered_at.is_some()).unwrap_or(false)
        });
        let target = if all_read {
            MessageStatus::Read
        } else if all_delivered {
            MessageStatus::Delivered
        } else {
            return None;
        };
        if message.advance_status(target) {
            Some(target)
        } else {
            None
        }
    }

    fn set_typing(
        &mut self,
        participant_id: String,
        typing: bool,
        thread_id: Option<String>,
    ) -> Result<()> {
        let key = (participant_id.clone(), thread_id.clone());
        if typing {
            let deadline = Instant::now() + Duration::from_millis(self.config.typing_timeout_ms);
            self.typing.insert(key, deadline);
            self.hub.publish(
                &self.room.id,
                RoomEvent::TypingStarted { participant_id: participant_id.clone(), thread_id },
            );
            self.telemetry.emit_correlated(
                names::TYPING,
                Some(&self.room.id),
                &participant_id,
                serde_json::json!({"typing": true}),
            );
        } else if self.typing.remove(&key).is_some() {
            self.hub.publish(
                &self.room.id,
                RoomEvent::TypingStopped { participant_id: participant_id.clone(), thread_id },
            );
            self.telemetry.emit_correlated(
                names::TYPING,
                Some(&self.room.id),
                &participant_id,
                serde_json::json!({"typing": false}),
            );
        }
        Ok(())
    }

    /// Drop typing entries whose deadline passed, emitting one
    /// `typing_stopped` per expired entry.
    fn reap_typing(&mut self) {
        let now = Instant::now();
        let expired: Vec<(String, Option<String>)> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for (participant_id, thread_id) in expired {
            self.typing.remove(&(participant_id.clone(), thread_id.clone()));
            self.hub.publish(
                &self.room.id,
                RoomEvent::TypingStopped { participant_id: participant_id.clone(), thread_id },
            );
            self.telemetry.emit_correlated(
                names::TYPING,
                Some(&self.room.id),
                &participant_id,
                serde_json::json!({"typing": false, "expired": true}),
            );
        }
    }

    async fn create_thread(&mut self, root_id: &str) -> Result<()> {
        let mut root = self.load_message(root_id).await?;
        if root.thread_root_id.as_deref() == Some(root_id) {
            return Ok(());
        }
        root.thread_root_id = Some(root_id.to_string());
        root.updated_at = Utc::now();
        self.store_message(root).await?;
        self.hub.publish(&self.room.id, RoomEvent::ThreadCreated { root_id: root_id.to_string() });
        self.telemetry.emit_correlated(
            names::THREAD_CREATED,
            Some(&self.room.id),
            root_id,
            serde_json::json!({}),
        );
        Ok(())
    }

    async fn add_thread_reply(&mut self, root_id: &str, mut message: Message) -> Result<Message> {
        let root = self.load_message(root_id).await?;
        if root.thread_root_id.as_deref() != Some(root_id) {
            return Err(Error::not_found(format!("thread root '{root_id}'")));
        }
        message.thread_root_id = Some(root_id.to_string());
        let message = self.add_message(message).await?;
        self.hub.publish(
            &self.room.id,
            RoomEvent::ThreadReplyAdded {
                root_id: root_id.to_string(),
                message_id: message.id.clone(),
            },
        );
        self.telemetry.emit_correlated(
            names::THREAD_REPLY_ADDED,
            Some(&self.room.id),
            &message.id,
            serde_json::json!({"root_id": root_id}),
        );
        Ok(message)
    }

    /// Latest-first snapshot, optionally filtered to a thread.
    fn snapshot(&self, opts: ReadOpts, thread_root: Option<String>) -> Vec<Message> {
        let limit = opts.limit.unwrap_or(self.config.history_capacity);
        self.messages
            .iter()
            .filter(|m| match &thread_root {
                // The root carries its own id as thread_root_id, so this
                // picks up the root and every reply.
                Some(root) => m.thread_root_id.as_deref() == Some(root.as_str()),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum ReceiptKind {
    Delivered,
    Read,
}
