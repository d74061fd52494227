// ABOUTME: Inbound orchestration: dedup, verify, resolve, media, policy, persist, fan-out
// ABOUTME: Stages fail fast; later stages only ever see messages earlier stages accepted

pub mod media;
pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use switchboard_core::adapter::{Capability, ChatType, Incoming, VerifyOutcome};
use switchboard_core::config::{IngestConfig, MediaPolicyConfig, VerifyFailurePolicy};
use switchboard_core::delivery::{Route, SessionKey};
use switchboard_core::error::{Error, Result};
use switchboard_core::events::names;
use switchboard_core::model::{
    ContentBlock, Message, MessageStatus, Participant, Role, Room, RoomType,
};
use switchboard_core::storage::{ParticipantAttrs, RoomAttrs, Storage};

use crate::bridge::AdapterBridge;
use crate::dedup::{DedupFilter, DedupVerdict, Fingerprint};
use crate::room::RoomActors;
use crate::session_route::{SessionRouteStore, SetOpts};
use crate::telemetry::Telemetry;

pub use media::{normalize_media, MediaOutcome};
pub use policy::{
    GateDecision, Gater, ModerationDecision, Moderator, PolicyFlag, PolicyOutcome,
    PolicyPipeline,
};

/// Extra context an accepted message carries out of the pipeline.
#[derive(Debug)]
pub struct IngestContext {
    pub room: Room,
    pub participant: Participant,
    pub flags: Vec<PolicyFlag>,
    pub routing_metadata: serde_json::Value,
    pub command_hint: Option<String>,
    /// Set when sender verification errored but policy allowed the
    /// message through.
    pub verification_fallback: bool,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Accepted { message: Message, context: Box<IngestContext> },
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOpts {
    pub metadata: serde_json::Value,
}

/// The inbound pipeline for one instance.
pub struct IngestPipeline {
    config: IngestConfig,
    media_config: MediaPolicyConfig,
    dedup: Arc<DedupFilter>,
    policy: Arc<PolicyPipeline>,
    storage: Arc<dyn Storage>,
    sessions: Arc<SessionRouteStore>,
    rooms: Arc<RoomActors>,
    telemetry: Telemetry,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IngestConfig,
        media_config: MediaPolicyConfig,
        dedup: Arc<DedupFilter>,
        policy: Arc<PolicyPipeline>,
        storage: Arc<dyn Storage>,
        sessions: Arc<SessionRouteStore>,
        rooms: Arc<RoomActors>,
        telemetry: Telemetry,
    ) -> Self {
        Self { config, media_config, dedup, policy, storage, sessions, rooms, telemetry }
    }

    /// Single public entry: take a raw platform payload off a bridge and
    /// run it through every stage.
    pub async fn ingest_incoming(
        &self,
        bridge: &AdapterBridge,
        raw: serde_json::Value,
        opts: IngestOpts,
    ) -> Result<IngestOutcome> {
        let incoming = bridge.transform_incoming(raw)?;

        // Stage 1: fingerprint + dedup. Messages without an external id
        // pass straight through; the outbound idempotency cache owns those.
        if let Some(external_message_id) = &incoming.external_message_id {
            let fingerprint = Fingerprint::new(
                bridge.channel_type(),
                bridge.bridge_id(),
                &incoming.external_room_id,
                external_message_id,
            );
            if self.dedup.check_and_mark(&fingerprint) == DedupVerdict::Duplicate {
                tracing::debug!(
                    bridge_id = %bridge.bridge_id(),
                    external_message_id = %external_message_id,
                    "duplicate suppressed"
                );
                return Ok(IngestOutcome::Duplicate);
            }
        }

        // Stage 2: sender verification
        let verification_fallback = self.verify_sender(bridge, &incoming).await?;

        // Stage 3 + 4: room and participant resolution
        let room = self
            .storage
            .get_or_create_room_by_external_binding(
                bridge.channel_type(),
                bridge.bridge_id(),
                &incoming.external_room_id,
                RoomAttrs {
                    room_type: Some(room_type_for(incoming.chat_type)),
                    name: incoming.chat_title.clone(),
                    metadata: serde_json::Value::Null,
                },
            )
            .await?;
        let participant = self
            .storage
            .get_or_create_participant_by_external_id(
                bridge.channel_type(),
                &incoming.external_user_id,
                ParticipantAttrs {
                    identity: incoming.username.clone(),
                    display_name: incoming.display_name.clone(),
                },
            )
            .await?;

        // Stage 5: content
        let message = self
            .build_message(bridge, &incoming, &room, &participant, &opts, verification_fallback)
            .await?;

        // Stage 6: policy pipeline
        let PolicyOutcome { mut message, flags } =
            self.policy.run(message, &self.config, &self.telemetry).await?;
        if !flags.is_empty() {
            attach_flags(&mut message, &flags);
        }

        // Stage 7: persist
        message.advance_status(MessageStatus::Sent);
        self.storage.save_message(&message).await?;

        // Stage 8: session route for the reply path
        let session_key = session_key_for(bridge, &incoming);
        let route = Route {
            bridge_id: bridge.bridge_id().to_string(),
            external_room_id: incoming.external_room_id.clone(),
            external_thread_id: incoming.external_thread_id.clone(),
        };
        self.sessions.set(session_key, route, SetOpts::default());

        // Stage 9: fan-out through the room actor
        let handle = self.rooms.handle_for(&room);
        handle.add_participant(participant.clone()).await?;
        let message = handle.add_message(message).await?;

        self.telemetry.emit_correlated(
            names::MESSAGE_RECEIVED,
            Some(&room.id),
            &message.id,
            serde_json::json!({
                "bridge_id": bridge.bridge_id(),
                "channel": bridge.channel_type(),
                "sender_id": participant.id,
            }),
        );

        let context = IngestContext {
            routing_metadata: bridge.extract_routing_metadata(&incoming),
            command_hint: incoming
                .text
                .as_deref()
                .and_then(|text| bridge.extract_command_hint(text)),
            room,
            participant,
            flags,
            verification_fallback,
        };
        Ok(IngestOutcome::Accepted { message, context: Box::new(context) })
    }

    /// Stage 2. Returns whether the message proceeds under a verification
    /// fallback flag. Explicit denials always short-circuit; errors map
    /// through strictness and the configured failure policy.
    async fn verify_sender(&self, bridge: &AdapterBridge, incoming: &Incoming) -> Result<bool> {
        if !bridge.supports(Capability::SenderVerification) {
            return Ok(false);
        }
        let timeout = Duration::from_millis(self.config.verify_timeout_ms);
        match bridge.verify_sender(incoming, timeout).await {
            Ok(VerifyOutcome::Allow) => {
                self.emit_security(incoming, "allow", None);
                Ok(false)
            }
            Ok(VerifyOutcome::Deny { reason, description }) => {
                self.emit_security(incoming, "deny", Some(&reason));
                Err(Error::SecurityDenied { stage: "verify".into(), reason, description })
            }
            Err(failure) => {
                let deny = self.config.strict_verification
                    && self.config.verify_failure_policy == VerifyFailurePolicy::Deny;
                if deny {
                    self.emit_security(incoming, "deny", Some("verify_error"));
                    Err(Error::SecurityDenied {
                        stage: "verify".into(),
                        reason: "verify_error".into(),
                        description: failure.to_string(),
                    })
                } else {
                    self.emit_security(incoming, "allow_with_fallback", Some("verify_error"));
                    Ok(true)
                }
            }
        }
    }

    fn emit_security(&self, incoming: &Incoming, decision: &str, reason: Option<&str>) {
        self.telemetry.emit_correlated(
            names::SECURITY_DECISION,
            None,
            incoming.external_message_id.as_deref().unwrap_or("unknown"),
            serde_json::json!({
                "stage": "verify",
                "decision": decision,
                "reason": reason,
                "external_user_id": incoming.external_user_id,
            }),
        );
    }

    /// Stage 5: text block plus policy-normalized media blocks, reply and
    /// thread links resolved against already-persisted messages.
    async fn build_message(
        &self,
        bridge: &AdapterBridge,
        incoming: &Incoming,
        room: &Room,
        participant: &Participant,
        opts: &IngestOpts,
        verification_fallback: bool,
    ) -> Result<Message> {
        let mut message = Message::new(&room.id, &participant.id, Role::User);
        if let Some(text) = &incoming.text {
            message.content.push(ContentBlock::text(text.as_str()));
        }
        let media_outcome = normalize_media(&incoming.media, &self.media_config)?;
        message.content.extend(media_outcome.blocks);
        if message.content.is_empty() {
            return Err(Error::Unsupported("message with no usable content".into()));
        }

        message.external_id = incoming.external_message_id.clone();
        if let Some(timestamp) = incoming.timestamp {
            message.created_at = timestamp;
        }
        if let Some(external_reply) = &incoming.external_reply_to_id {
            if let Some(target) = self
                .storage
                .get_message_by_external_id(bridge.channel_type(), external_reply)
                .await?
            {
                message.reply_to_id = Some(target.id);
            }
        }
        if let Some(external_thread) = &incoming.external_thread_id {
            if let Some(root) = self
                .storage
                .get_message_by_external_id(bridge.channel_type(), external_thread)
                .await?
            {
                message.thread_root_id = Some(root.thread_root_id.unwrap_or(root.id));
            }
        }

        let mut metadata = serde_json::json!({
            "bridge_id": bridge.bridge_id(),
            "channel": bridge.channel_type(),
            "external_room_id": incoming.external_room_id,
            "external_user_id": incoming.external_user_id,
            "was_mentioned": incoming.was_mentioned,
        });
        if !incoming.mentions.is_empty() {
            metadata["mentions"] = serde_json::json!(incoming.mentions);
        }
        if verification_fallback {
            metadata["fallback"] = serde_json::Value::Bool(true);
        }
        if !opts.metadata.is_null() {
            metadata["caller"] = opts.metadata.clone();
        }
        message.metadata = metadata;
        Ok(message)
    }
}

fn room_type_for(chat_type: ChatType) -> RoomType {
    match chat_type {
        ChatType::Private => RoomType::Direct,
        ChatType::Group | ChatType::Supergroup | ChatType::Unknown => RoomType::Group,
        ChatType::Channel => RoomType::Channel,
        ChatType::Thread => RoomType::Thread,
    }
}

fn session_key_for(bridge: &AdapterBridge, incoming: &Incoming) -> SessionKey {
    let mut key = SessionKey::new(
        bridge.channel_type(),
        bridge.bridge_id(),
        &incoming.external_room_id,
    );
    if let Some(thread) = &incoming.external_thread_id {
        key = key.with_thread(thread);
    }
    key
}

fn attach_flags(message: &mut Message, flags: &[PolicyFlag]) {
    let rendered: Vec<serde_json::Value> = flags
        .iter()
        .map(|f| {
            serde_json::json!({
                "source": f.source,
                "reason": f.reason,
                "description": f.description,
            })
        })
        .collect();
    if !message.metadata.is_object() {
        message.metadata = serde_json::json!({});
    }
    message.metadata["policy_flags"] = serde_json::Value::Array(rendered);
}
