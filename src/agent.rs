// ABOUTME: Per-(room, agent) subscriber: trigger match, handler invocation, reply emission
// ABOUTME: Replies flow back through the normal outbound pipeline, never directly to the room

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use switchboard_core::error::Result;
use switchboard_core::events::names;
use switchboard_core::model::{Message, Role};

use crate::room::{RoomEvent, RoomHub};
use crate::telemetry::Telemetry;

const RESUBSCRIBE_DELAY_MS: u64 = 100;

/// What fires an agent for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Every non-self message.
    All,
    /// Concatenated text contains `@<agent_name>`.
    Mention,
    /// Normalized text starts with the prefix.
    Prefix(String),
}

impl Trigger {
    pub fn matches(&self, message: &Message, agent_name: &str) -> bool {
        match self {
            Trigger::All => true,
            Trigger::Mention => {
                message.concatenated_text().contains(&format!("@{agent_name}"))
            }
            Trigger::Prefix(prefix) => message
                .concatenated_text()
                .trim_start()
                .to_lowercase()
                .starts_with(&prefix.to_lowercase()),
        }
    }
}

/// Everything a handler gets besides the message itself.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub room_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Reply(String),
    NoReply,
    Error(String),
}

/// Application-supplied agent logic.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, message: &Message, context: &AgentContext) -> HandlerOutcome;
}

/// Where agent replies go: persisted, added to the room, and routed
/// outbound by the instance.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver_reply(&self, message: Message) -> Result<()>;
}

#[derive(Clone)]
pub struct AgentConfig {
    pub name: String,
    pub trigger: Trigger,
    pub handler: Arc<dyn AgentHandler>,
}

/// Handle to a running agent actor.
#[derive(Clone)]
pub struct AgentHandle {
    pub room_id: String,
    pub agent_id: String,
    task: Arc<tokio::task::JoinHandle<()>>,
}

impl AgentHandle {
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Start an agent actor subscribed to a room's message stream.
pub fn start_agent(
    room_id: impl Into<String>,
    agent_id: impl Into<String>,
    config: AgentConfig,
    hub: RoomHub,
    telemetry: Telemetry,
    reply_sink: Arc<dyn ReplySink>,
) -> AgentHandle {
    let room_id = room_id.into();
    let agent_id = agent_id.into();
    let context = AgentContext {
        room_id: room_id.clone(),
        agent_id: agent_id.clone(),
        agent_name: config.name.clone(),
        instance_id: telemetry.instance_id().to_string(),
    };
    let task = tokio::spawn(run_agent(context.clone(), config, hub, telemetry, reply_sink));
    AgentHandle { room_id, agent_id, task: Arc::new(task) }
}

async fn run_agent(
    context: AgentContext,
    config: AgentConfig,
    hub: RoomHub,
    telemetry: Telemetry,
    reply_sink: Arc<dyn ReplySink>,
) {
    let mut rx = hub.subscribe(&context.room_id);
    tracing::debug!(
        room_id = %context.room_id,
        agent_id = %context.agent_id,
        agent = %config.name,
        "agent subscribed"
    );
    loop {
        match rx.recv().await {
            Ok(RoomEvent::MessageAdded { message }) => {
                handle_message(&context, &config, &telemetry, &reply_sink, message).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    room_id = %context.room_id,
                    agent_id = %context.agent_id,
                    skipped,
                    "agent subscription lagged"
                );
            }
            Err(broadcast::error::RecvError::Closed) => {
                // Transient: the topic may be recreated; retry after a beat
                tokio::time::sleep(std::time::Duration::from_millis(RESUBSCRIBE_DELAY_MS)).await;
                rx = hub.subscribe(&context.room_id);
            }
        }
    }
}

async fn handle_message(
    context: &AgentContext,
    config: &AgentConfig,
    telemetry: &Telemetry,
    reply_sink: &Arc<dyn ReplySink>,
    message: Message,
) {
    // Never respond to our own output
    if message.sender_id == context.agent_id {
        return;
    }
    if !config.trigger.matches(&message, &config.name) {
        return;
    }

    telemetry.emit_correlated(
        names::AGENT_TRIGGERED,
        Some(&context.room_id),
        &message.id,
        serde_json::json!({"agent_id": context.agent_id, "agent": config.name}),
    );
    telemetry.emit_correlated(
        names::AGENT_STARTED,
        Some(&context.room_id),
        &message.id,
        serde_json::json!({"agent_id": context.agent_id}),
    );

    match config.handler.handle(&message, context).await {
        HandlerOutcome::Reply(text) => {
            let reply = Message::new(&context.room_id, &context.agent_id, Role::Assistant)
                .with_text(text);
            let reply = Message { reply_to_id: Some(message.id.clone()), ..reply };
            match reply_sink.deliver_reply(reply).await {
                Ok(()) => telemetry.emit_correlated(
                    names::AGENT_COMPLETED,
                    Some(&context.room_id),
                    &message.id,
                    serde_json::json!({"agent_id": context.agent_id, "replied": true}),
                ),
                Err(e) => telemetry.emit_correlated(
                    names::AGENT_FAILED,
                    Some(&context.room_id),
                    &message.id,
                    serde_json::json!({"agent_id": context.agent_id, "error": e.to_string()}),
                ),
            }
        }
        HandlerOutcome::NoReply => {
            telemetry.emit_correlated(
                names::AGENT_COMPLETED,
                Some(&context.room_id),
                &message.id,
                serde_json::json!({"agent_id": context.agent_id, "replied": false}),
            );
        }
        HandlerOutcome::Error(reason) => {
            tracing::warn!(
                agent_id = %context.agent_id,
                room_id = %context.room_id,
                %reason,
                "agent handler failed"
            );
            telemetry.emit_correlated(
                names::AGENT_FAILED,
                Some(&context.room_id),
                &message.id,
                serde_json::json!({"agent_id": context.agent_id, "error": reason}),
            );
        }
    }
}
