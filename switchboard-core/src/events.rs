// ABOUTME: Stable telemetry event names and the structured signal envelope
// ABOUTME: One emit feeds both the metrics recorder and signal subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable telemetry event names consumed by observers. These strings are
/// an interface: renaming one is a breaking change.
pub mod names {
    pub const MESSAGE_RECEIVED: &str = "messaging.message.received";
    pub const MESSAGE_SENT: &str = "messaging.message.sent";
    pub const MESSAGE_FAILED: &str = "messaging.message.failed";
    pub const MESSAGE_DELIVERED: &str = "messaging.message.delivered";
    pub const MESSAGE_READ: &str = "messaging.message.read";
    pub const REACTION_ADDED: &str = "messaging.message.reaction_added";
    pub const REACTION_REMOVED: &str = "messaging.message.reaction_removed";

    pub const PRESENCE_CHANGED: &str = "messaging.participant.presence_changed";
    pub const TYPING: &str = "messaging.participant.typing";

    pub const THREAD_CREATED: &str = "messaging.thread.created";
    pub const THREAD_REPLY_ADDED: &str = "messaging.thread.reply_added";

    pub const DELIVERY_QUEUED: &str = "messaging.delivery.queued";
    pub const DELIVERY_ATTEMPT: &str = "messaging.delivery.attempt";
    pub const DELIVERY_RETRY_SCHEDULED: &str = "messaging.delivery.retry_scheduled";
    pub const DELIVERY_GAVE_UP: &str = "messaging.delivery.gave_up";
    pub const DELIVERY_SKIPPED_DUPLICATE: &str = "messaging.delivery.skipped_duplicate";

    pub const INSTANCE_STARTED: &str = "messaging.instance.started";
    pub const INSTANCE_CONNECTING: &str = "messaging.instance.connecting";
    pub const INSTANCE_CONNECTED: &str = "messaging.instance.connected";
    pub const INSTANCE_DISCONNECTED: &str = "messaging.instance.disconnected";
    pub const INSTANCE_STOPPED: &str = "messaging.instance.stopped";
    pub const INSTANCE_ERROR: &str = "messaging.instance.error";
    pub const HEALTH_PROBE: &str = "messaging.instance.health_probe";
    pub const RECONNECT_ATTEMPT: &str = "messaging.instance.reconnect_attempt";
    pub const RECONNECT_SCHEDULED: &str = "messaging.instance.reconnect_scheduled";
    pub const RECONNECT_FAILED: &str = "messaging.instance.reconnect_failed";
    pub const RECONNECT_EXHAUSTED: &str = "messaging.instance.reconnect_exhausted";

    pub const MANIFEST_LOAD: &str = "messaging.bridge_registry.manifest.load";
    pub const REGISTRY_BOOTSTRAP: &str = "messaging.bridge_registry.bootstrap";

    pub const SECURITY_DECISION: &str = "messaging.security.decision";
    pub const POLICY_DECISION: &str = "messaging.ingest.policy.decision";

    pub const DEAD_LETTER_CAPTURED: &str = "messaging.dead_letter.captured";
    pub const DEAD_LETTER_REPLAY_ATTEMPT: &str = "messaging.dead_letter.replay_attempt";
    pub const DEAD_LETTER_REPLAY_OUTCOME: &str = "messaging.dead_letter.replay_outcome";

    pub const GATEWAY_PRESSURE: &str = "messaging.outbound_gateway.pressure";

    pub const AGENT_TRIGGERED: &str = "messaging.agent.triggered";
    pub const AGENT_STARTED: &str = "messaging.agent.started";
    pub const AGENT_COMPLETED: &str = "messaging.agent.completed";
    pub const AGENT_FAILED: &str = "messaging.agent.failed";
}

/// Structured event published to signal subscribers, shaped like a
/// CloudEvent. The signal type is the telemetry name under the crate's
/// namespace; `source` identifies the emitting instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: String,
    /// `runtime/<instance_id>`
    pub source: String,
    /// Usually the room id the event concerns.
    pub subject: Option<String>,
    pub data: serde_json::Value,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub time: DateTime<Utc>,
}

impl Signal {
    pub fn new(event_name: &str, instance_id: &str, data: serde_json::Value) -> Self {
        Self {
            signal_type: format!("switchboard.{event_name}"),
            source: format!("runtime/{instance_id}"),
            subject: None,
            data,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            causation_id: None,
            time: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}
