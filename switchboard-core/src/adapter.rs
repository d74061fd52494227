// ABOUTME: The adapter contract every platform integration implements
// ABOUTME: Required callbacks plus optional ones with deterministic defaults

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureReason;
use crate::model::MediaKind;

/// Result type for adapter calls. Reasons are classified by the bridge
/// before they propagate anywhere else.
pub type AdapterResult<T> = std::result::Result<T, FailureReason>;

/// Closed vocabulary of adapter features. `Text` is always present after
/// normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Image,
    Audio,
    Video,
    File,
    ToolUse,
    Streaming,
    Reactions,
    Threads,
    Typing,
    Presence,
    ReadReceipts,
    ListenerLifecycle,
    RoutingMetadata,
    SenderVerification,
    OutboundSanitization,
    MediaSend,
    MediaEdit,
    CommandHints,
    MessageEdit,
}

impl Capability {
    /// Parse a manifest capability string. Unknown strings are rejected so
    /// manifests cannot widen the vocabulary.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// Normalized capability set. Always contains `Text`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn normalize(raw: impl IntoIterator<Item = Capability>) -> Self {
        let mut set: BTreeSet<Capability> = raw.into_iter().collect();
        set.insert(Capability::Text);
        Self(set)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Chat context of an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
    Thread,
    Unknown,
}

impl Default for ChatType {
    fn default() -> Self {
        ChatType::Unknown
    }
}

/// A media item attached to an incoming message, before policy
/// normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMedia {
    pub kind: MediaKind,
    pub media_type: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub filename: Option<String>,
    pub caption: Option<String>,
}

/// Normalized incoming message shape produced by `transform_incoming`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Incoming {
    pub external_room_id: String,
    pub external_user_id: String,
    pub text: Option<String>,
    pub external_message_id: Option<String>,
    pub external_reply_to_id: Option<String>,
    pub external_thread_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chat_type: ChatType,
    pub chat_title: Option<String>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub was_mentioned: bool,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub media: Vec<IncomingMedia>,
    #[serde(default)]
    pub channel_meta: serde_json::Value,
    /// Original platform payload, untouched.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Options passed through to outbound adapter calls.
#[derive(Debug, Clone, Default)]
pub struct SendOpts {
    /// Platform thread to post into, when threads are supported.
    pub external_thread_id: Option<String>,
    /// External message id this send replies to.
    pub external_reply_to_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// What the platform reported back for a successful send/edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Platform-assigned message id.
    pub message_id: String,
    pub extra: Option<serde_json::Value>,
}

impl SendReceipt {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self { message_id: message_id.into(), extra: None }
    }
}

/// Media payload for outbound send_media/edit_media.
#[derive(Debug, Clone)]
pub struct OutboundMedia {
    pub kind: MediaKind,
    pub media_type: String,
    pub data: Vec<u8>,
    pub filename: Option<String>,
    pub caption: Option<String>,
}

/// Outcome of `verify_sender`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Allow,
    Deny { reason: String, description: String },
}

/// Outcome of `sanitize_outbound`. A denial may be flagged retryable when
/// the adapter's security layer wants the gateway to try again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeOutcome {
    Ok(String),
    Deny { reason: String, retryable: bool },
}

/// A runnable the supervisor materializes for an adapter's listener tree.
pub struct ListenerSpec {
    pub id: String,
    pub run: Box<dyn FnOnce() -> tokio::task::JoinHandle<()> + Send>,
}

impl std::fmt::Debug for ListenerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSpec").field("id", &self.id).finish()
    }
}

/// Contract between the runtime and a platform integration.
///
/// `channel_type`, `transform_incoming` and `send_message` are required.
/// Everything else has a deterministic default so callers never need
/// feature detection; feature gating happens through `capabilities()`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Canonical platform tag (e.g. "telegram").
    fn channel_type(&self) -> &str;

    /// Raw capability list, normalized by the bridge into a
    /// `CapabilitySet`.
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Text]
    }

    /// Normalize a raw platform payload into the `Incoming` shape.
    fn transform_incoming(&self, raw: serde_json::Value) -> AdapterResult<Incoming>;

    /// Send a text message to an external room.
    async fn send_message(
        &self,
        external_room_id: &str,
        text: &str,
        opts: &SendOpts,
    ) -> AdapterResult<SendReceipt>;

    /// Edit a previously sent message.
    async fn edit_message(
        &self,
        _external_room_id: &str,
        _external_message_id: &str,
        _text: &str,
        _opts: &SendOpts,
    ) -> AdapterResult<SendReceipt> {
        Err(FailureReason::UnsupportedMethod { method: "edit_message".into() })
    }

    /// Send media to an external room.
    async fn send_media(
        &self,
        _external_room_id: &str,
        _media: &[OutboundMedia],
        _opts: &SendOpts,
    ) -> AdapterResult<SendReceipt> {
        Err(FailureReason::UnsupportedMethod { method: "send_media".into() })
    }

    /// Replace media on a previously sent message.
    async fn edit_media(
        &self,
        _external_room_id: &str,
        _external_message_id: &str,
        _media: &[OutboundMedia],
        _opts: &SendOpts,
    ) -> AdapterResult<SendReceipt> {
        Err(FailureReason::UnsupportedMethod { method: "edit_media".into() })
    }

    /// Long-running listener tasks the supervisor should own.
    fn listener_child_specs(&self, _instance_id: &str) -> Vec<ListenerSpec> {
        Vec::new()
    }

    /// Verify the sender of an incoming message.
    async fn verify_sender(&self, _incoming: &Incoming) -> AdapterResult<VerifyOutcome> {
        Ok(VerifyOutcome::Allow)
    }

    /// Sanitize outbound text before it reaches the platform.
    async fn sanitize_outbound(&self, text: &str) -> AdapterResult<SanitizeOutcome> {
        Ok(SanitizeOutcome::Ok(text.to_string()))
    }

    /// Platform-specific routing hints for an incoming message.
    fn extract_routing_metadata(&self, _incoming: &Incoming) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Platform-native command detected in the text, if any.
    fn extract_command_hint(&self, _text: &str) -> Option<String> {
        None
    }

    /// Longest outbound text payload the platform accepts, in bytes.
    /// `None` means unlimited; a limit makes the router chunk long sends.
    fn max_message_length(&self) -> Option<usize> {
        None
    }

    /// Heartbeat used by the lifecycle prober.
    async fn check_health(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Adapter-preferred probe cadence; `None` uses the configured default.
    fn probe_interval(&self) -> Option<Duration> {
        None
    }
}
