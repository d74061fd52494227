// ABOUTME: Thin boundary over the adapter contract
// ABOUTME: Normalizes capabilities, bounds callback time, classifies every failure

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use switchboard_core::adapter::{
    Capability, CapabilitySet, ChannelAdapter, Incoming, OutboundMedia, SanitizeOutcome,
    SendOpts, SendReceipt, VerifyOutcome,
};
use switchboard_core::failure::{CallbackFailure, FailureReason};

/// A named, configured adapter binding. All runtime access to an adapter
/// goes through here so that failures are classified exactly once, at the
/// boundary where they are produced.
#[derive(Clone)]
pub struct AdapterBridge {
    bridge_id: String,
    adapter: Arc<dyn ChannelAdapter>,
    capabilities: CapabilitySet,
}

impl AdapterBridge {
    pub fn new(bridge_id: impl Into<String>, adapter: Arc<dyn ChannelAdapter>) -> Self {
        let capabilities = CapabilitySet::normalize(adapter.capabilities());
        Self { bridge_id: bridge_id.into(), adapter, capabilities }
    }

    /// Override the advertised capability set (manifest-declared
    /// capabilities win over the adapter's own list).
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = CapabilitySet::normalize(capabilities);
        self
    }

    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    pub fn channel_type(&self) -> &str {
        self.adapter.channel_type()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.supports(capability)
    }

    pub fn adapter(&self) -> &Arc<dyn ChannelAdapter> {
        &self.adapter
    }

    fn callback_failure(&self, callback: &'static str, reason: FailureReason) -> CallbackFailure {
        CallbackFailure::new(self.adapter.channel_type(), callback, reason)
    }

    /// Normalize a raw platform payload. A malformed result is a
    /// `callback_failure` with an `invalid_return` reason.
    pub fn transform_incoming(
        &self,
        raw: serde_json::Value,
    ) -> Result<Incoming, CallbackFailure> {
        match self.adapter.transform_incoming(raw) {
            Ok(incoming) if incoming.external_room_id.is_empty() => {
                Err(self.callback_failure("transform_incoming", FailureReason::InvalidReturn))
            }
            Ok(incoming) => Ok(incoming),
            Err(reason) => Err(self.callback_failure("transform_incoming", reason)),
        }
    }

    /// Verify the sender within `timeout`. Deadline overruns surface as a
    /// recoverable `timeout` failure for the caller's fallback policy.
    pub async fn verify_sender(
        &self,
        incoming: &Incoming,
        timeout: Duration,
    ) -> Result<VerifyOutcome, CallbackFailure> {
        match tokio::time::timeout(timeout, self.adapter.verify_sender(incoming)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(reason)) => Err(self.callback_failure("verify_sender", reason)),
            Err(_) => Err(self.callback_failure("verify_sender", FailureReason::Timeout)),
        }
    }

    /// Sanitize outbound text within `timeout`, when the adapter supports
    /// sanitization; identity otherwise.
    pub async fn sanitize_outbound(
        &self,
        text: &str,
        timeout: Duration,
    ) -> Result<SanitizeOutcome, CallbackFailure> {
        if !self.supports(Capability::OutboundSanitization) {
            return Ok(SanitizeOutcome::Ok(text.to_string()));
        }
        match tokio::time::timeout(timeout, self.adapter.sanitize_outbound(text)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(reason)) => Err(self.callback_failure("sanitize_outbound", reason)),
            Err(_) => Err(self.callback_failure("sanitize_outbound", FailureReason::Timeout)),
        }
    }

    pub async fn send_message(
        &self,
        external_room_id: &str,
        text: &str,
        opts: &SendOpts,
    ) -> Result<SendReceipt, FailureReason> {
        self.adapter.send_message(external_room_id, text, opts).await
    }

    pub async fn edit_message(
        &self,
        external_room_id: &str,
        external_message_id: &str,
        text: &str,
        opts: &SendOpts,
    ) -> Result<SendReceipt, FailureReason> {
        self.adapter
            .edit_message(external_room_id, external_message_id, text, opts)
            .await
    }

    pub async fn send_media(
        &self,
        external_room_id: &str,
        media: &[OutboundMedia],
        opts: &SendOpts,
    ) -> Result<SendReceipt, FailureReason> {
        self.adapter.send_media(external_room_id, media, opts).await
    }

    pub async fn edit_media(
        &self,
        external_room_id: &str,
        external_message_id: &str,
        media: &[OutboundMedia],
        opts: &SendOpts,
    ) -> Result<SendReceipt, FailureReason> {
        self.adapter
            .edit_media(external_room_id, external_message_id, media, opts)
            .await
    }

    pub fn extract_routing_metadata(&self, incoming: &Incoming) -> serde_json::Value {
        if self.supports(Capability::RoutingMetadata) {
            self.adapter.extract_routing_metadata(incoming)
        } else {
            serde_json::Value::Null
        }
    }

    pub fn extract_command_hint(&self, text: &str) -> Option<String> {
        if self.supports(Capability::CommandHints) {
            self.adapter.extract_command_hint(text)
        } else {
            None
        }
    }

    /// Advertised outbound length limit, when the platform has one.
    pub fn max_message_length(&self) -> Option<usize> {
        self.adapter.max_message_length()
    }

    pub async fn check_health(&self, timeout: Duration) -> Result<(), CallbackFailure> {
        match tokio::time::timeout(timeout, self.adapter.check_health()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(self.callback_failure("check_health", reason)),
            Err(_) => Err(self.callback_failure("check_health", FailureReason::Timeout)),
        }
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        self.adapter.probe_interval()
    }
}

impl std::fmt::Debug for AdapterBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterBridge")
            .field("bridge_id", &self.bridge_id)
            .field("channel_type", &self.adapter.channel_type())
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}
