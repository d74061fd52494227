// ABOUTME: Partitioned outbound delivery gateway: every adapter call goes through here
// ABOUTME: Bounded queues, pressure, retries, idempotency, dead-letter capture

pub mod idempotency;
pub mod partition;
pub mod pressure;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use switchboard_core::adapter::{OutboundMedia, SendOpts};
use switchboard_core::config::OutboundConfig;
use switchboard_core::delivery::{ErrorCategory, Operation, Priority, Route, SessionKey};
use switchboard_core::failure::{FailureClass, FailureReason};

use crate::bridge::AdapterBridge;
use crate::dead_letter::DeadLetterStore;
use crate::session_route::SessionRouteStore;
use crate::telemetry::Telemetry;

pub use pressure::PressureLevel;

/// Where the gateway looks up bridges at dispatch time.
pub trait BridgeSource: Send + Sync {
    fn bridge(&self, bridge_id: &str) -> Option<AdapterBridge>;
}

/// Payload of one outbound operation. Which fields matter depends on the
/// operation; edits without an external message id fail terminally.
#[derive(Debug, Clone, Default)]
pub struct DeliveryPayload {
    pub text: Option<String>,
    pub media: Vec<OutboundMedia>,
    pub external_message_id: Option<String>,
    pub opts: SendOpts,
}

impl DeliveryPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }
}

/// One outbound adapter call routed through the gateway.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub message_id: String,
    /// Caller-supplied at-most-once handle (internal message id by
    /// convention, `:edit`-suffixed for edits).
    pub idempotency_key: String,
    pub route: Route,
    pub operation: Operation,
    pub payload: DeliveryPayload,
    pub priority: Priority,
    pub session_key: Option<SessionKey>,
    pub fallback_routes: Vec<Route>,
    pub metadata: serde_json::Value,
}

impl DeliveryRequest {
    pub fn send_text(
        message_id: impl Into<String>,
        route: Route,
        text: impl Into<String>,
    ) -> Self {
        let message_id = message_id.into();
        Self {
            idempotency_key: message_id.clone(),
            message_id,
            route,
            operation: Operation::Send,
            payload: DeliveryPayload::text(text),
            priority: Priority::Normal,
            session_key: None,
            fallback_routes: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn routing_key(&self) -> String {
        self.route.routing_key()
    }
}

/// Raw failure reasons inside the gateway, before categorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundReason {
    QueueFull,
    LoadShed,
    SendFailed(String),
    MissingExternalMessageId,
    InvalidRequest(String),
    SanitizeDenied { reason: String, retryable: bool },
    PartitionUnavailable,
    UnsupportedOperation(String),
    Adapter(FailureReason),
}

impl OutboundReason {
    /// The three-way error taxonomy. Adapter reasons delegate to the
    /// bridge failure classes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OutboundReason::QueueFull
            | OutboundReason::LoadShed
            | OutboundReason::SendFailed(_)
            | OutboundReason::MissingExternalMessageId
            | OutboundReason::InvalidRequest(_) => ErrorCategory::Terminal,
            OutboundReason::SanitizeDenied { retryable, .. } => {
                if *retryable {
                    ErrorCategory::Retryable
                } else {
                    ErrorCategory::Terminal
                }
            }
            OutboundReason::PartitionUnavailable | OutboundReason::UnsupportedOperation(_) => {
                ErrorCategory::Fatal
            }
            OutboundReason::Adapter(reason) => match reason.classify() {
                FailureClass::Recoverable => ErrorCategory::Retryable,
                FailureClass::Degraded => ErrorCategory::Terminal,
                FailureClass::Fatal => ErrorCategory::Fatal,
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            OutboundReason::QueueFull => "queue_full".into(),
            OutboundReason::LoadShed => "load_shed".into(),
            OutboundReason::SendFailed(detail) => format!("send_failed: {detail}"),
            OutboundReason::MissingExternalMessageId => "missing_external_message_id".into(),
            OutboundReason::InvalidRequest(detail) => format!("invalid_request: {detail}"),
            OutboundReason::SanitizeDenied { reason, .. } => {
                format!("sanitize_denied: {reason}")
            }
            OutboundReason::PartitionUnavailable => "partition_unavailable".into(),
            OutboundReason::UnsupportedOperation(op) => {
                format!("unsupported_operation: {op}")
            }
            OutboundReason::Adapter(reason) => reason.to_string(),
        }
    }
}

/// What the gateway ultimately did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// Retryable category, budget exhausted; replay may still succeed.
    Retry,
    /// Not worth repeating as-is.
    Terminal,
}

/// How the session store resolved the target route, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResolutionInfo {
    pub source: &'static str,
    pub fallback: bool,
    pub stale: bool,
    pub fallback_reason: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct SuccessResponse {
    pub operation: Operation,
    /// Platform-assigned message id.
    pub message_id: String,
    pub partition: usize,
    pub attempts: u32,
    pub routing_key: String,
    pub pressure_level: PressureLevel,
    pub idempotent: bool,
    pub route_resolution: Option<RouteResolutionInfo>,
    pub security: Option<serde_json::Value>,
    pub media: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub category: ErrorCategory,
    pub disposition: FailureDisposition,
    pub reason: OutboundReason,
    pub attempt: u32,
    pub max_attempts: u32,
    pub partition: usize,
    pub routing_key: String,
    pub retryable: bool,
}

pub type DeliveryResult = std::result::Result<SuccessResponse, ErrorResponse>;

/// Partitioned, bounded, back-pressured, retrying, idempotent outbound
/// pipeline. A routing key is pinned to one partition; FIFO holds within a
/// partition and nothing is guaranteed across partitions.
pub struct OutboundGateway {
    partitions: Vec<partition::PartitionHandle>,
    partition_count: usize,
}

impl OutboundGateway {
    pub fn new(
        config: OutboundConfig,
        bridges: Arc<dyn BridgeSource>,
        sessions: Arc<SessionRouteStore>,
        dead_letters: Arc<DeadLetterStore>,
        telemetry: Telemetry,
    ) -> Arc<Self> {
        let partition_count = config.effective_partitions();
        let partitions = (0..partition_count)
            .map(|index| {
                partition::PartitionHandle::start(
                    index,
                    config.clone(),
                    Arc::clone(&bridges),
                    Arc::clone(&sessions),
                    Arc::clone(&dead_letters),
                    telemetry.clone(),
                )
            })
            .collect();
        Arc::new(Self { partitions, partition_count })
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Stable partition index for a routing key.
    pub fn partition_index(&self, routing_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partition_count
    }

    /// Enqueue a delivery and wait for its final outcome (through every
    /// retry). Shed, duplicate and queue-full outcomes return immediately.
    pub async fn enqueue(&self, request: DeliveryRequest) -> DeliveryResult {
        let index = self.partition_index(&request.routing_key());
        self.partitions[index].enqueue(request).await
    }

    /// Current pressure level of the partition owning a routing key.
    pub fn pressure_for(&self, routing_key: &str) -> PressureLevel {
        let index = self.partition_index(routing_key);
        self.partitions[index].pressure_level()
    }

    /// Queued + in-flight jobs across all partitions.
    pub fn total_depth(&self) -> usize {
        self.partitions.iter().map(|p| p.depth()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_categories_match_taxonomy() {
        assert_eq!(OutboundReason::QueueFull.category(), ErrorCategory::Terminal);
        assert_eq!(OutboundReason::LoadShed.category(), ErrorCategory::Terminal);
        assert_eq!(
            OutboundReason::SendFailed("x".into()).category(),
            ErrorCategory::Terminal
        );
        assert_eq!(
            OutboundReason::MissingExternalMessageId.category(),
            ErrorCategory::Terminal
        );
        assert_eq!(
            OutboundReason::SanitizeDenied { reason: "pii".into(), retryable: false }.category(),
            ErrorCategory::Terminal
        );
        assert_eq!(
            OutboundReason::SanitizeDenied { reason: "transient".into(), retryable: true }
                .category(),
            ErrorCategory::Retryable
        );
        assert_eq!(
            OutboundReason::PartitionUnavailable.category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            OutboundReason::UnsupportedOperation("x".into()).category(),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn test_adapter_reasons_delegate_to_failure_class() {
        assert_eq!(
            OutboundReason::Adapter(FailureReason::Timeout).category(),
            ErrorCategory::Retryable
        );
        assert_eq!(
            OutboundReason::Adapter(FailureReason::Unsupported).category(),
            ErrorCategory::Terminal
        );
        assert_eq!(
            OutboundReason::Adapter(FailureReason::InvalidReturn).category(),
            ErrorCategory::Fatal
        );
    }
}
