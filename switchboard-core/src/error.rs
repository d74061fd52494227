// ABOUTME: The closed error set surfaced to runtime callers
// ABOUTME: Every raw failure is classified into one of these before propagation

use serde::{Deserialize, Serialize};

use crate::failure::CallbackFailure;

pub type Result<T> = std::result::Result<T, Error>;

/// Which stage of the policy pipeline produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStage {
    Gating,
    Moderation,
}

/// Media policy rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaViolation {
    UnsupportedKind,
    MissingPayload,
    InvalidMediaType,
    MaxItemBytesExceeded,
    MaxTotalBytesExceeded,
    MaxItemsExceeded,
    InvalidMediaPayload,
}

/// Per-bridge outcome inside a delivery summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub bridge_id: String,
    pub reason: String,
}

/// What `route_outbound` attempted and how it went.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub room_id: String,
    pub attempted: usize,
    /// Bridge ids that accepted the message.
    pub delivered: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

/// Closed set of errors callers can observe. Duplicates and idempotent
/// replays are success shapes elsewhere; they appear here only where a
/// caller explicitly asked for a non-duplicate outcome.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate")]
    Duplicate,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue full")]
    QueueFull,

    #[error("load shed")]
    LoadShed,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("missing external message id")]
    MissingExternalMessageId,

    #[error("policy denied at {stage:?}: {reason}")]
    PolicyDenied {
        stage: PolicyStage,
        reason: String,
        description: String,
    },

    #[error("security denied at {stage}: {reason}")]
    SecurityDenied {
        stage: String,
        reason: String,
        description: String,
    },

    #[error("media policy denied: {reason:?}")]
    MediaPolicyDenied {
        reason: MediaViolation,
        metadata: serde_json::Value,
    },

    #[error("delivery failed: {0:?}")]
    DeliveryFailed(DeliverySummary),

    #[error("no outbound routes")]
    NoRoutes,

    #[error("revision conflict: expected {expected}, actual {actual}")]
    RevisionConflict { expected: i64, actual: u64 },

    #[error("invalid routing policy: {0}")]
    InvalidPolicy(String),

    #[error(transparent)]
    Callback(#[from] CallbackFailure),

    #[error("storage: {0}")]
    Storage(String),
}

impl Error {
    pub fn storage(detail: impl Into<String>) -> Self {
        Self::Storage(detail.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::RevisionConflict { expected: 0, actual: 1 };
        assert_eq!(e.to_string(), "revision conflict: expected 0, actual 1");
    }

    #[test]
    fn test_policy_denied_carries_stage() {
        let e = Error::PolicyDenied {
            stage: PolicyStage::Gating,
            reason: "blocked_sender".into(),
            description: "sender is blocked".into(),
        };
        assert!(matches!(e, Error::PolicyDenied { stage: PolicyStage::Gating, .. }));
    }
}
