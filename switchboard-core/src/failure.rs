// ABOUTME: Deterministic failure taxonomy for adapter errors
// ABOUTME: Raw reasons classify to {recoverable, degraded, fatal} before propagation

use serde::{Deserialize, Serialize};

/// Raw failure reason produced by an adapter or a callback boundary.
/// The closed shape here is what `classify` maps; adapters wrap anything
/// else into `Exception` or `Other`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("timeout")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    Closed,
    #[error("dns resolution failed")]
    NxDomain,
    #[error("network error: {detail}")]
    NetworkError { detail: String },
    #[error("http status {status}")]
    Http { status: u16 },
    #[error("rate limited")]
    RateLimited,
    #[error("task exited")]
    TaskExit,
    #[error("exception: {detail}")]
    Exception { detail: String },

    #[error("unsupported")]
    Unsupported,
    #[error("unsupported method: {method}")]
    UnsupportedMethod { method: String },
    #[error("media policy denied")]
    MediaPolicyDenied,
    #[error("policy denied")]
    PolicyDenied,

    #[error("invalid return from adapter")]
    InvalidReturn,
    #[error("invalid request")]
    InvalidRequest,
    #[error("unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },

    #[error("{detail}")]
    Other { detail: String },
}

impl FailureReason {
    pub fn exception(detail: impl Into<String>) -> Self {
        Self::Exception { detail: detail.into() }
    }

    pub fn other(detail: impl Into<String>) -> Self {
        Self::Other { detail: detail.into() }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::NetworkError { detail: detail.into() }
    }

    /// Map a raw reason to its failure class.
    pub fn classify(&self) -> FailureClass {
        match self {
            FailureReason::Timeout
            | FailureReason::ConnectionRefused
            | FailureReason::Closed
            | FailureReason::NxDomain
            | FailureReason::NetworkError { .. }
            | FailureReason::RateLimited
            | FailureReason::TaskExit
            | FailureReason::Exception { .. } => FailureClass::Recoverable,
            FailureReason::Http { status } if *status >= 500 || *status == 429 => {
                FailureClass::Recoverable
            }

            FailureReason::Unsupported
            | FailureReason::UnsupportedMethod { .. }
            | FailureReason::MediaPolicyDenied
            | FailureReason::PolicyDenied => FailureClass::Degraded,

            _ => FailureClass::Fatal,
        }
    }
}

/// How badly an adapter call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Recoverable,
    Degraded,
    Fatal,
}

impl FailureClass {
    /// Action the owning component takes for this class.
    pub fn disposition(self) -> Disposition {
        match self {
            FailureClass::Recoverable => Disposition::Retry,
            FailureClass::Degraded => Disposition::Degrade,
            FailureClass::Fatal => Disposition::Crash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retry,
    Degrade,
    Crash,
}

/// Envelope wrapping a failed adapter callback invocation: which adapter,
/// which callback, and the pre-classified reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("callback {callback} on adapter {adapter} failed ({class:?}): {reason}")]
pub struct CallbackFailure {
    pub adapter: String,
    pub callback: &'static str,
    pub class: FailureClass,
    pub disposition: Disposition,
    pub reason: FailureReason,
}

impl CallbackFailure {
    pub fn new(adapter: impl Into<String>, callback: &'static str, reason: FailureReason) -> Self {
        let class = reason.classify();
        Self {
            adapter: adapter.into(),
            callback,
            class,
            disposition: class.disposition(),
            reason,
        }
    }
}
