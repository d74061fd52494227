// ABOUTME: Shared outbound delivery shapes: session keys, routes, priorities
// ABOUTME: Used by the session store, outbound gateway, router and dead letters

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scopes "which conversation" for outbound route resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub channel_type: String,
    pub bridge_id: String,
    pub room_scope: String,
    pub thread_id: Option<String>,
}

impl SessionKey {
    pub fn new(
        channel_type: impl Into<String>,
        bridge_id: impl Into<String>,
        room_scope: impl Into<String>,
    ) -> Self {
        Self {
            channel_type: channel_type.into(),
            bridge_id: bridge_id.into(),
            room_scope: room_scope.into(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel_type, self.bridge_id, self.room_scope)?;
        if let Some(thread) = &self.thread_id {
            write!(f, ":{thread}")?;
        }
        Ok(())
    }
}

/// A resolved outbound target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub bridge_id: String,
    pub external_room_id: String,
    pub external_thread_id: Option<String>,
}

impl Route {
    pub fn new(bridge_id: impl Into<String>, external_room_id: impl Into<String>) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            external_room_id: external_room_id.into(),
            external_thread_id: None,
        }
    }

    /// Basis of outbound partitioning.
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.bridge_id, self.external_room_id)
    }
}

/// Scheduling priority of a delivery job. Low-priority jobs are the first
/// dropped under shed pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The adapter operation a delivery job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Send,
    Edit,
    SendMedia,
    EditMedia,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Send => "send",
            Operation::Edit => "edit",
            Operation::SendMedia => "send_media",
            Operation::EditMedia => "edit_media",
        }
    }
}

/// Outbound error category. Only `Retryable` re-enters the partition
/// schedule; `Terminal` dead-letters; `Fatal` signals a broken invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Retryable,
    Terminal,
    Fatal,
}
