// ABOUTME: Participant value type: humans, agents and system identities
// ABOUTME: Carries per-channel external ids and a presence state

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    Human,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Away,
    Busy,
    Offline,
}

/// A member of one or more rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub participant_type: ParticipantType,
    /// Display identity (username or agent name).
    pub identity: String,
    /// channel type -> external user id on that platform
    pub external_ids: BTreeMap<String, String>,
    pub presence: Presence,
    /// Free-form capability tags (e.g. "can_upload").
    pub capabilities: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(participant_type: ParticipantType, identity: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participant_type,
            identity: identity.into(),
            external_ids: BTreeMap::new(),
            presence: Presence::Offline,
            capabilities: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn human(identity: impl Into<String>) -> Self {
        Self::new(ParticipantType::Human, identity)
    }

    pub fn agent(identity: impl Into<String>) -> Self {
        Self::new(ParticipantType::Agent, identity)
    }

    pub fn with_external_id(
        mut self,
        channel: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        self.external_ids.insert(channel.into(), external_id.into());
        self
    }

    pub fn external_id_for(&self, channel: &str) -> Option<&str> {
        self.external_ids.get(channel).map(String::as_str)
    }
}
