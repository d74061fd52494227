// ABOUTME: Message value type with ordered content blocks, receipts and reactions
// ABOUTME: Status advances monotonically: sending -> sent -> delivered -> read

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Delivery status of a message. Ordered: once a message reaches `Sent`
/// (or `Failed`), lower-ranked statuses do not reappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Rank for monotonic advancement. `Failed` is terminal and ranks
    /// alongside `Read` so nothing overwrites it.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 3,
        }
    }

    /// Advance to `next` only if it outranks the current status.
    pub fn advance(self, next: MessageStatus) -> MessageStatus {
        if self == MessageStatus::Failed {
            return self;
        }
        if next.rank() > self.rank() {
            next
        } else {
            self
        }
    }
}

/// Media category for content blocks and incoming attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    File,
}

impl MediaKind {
    /// Media-type prefix this kind requires (`image/`, `audio/`, `video/`).
    /// `File` accepts any media type.
    pub fn media_type_prefix(self) -> Option<&'static str> {
        match self {
            MediaKind::Image => Some("image/"),
            MediaKind::Audio => Some("audio/"),
            MediaKind::Video => Some("video/"),
            MediaKind::File => None,
        }
    }
}

/// One ordered unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: Vec<u8>,
        filename: Option<String>,
        caption: Option<String>,
    },
    Audio {
        media_type: String,
        data: Vec<u8>,
        filename: Option<String>,
        caption: Option<String>,
    },
    Video {
        media_type: String,
        data: Vec<u8>,
        filename: Option<String>,
        caption: Option<String>,
    },
    File {
        media_type: String,
        data: Vec<u8>,
        filename: Option<String>,
        caption: Option<String>,
    },
    ToolUse {
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_name: String,
        output: serde_json::Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a media block of the given kind.
    pub fn media(
        kind: MediaKind,
        media_type: impl Into<String>,
        data: Vec<u8>,
        filename: Option<String>,
        caption: Option<String>,
    ) -> Self {
        let media_type = media_type.into();
        match kind {
            MediaKind::Image => Self::Image { media_type, data, filename, caption },
            MediaKind::Audio => Self::Audio { media_type, data, filename, caption },
            MediaKind::Video => Self::Video { media_type, data, filename, caption },
            MediaKind::File => Self::File { media_type, data, filename, caption },
        }
    }

    /// Text payload if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Per-participant delivery/read receipt. `read_at` implies `delivered_at`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Receipt {
    /// Mark delivered, keeping an existing timestamp.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }
        self.delivered_at = Some(at);
        true
    }

    /// Mark read; also fills in `delivered_at` since read implies delivered.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        true
    }
}

/// A message inside a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub reply_to_id: Option<String>,
    pub thread_root_id: Option<String>,
    /// Platform-assigned message id, when known.
    pub external_id: Option<String>,
    pub status: MessageStatus,
    /// reaction string -> set of participant ids
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    /// participant id -> receipt
    pub receipts: BTreeMap<String, Receipt>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(room_id: impl Into<String>, sender_id: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            role,
            content: Vec::new(),
            reply_to_id: None,
            thread_root_id: None,
            external_id: None,
            status: MessageStatus::Sending,
            reactions: BTreeMap::new(),
            receipts: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(ContentBlock::text(text));
        self
    }

    /// All text blocks concatenated, space-separated. Used for trigger
    /// matching and mention detection.
    pub fn concatenated_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Advance status monotonically; returns true when it changed.
    pub fn advance_status(&mut self, next: MessageStatus) -> bool {
        let advanced = self.status.advance(next);
        if advanced != self.status {
            self.status = advanced;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }
}
