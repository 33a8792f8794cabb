//! Data models
//!
//! Rust structs representing stored records.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content substituted for a deleted message
pub const TOMBSTONE_CONTENT: &str = "This message was deleted";

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// User (identity directory, read-only here)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub role: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Conversation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConversationType {
    Private,
    Group,
}

/// Per-participant state of a conversation
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    pub position: i64,
    /// Time of the participant's last read
    pub last_seen: DateTime<Utc>,
    pub unread_count: i64,
}

/// A thread between two (or more) users
///
/// `participants` is loaded separately and ordered by position.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub conversation_type: ConversationType,
    pub pair_key: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_at: DateTime<Utc>,
    /// false = archived
    pub is_active: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub participants: Vec<Participant>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.user_id.clone()).collect()
    }
}

/// Key identifying the live private conversation of a user pair,
/// independent of who initiated it.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AttachmentType {
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub attachment_type: AttachmentType,
    pub url: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(rename = "user")]
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    #[serde(rename = "user")]
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// A message in a conversation
///
/// Attachments, edit history, read receipts and reactions live in
/// side tables and are filled in by the database layer.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<String>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub attachments: Vec<Attachment>,
    #[sqlx(skip)]
    pub edit_history: Vec<EditRecord>,
    #[sqlx(skip)]
    pub read_by: Vec<ReadReceipt>,
    #[sqlx(skip)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Build a new, not yet persisted message
    pub fn new(
        conversation_id: &str,
        sender_id: &str,
        content: String,
        message_type: MessageType,
        attachments: Vec<Attachment>,
        reply_to_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content,
            message_type,
            reply_to_id,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            created_at: now,
            updated_at: now,
            attachments,
            edit_history: Vec::new(),
            read_by: Vec::new(),
            reactions: Vec::new(),
        }
    }

    /// Whether the message is still inside its edit window at `now`
    pub fn can_edit_at(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.created_at < window
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }
}

/// What a reaction request did to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionChange {
    Added,
    Removed,
    Replaced,
}

/// New unread counter of a participant after a store mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub user_id: String,
    pub unread_count: i64,
}

/// Result of appending a message to a conversation
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The conversation was archived and has been reactivated
    pub reactivated: bool,
    /// Counters of every participant other than the sender
    pub unread: Vec<UnreadCount>,
    pub participant_ids: Vec<String>,
}

/// Result of soft-deleting a message
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    /// Counters corrected because the message was still unseen
    pub unread: Vec<UnreadCount>,
    /// The conversation's last message pointer moved
    pub last_message_repaired: bool,
}
