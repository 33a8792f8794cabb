//! Wire format of the real-time channel
//!
//! Client frames carry a correlation `id`, an `action` name, an optional
//! client `tempId` and an action-specific `data` object. The server
//! answers mutating actions with an `ack` frame and pushes `event` frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{Attachment, MessageType};
use crate::error::{AppError, ErrorBody};

/// A client frame before the action is resolved
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    #[serde(default)]
    pub id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    pub conversation_id: String,
    pub content: String,
    #[serde(default, rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageData {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadData {
    pub conversation_id: String,
    #[serde(default)]
    pub message_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactData {
    pub message_id: String,
    pub emoji: String,
}

/// Actions a client can issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    SendMessage(SendMessageData),
    EditMessage(EditMessageData),
    DeleteMessage(MessageRef),
    MarkRead(MarkReadData),
    React(ReactData),
    TypingStart(ConversationRef),
    TypingStop(ConversationRef),
    ArchiveConversation(ConversationRef),
    RestoreConversation(ConversationRef),
    DeleteConversation(ConversationRef),
    Ping,
}

fn data<T: DeserializeOwned>(action: &str, data: Value) -> Result<T, AppError> {
    serde_json::from_value(data)
        .map_err(|e| AppError::Validation(format!("Invalid data for {action}: {e}")))
}

impl ClientAction {
    /// Resolve an action name and its payload
    ///
    /// # Errors
    /// `Validation` for unknown actions or payloads of the wrong shape
    pub fn parse(action: &str, payload: Value) -> Result<Self, AppError> {
        let parsed = match action {
            "conversation:join" => Self::JoinConversation(data(action, payload)?),
            "conversation:leave" => Self::LeaveConversation(data(action, payload)?),
            "message:send" => Self::SendMessage(data(action, payload)?),
            "message:edit" => Self::EditMessage(data(action, payload)?),
            "message:delete" => Self::DeleteMessage(data(action, payload)?),
            "message:read" => Self::MarkRead(data(action, payload)?),
            "message:react" => Self::React(data(action, payload)?),
            "typing:start" => Self::TypingStart(data(action, payload)?),
            "typing:stop" => Self::TypingStop(data(action, payload)?),
            "conversation:archive" => Self::ArchiveConversation(data(action, payload)?),
            "conversation:restore" => Self::RestoreConversation(data(action, payload)?),
            "conversation:delete" => Self::DeleteConversation(data(action, payload)?),
            "ping" => Self::Ping,
            other => {
                return Err(AppError::Validation(format!("Unknown action: {other}")));
            }
        };
        Ok(parsed)
    }

    /// Action name, also used as the metrics label
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinConversation(_) => "conversation:join",
            Self::LeaveConversation(_) => "conversation:leave",
            Self::SendMessage(_) => "message:send",
            Self::EditMessage(_) => "message:edit",
            Self::DeleteMessage(_) => "message:delete",
            Self::MarkRead(_) => "message:read",
            Self::React(_) => "message:react",
            Self::TypingStart(_) => "typing:start",
            Self::TypingStop(_) => "typing:stop",
            Self::ArchiveConversation(_) => "conversation:archive",
            Self::RestoreConversation(_) => "conversation:restore",
            Self::DeleteConversation(_) => "conversation:delete",
            Self::Ping => "ping",
        }
    }

    /// Typing notifications are fire-and-forget and get no ack
    pub fn wants_ack(&self) -> bool {
        !matches!(self, Self::TypingStart(_) | Self::TypingStop(_))
    }
}

/// A fully parsed client frame
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub id: Option<String>,
    pub temp_id: Option<String>,
    pub action: ClientAction,
}

/// Why a frame could not be parsed, with whatever correlation data survived
#[derive(Debug)]
pub struct FrameError {
    pub id: Option<String>,
    pub temp_id: Option<String>,
    pub error: AppError,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| {
            // Salvage the correlation id from otherwise unusable frames
            let value = serde_json::from_str::<Value>(text).ok();
            let field = |name: &str| {
                value
                    .as_ref()
                    .and_then(|v| v.get(name))
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            };
            FrameError {
                id: field("id"),
                temp_id: field("tempId"),
                error: AppError::Validation(format!("Malformed frame: {e}")),
            }
        })?;

        let action = ClientAction::parse(&raw.action, raw.data).map_err(|error| FrameError {
            id: raw.id.clone(),
            temp_id: raw.temp_id.clone(),
            error,
        })?;

        Ok(Self {
            id: raw.id,
            temp_id: raw.temp_id,
            action,
        })
    }
}

/// Server-pushed event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message:new")]
    MessageNew,
    #[serde(rename = "message:edited")]
    MessageEdited,
    #[serde(rename = "message:deleted")]
    MessageDeleted,
    #[serde(rename = "message:reaction")]
    MessageReaction,
    #[serde(rename = "message:read")]
    MessageRead,
    #[serde(rename = "typing:start")]
    TypingStart,
    #[serde(rename = "typing:stop")]
    TypingStop,
    #[serde(rename = "conversation:unread")]
    ConversationUnread,
    #[serde(rename = "conversation:read")]
    ConversationRead,
    #[serde(rename = "conversation:reactivated")]
    ConversationReactivated,
    #[serde(rename = "conversation:archived")]
    ConversationArchived,
    #[serde(rename = "conversation:restored")]
    ConversationRestored,
    #[serde(rename = "conversation:deleted")]
    ConversationDeleted,
    #[serde(rename = "conversation:created")]
    ConversationCreated,
}

/// Frames sent to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Ack {
        id: Option<String>,
        #[serde(rename = "tempId")]
        temp_id: Option<String>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event {
        event: EventKind,
        #[serde(rename = "tempId")]
        temp_id: Option<String>,
        data: Value,
    },
}

impl ServerFrame {
    pub fn ack_ok(id: Option<String>, temp_id: Option<String>, data: Value) -> Self {
        Self::Ack {
            id,
            temp_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ack_err(id: Option<String>, temp_id: Option<String>, error: &AppError) -> Self {
        Self::Ack {
            id,
            temp_id,
            success: false,
            data: None,
            error: Some(error.to_body()),
        }
    }

    pub fn event(event: EventKind, temp_id: Option<String>, data: Value) -> Self {
        Self::Event {
            event,
            temp_id,
            data,
        }
    }

    /// Serialize for the wire
    pub fn to_text(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(e.into()))
    }
}
