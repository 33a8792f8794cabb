//! Client-facing projections
//!
//! Stored records reference users and other messages by id. Projection
//! collects those ids, batch-fetches them once and assembles the views
//! sent over HTTP and the real-time channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::data::{
    Attachment, Conversation, ConversationType, Database, EditRecord, Message, MessageType,
    Reaction, ReadReceipt, User,
};
use crate::error::AppError;
use crate::presence::PresenceTracker;

/// Public user fields with the online flag taken from presence
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserSummary {
    /// Stand-in for a user missing from the directory
    fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            username: "unknown".to_string(),
            avatar: None,
            is_online: false,
            last_seen: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user: UserSummary,
    pub last_seen: DateTime<Utc>,
    pub unread_count: i64,
}

/// Short form of a message, used for `lastMessage` and `replyTo`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub sender: UserSummary,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub participants: Vec<ParticipantView>,
    pub last_message: Option<MessageSummary>,
    pub last_message_at: DateTime<Utc>,
    pub is_active: bool,
    /// Unread count of the viewer
    pub unread_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender: UserSummary,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<MessageSummary>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub edit_history: Vec<EditRecord>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub read_by: Vec<ReadReceipt>,
    pub reactions: Vec<Reaction>,
    /// Read by the viewer (own messages count as read)
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Assembles views from stored records
pub struct Projector {
    db: Arc<Database>,
    presence: Arc<PresenceTracker>,
}

impl Projector {
    pub fn new(db: Arc<Database>, presence: Arc<PresenceTracker>) -> Self {
        Self { db, presence }
    }

    /// Batch-fetch users and overlay presence
    pub async fn users(&self, ids: &[String]) -> Result<HashMap<String, UserSummary>, AppError> {
        let users = self.db.get_users_by_ids(ids).await?;
        let online = self.presence.online_among(ids).await;

        let mut summaries = HashMap::with_capacity(users.len());
        for user in users {
            let is_online = online.get(&user.id).copied().unwrap_or(false);
            let last_seen = match self.presence.last_seen(&user.id).await {
                Some(seen) => Some(seen),
                None => user.last_seen,
            };
            summaries.insert(user.id.clone(), summarize(user, is_online, last_seen));
        }
        Ok(summaries)
    }

    pub async fn conversations(
        &self,
        conversations: Vec<Conversation>,
        viewer_id: &str,
    ) -> Result<Vec<ConversationView>, AppError> {
        let last_message_ids: Vec<String> = conversations
            .iter()
            .filter_map(|c| c.last_message_id.clone())
            .collect();
        let last_messages: HashMap<String, Message> = self
            .db
            .get_messages_by_ids(&last_message_ids)
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut user_ids: HashSet<String> = HashSet::new();
        for conversation in &conversations {
            user_ids.extend(conversation.participant_ids());
        }
        user_ids.extend(last_messages.values().map(|m| m.sender_id.clone()));
        let user_ids: Vec<String> = user_ids.into_iter().collect();
        let users = self.users(&user_ids).await?;

        let views = conversations
            .into_iter()
            .map(|conversation| {
                let unread_count = conversation
                    .participant(viewer_id)
                    .map_or(0, |p| p.unread_count);
                let last_message = conversation
                    .last_message_id
                    .as_ref()
                    .and_then(|id| last_messages.get(id))
                    .map(|m| message_summary(m, &users));
                ConversationView {
                    participants: conversation
                        .participants
                        .iter()
                        .map(|p| ParticipantView {
                            user: lookup(&users, &p.user_id),
                            last_seen: p.last_seen,
                            unread_count: p.unread_count,
                        })
                        .collect(),
                    id: conversation.id,
                    conversation_type: conversation.conversation_type,
                    name: conversation.name,
                    avatar: conversation.avatar,
                    last_message,
                    last_message_at: conversation.last_message_at,
                    is_active: conversation.is_active,
                    unread_count,
                    created_at: conversation.created_at,
                    updated_at: conversation.updated_at,
                }
            })
            .collect();

        Ok(views)
    }

    pub async fn conversation(
        &self,
        conversation: Conversation,
        viewer_id: &str,
    ) -> Result<ConversationView, AppError> {
        self.conversations(vec![conversation], viewer_id)
            .await?
            .pop()
            .ok_or(AppError::NotFound)
    }

    pub async fn messages(
        &self,
        messages: Vec<Message>,
        viewer_id: &str,
    ) -> Result<Vec<MessageView>, AppError> {
        let reply_ids: Vec<String> = messages
            .iter()
            .filter_map(|m| m.reply_to_id.clone())
            .collect();
        let replies: HashMap<String, Message> = self
            .db
            .get_messages_by_ids(&reply_ids)
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut user_ids: HashSet<String> = messages.iter().map(|m| m.sender_id.clone()).collect();
        user_ids.extend(replies.values().map(|m| m.sender_id.clone()));
        let user_ids: Vec<String> = user_ids.into_iter().collect();
        let users = self.users(&user_ids).await?;

        let views = messages
            .into_iter()
            .map(|message| {
                let is_read = message.sender_id == viewer_id || message.is_read_by(viewer_id);
                let reply_to = message
                    .reply_to_id
                    .as_ref()
                    .and_then(|id| replies.get(id))
                    .map(|m| message_summary(m, &users));
                MessageView {
                    sender: lookup(&users, &message.sender_id),
                    id: message.id,
                    conversation_id: message.conversation_id,
                    content: message.content,
                    message_type: message.message_type,
                    attachments: message.attachments,
                    reply_to,
                    is_edited: message.is_edited,
                    edited_at: message.edited_at,
                    edit_history: message.edit_history,
                    is_deleted: message.is_deleted,
                    deleted_at: message.deleted_at,
                    read_by: message.read_by,
                    reactions: message.reactions,
                    is_read,
                    created_at: message.created_at,
                    updated_at: message.updated_at,
                }
            })
            .collect();

        Ok(views)
    }

    pub async fn message(&self, message: Message, viewer_id: &str) -> Result<MessageView, AppError> {
        self.messages(vec![message], viewer_id)
            .await?
            .pop()
            .ok_or(AppError::NotFound)
    }
}

fn summarize(user: User, is_online: bool, last_seen: Option<DateTime<Utc>>) -> UserSummary {
    UserSummary {
        id: user.id,
        username: user.username,
        avatar: user.avatar,
        is_online,
        last_seen,
    }
}

fn lookup(users: &HashMap<String, UserSummary>, id: &str) -> UserSummary {
    users
        .get(id)
        .cloned()
        .unwrap_or_else(|| UserSummary::unknown(id))
}

fn message_summary(message: &Message, users: &HashMap<String, UserSummary>) -> MessageSummary {
    MessageSummary {
        id: message.id.clone(),
        sender: lookup(users, &message.sender_id),
        content: message.content.clone(),
        message_type: message.message_type,
        is_deleted: message.is_deleted,
        created_at: message.created_at,
    }
}
