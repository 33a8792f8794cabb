//! Turns engine outcomes into acknowledgment data and fan-out envelopes
//!
//! Used by both the HTTP facade and the WebSocket session so every
//! mutation is announced the same way regardless of where it came from.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::hub::{Envelope, Hub, Topic};
use super::protocol::{EventKind, ServerFrame};
use super::ConnectionId;
use crate::data::Conversation;
use crate::error::AppError;
use crate::service::{
    CreateOutcome, DeletedMessage, MarkReadOutcome, Projector, ReactionOutcome, SendOutcome,
};

fn to_value<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.into()))
}

/// Result data for the caller plus the envelopes to publish
#[derive(Debug, Default)]
pub struct Notification {
    pub data: Value,
    pub envelopes: Vec<Envelope>,
}

impl Notification {
    fn new(data: Value) -> Self {
        Self {
            data,
            envelopes: Vec::new(),
        }
    }

    fn push(
        &mut self,
        topic: Topic,
        event: EventKind,
        temp_id: Option<String>,
        data: Value,
    ) -> Result<(), AppError> {
        let payload = ServerFrame::event(event, temp_id, data).to_text()?;
        self.envelopes.push(Envelope::new(topic, payload));
        Ok(())
    }

    /// Publish to each participant's personal channel
    fn push_to_users(
        &mut self,
        user_ids: &[String],
        event: EventKind,
        temp_id: &Option<String>,
        data: &Value,
    ) -> Result<(), AppError> {
        for user_id in user_ids {
            self.push(
                Topic::User(user_id.clone()),
                event,
                temp_id.clone(),
                data.clone(),
            )?;
        }
        Ok(())
    }
}

/// Conversation lifecycle changes announced to participants
#[derive(Debug, Clone, Copy)]
pub enum LifecycleChange {
    Archived,
    Restored,
    Deleted,
}

impl LifecycleChange {
    fn event(self) -> EventKind {
        match self {
            Self::Archived => EventKind::ConversationArchived,
            Self::Restored => EventKind::ConversationRestored,
            Self::Deleted => EventKind::ConversationDeleted,
        }
    }
}

pub struct Notifier {
    hub: Arc<Hub>,
    projector: Arc<Projector>,
}

impl Notifier {
    pub fn new(hub: Arc<Hub>, projector: Arc<Projector>) -> Self {
        Self { hub, projector }
    }

    /// Publish a notification's envelopes in order
    pub async fn dispatch(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            self.hub.publish(envelope).await;
        }
    }

    /// `conversation:created` to the other participant, with the unread
    /// delta when a first message was sent
    pub async fn conversation_created(
        &self,
        outcome: &CreateOutcome,
        initiator_id: &str,
    ) -> Result<Notification, AppError> {
        let view = self
            .projector
            .conversation(outcome.conversation.clone(), initiator_id)
            .await?;
        let mut notification = Notification::new(to_value(&view)?);
        if !outcome.created {
            return Ok(notification);
        }

        let first_message = match &outcome.first_message {
            Some(message) => Some(self.projector.message(message.clone(), initiator_id).await?),
            None => None,
        };

        for participant in &outcome.conversation.participants {
            if participant.user_id == initiator_id {
                continue;
            }
            let their_view = self
                .projector
                .conversation(outcome.conversation.clone(), &participant.user_id)
                .await?;
            let topic = Topic::User(participant.user_id.clone());
            notification.push(
                topic.clone(),
                EventKind::ConversationCreated,
                None,
                to_value(&their_view)?,
            )?;
            if let Some(message) = &first_message {
                notification.push(
                    topic,
                    EventKind::ConversationUnread,
                    None,
                    json!({
                        "conversationId": outcome.conversation.id,
                        "unreadCount": participant.unread_count,
                        "lastMessage": message,
                    }),
                )?;
            }
        }

        Ok(notification)
    }

    /// `message:new` to the room (sender included), the unread delta to
    /// every other participant, and `conversation:reactivated` when the
    /// send woke an archived conversation
    pub async fn message_sent(
        &self,
        outcome: &SendOutcome,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let message = &outcome.message;
        let view = self
            .projector
            .message(message.clone(), &message.sender_id)
            .await?;
        let view = to_value(&view)?;
        let mut notification = Notification::new(view.clone());

        if outcome.append.reactivated {
            notification.push_to_users(
                &outcome.append.participant_ids,
                EventKind::ConversationReactivated,
                &None,
                &json!({
                    "conversationId": message.conversation_id,
                    "isActive": true,
                }),
            )?;
        }

        notification.push(
            Topic::Conversation(message.conversation_id.clone()),
            EventKind::MessageNew,
            temp_id,
            json!({
                "conversationId": message.conversation_id,
                "message": view,
            }),
        )?;

        for unread in &outcome.append.unread {
            notification.push(
                Topic::User(unread.user_id.clone()),
                EventKind::ConversationUnread,
                None,
                json!({
                    "conversationId": message.conversation_id,
                    "unreadCount": unread.unread_count,
                    "lastMessage": view,
                }),
            )?;
        }

        Ok(notification)
    }

    pub async fn message_edited(
        &self,
        message: &crate::data::Message,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let view = self
            .projector
            .message(message.clone(), &message.sender_id)
            .await?;
        let view = to_value(&view)?;
        let mut notification = Notification::new(view.clone());
        notification.push(
            Topic::Conversation(message.conversation_id.clone()),
            EventKind::MessageEdited,
            temp_id,
            json!({
                "conversationId": message.conversation_id,
                "message": view,
            }),
        )?;
        Ok(notification)
    }

    /// `message:deleted` to the room and corrected unread counters to the
    /// participants who had not seen the message
    pub async fn message_deleted(
        &self,
        deleted: &DeletedMessage,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let message = &deleted.message;
        let view = self
            .projector
            .message(message.clone(), &message.sender_id)
            .await?;
        let view = to_value(&view)?;
        let mut notification = Notification::new(view.clone());

        notification.push(
            Topic::Conversation(message.conversation_id.clone()),
            EventKind::MessageDeleted,
            temp_id,
            json!({
                "conversationId": message.conversation_id,
                "messageId": message.id,
                "message": view,
                "lastMessageChanged": deleted.outcome.last_message_repaired,
            }),
        )?;

        for unread in &deleted.outcome.unread {
            notification.push(
                Topic::User(unread.user_id.clone()),
                EventKind::ConversationUnread,
                None,
                json!({
                    "conversationId": message.conversation_id,
                    "unreadCount": unread.unread_count,
                }),
            )?;
        }

        Ok(notification)
    }

    pub async fn reaction_changed(
        &self,
        outcome: &ReactionOutcome,
        user_id: &str,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let message = &outcome.message;
        let view = self.projector.message(message.clone(), user_id).await?;
        let view = to_value(&view)?;
        let mut notification = Notification::new(view.clone());
        notification.push(
            Topic::Conversation(message.conversation_id.clone()),
            EventKind::MessageReaction,
            temp_id,
            json!({
                "conversationId": message.conversation_id,
                "messageId": message.id,
                "userId": user_id,
                "emoji": outcome.emoji,
                "change": outcome.change,
                "reactions": message.reactions,
            }),
        )?;
        Ok(notification)
    }

    /// Echo a read to the reader's other sessions and tell the other
    /// participants their messages were read
    pub fn conversation_read(
        &self,
        outcome: &MarkReadOutcome,
        origin: Option<ConnectionId>,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let data = json!({
            "conversationId": outcome.conversation_id,
            "userId": outcome.user_id,
            "readAt": outcome.read_at,
            "markedCount": outcome.marked,
            "unreadCount": 0,
        });
        let payload = ServerFrame::event(EventKind::ConversationRead, temp_id, data.clone())
            .to_text()?;
        let mut envelope = Envelope::new(Topic::User(outcome.user_id.clone()), payload);
        if let Some(connection) = origin {
            envelope = envelope.excluding(connection);
        }

        let mut notification = Notification::new(data);
        notification.envelopes.push(envelope);

        let others: Vec<String> = outcome
            .participant_ids
            .iter()
            .filter(|id| **id != outcome.user_id)
            .cloned()
            .collect();
        let receipt = json!({
            "conversationId": outcome.conversation_id,
            "readBy": outcome.user_id,
            "readAt": outcome.read_at,
            "messageIds": outcome.message_ids,
        });
        notification.push_to_users(&others, EventKind::MessageRead, &None, &receipt)?;

        Ok(notification)
    }

    /// `typing:start`/`typing:stop` to the room except the typing connection
    pub fn typing(
        &self,
        conversation_id: &str,
        user_id: &str,
        started: bool,
        origin: ConnectionId,
    ) -> Result<Notification, AppError> {
        let event = if started {
            EventKind::TypingStart
        } else {
            EventKind::TypingStop
        };
        let data = json!({
            "conversationId": conversation_id,
            "userId": user_id,
        });
        let payload = ServerFrame::event(event, None, data.clone()).to_text()?;

        Ok(Notification {
            data,
            envelopes: vec![
                Envelope::new(Topic::Conversation(conversation_id.to_string()), payload)
                    .excluding(origin),
            ],
        })
    }

    /// Archive/restore/delete to every participant's personal channel
    pub fn lifecycle(
        &self,
        change: LifecycleChange,
        conversation: &Conversation,
        actor_id: &str,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let data = json!({
            "conversationId": conversation.id,
            "isActive": conversation.is_active,
            "isDeleted": conversation.is_deleted,
            "actorId": actor_id,
            "at": Utc::now(),
        });
        let mut notification = Notification::new(data.clone());
        notification.push_to_users(
            &conversation.participant_ids(),
            change.event(),
            &temp_id,
            &data,
        )?;
        Ok(notification)
    }
}
