//! Message service
//!
//! Handles message operations: send, page, edit, delete, react.

use chrono::Utc;
use std::sync::Arc;

use super::validation::{
    ensure_participant, ensure_sender, page_window, validate_attachments, validate_content,
    validate_emoji,
};
use crate::config::MessagingConfig;
use crate::data::{
    AppendOutcome, Attachment, Conversation, Database, DeleteOutcome, Message, MessageType,
    ReactionChange, ReadReceipt,
};
use crate::error::AppError;
use crate::metrics::MESSAGES_SENT_TOTAL;

/// A message to send
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub conversation_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub reply_to_id: Option<String>,
}

/// Result of `send`
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub append: AppendOutcome,
}

/// One page of a conversation, oldest first
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

/// Result of `delete`
#[derive(Debug, Clone)]
pub struct DeletedMessage {
    pub message: Message,
    pub participant_ids: Vec<String>,
    pub outcome: DeleteOutcome,
}

/// Result of `react`
#[derive(Debug, Clone)]
pub struct ReactionOutcome {
    pub message: Message,
    pub change: ReactionChange,
    pub emoji: String,
}

/// Message service
pub struct MessageService {
    db: Arc<Database>,
    config: MessagingConfig,
}

impl MessageService {
    pub fn new(db: Arc<Database>, config: MessagingConfig) -> Self {
        Self { db, config }
    }

    async fn participant_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, AppError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound)?;
        ensure_participant(&conversation, user_id)?;
        Ok(conversation)
    }

    /// Load a live message whose conversation is live and includes the caller
    async fn accessible_message(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<(Message, Conversation), AppError> {
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound)?;
        let conversation = self
            .participant_conversation(user_id, &message.conversation_id)
            .await?;
        Ok((message, conversation))
    }

    /// Send a message
    ///
    /// Reactivates the conversation if it was archived and increments the
    /// unread counter of every other participant by one.
    ///
    /// # Errors
    /// - `NotFound` if the conversation is missing or deleted
    /// - `Forbidden` if the sender is not a participant
    /// - `Validation` for bad content, attachments or reply target
    pub async fn send(&self, sender_id: &str, new: NewMessage) -> Result<SendOutcome, AppError> {
        self.participant_conversation(sender_id, &new.conversation_id)
            .await?;

        let content = validate_content(&new.content, &self.config)?;
        validate_attachments(&new.attachments, &self.config)?;

        if let Some(reply_to_id) = &new.reply_to_id {
            let target = self.db.get_message(reply_to_id).await?;
            if target.is_none_or(|m| m.conversation_id != new.conversation_id) {
                return Err(AppError::Validation(
                    "replyTo must reference a message in the same conversation".to_string(),
                ));
            }
        }

        let message = Message::new(
            &new.conversation_id,
            sender_id,
            content,
            new.message_type,
            new.attachments,
            new.reply_to_id,
        );
        let append = self.db.append_message(&message).await?;

        MESSAGES_SENT_TOTAL
            .with_label_values(&[message.message_type.as_str()])
            .inc();
        tracing::debug!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            reactivated = append.reactivated,
            "Message sent"
        );

        Ok(SendOutcome { message, append })
    }

    /// Page through a conversation, oldest first
    ///
    /// Marks the returned messages read by the caller and resets the
    /// caller's unread counter.
    pub async fn list(
        &self,
        user_id: &str,
        conversation_id: &str,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<MessagePage, AppError> {
        self.participant_conversation(user_id, conversation_id)
            .await?;

        let (page, limit, offset) = page_window(page, limit, &self.config);
        let mut messages = self
            .db
            .list_messages(conversation_id, i64::from(limit) + 1, offset)
            .await?;
        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);

        let read_at = Utc::now();
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        self.db
            .mark_messages_read(conversation_id, user_id, &ids, read_at)
            .await?;
        self.db
            .reset_unread(conversation_id, user_id, read_at)
            .await?;

        for message in &mut messages {
            if !message.is_read_by(user_id) {
                message.read_by.push(ReadReceipt {
                    user_id: user_id.to_string(),
                    read_at,
                });
            }
        }

        Ok(MessagePage {
            messages,
            page,
            limit,
            has_more,
        })
    }

    /// Edit a message's content within the edit window
    ///
    /// # Errors
    /// - `NotFound` if the message is missing or deleted
    /// - `Forbidden` if the caller is not the sender
    /// - `InvalidState` once the edit window has passed
    pub async fn edit(
        &self,
        user_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, AppError> {
        let (message, _) = self.accessible_message(user_id, message_id).await?;
        ensure_sender(&message, user_id)?;

        let now = Utc::now();
        if !message.can_edit_at(now, self.config.edit_window()) {
            return Err(AppError::InvalidState(
                "Message can no longer be edited".to_string(),
            ));
        }
        let content = validate_content(content, &self.config)?;

        self.db
            .edit_message(message_id, &content, now, self.config.edit_window())
            .await?;

        self.db
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Soft-delete a message; sender only
    pub async fn delete(&self, user_id: &str, message_id: &str) -> Result<DeletedMessage, AppError> {
        let (message, conversation) = self.accessible_message(user_id, message_id).await?;
        ensure_sender(&message, user_id)?;

        let outcome = self
            .db
            .soft_delete_message(message_id, user_id, Utc::now())
            .await?;
        let message = self
            .db
            .get_message_including_deleted(message_id)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(DeletedMessage {
            message,
            participant_ids: conversation.participant_ids(),
            outcome,
        })
    }

    /// Add, replace or remove the caller's reaction
    pub async fn react(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<ReactionOutcome, AppError> {
        let emoji = validate_emoji(emoji)?;
        self.accessible_message(user_id, message_id).await?;

        let change = self.db.toggle_reaction(message_id, user_id, &emoji).await?;
        let message = self
            .db
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(ReactionOutcome {
            message,
            change,
            emoji,
        })
    }
}
