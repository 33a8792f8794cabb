//! Conversation service
//!
//! Handles the conversation lifecycle: create, list, archive, restore,
//! delete and read state.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::policy::ConversationPolicy;
use super::validation::{
    check_conversation_invariants, ensure_participant, page_window, validate_content,
    validate_private_pair,
};
use crate::auth::Identity;
use crate::config::MessagingConfig;
use crate::data::{
    Conversation, ConversationType, Database, EntityId, Message, MessageType, Participant,
    pair_key,
};
use crate::error::AppError;
use crate::metrics::{CONVERSATIONS_CREATED_TOTAL, MESSAGES_SENT_TOTAL};

/// Result of `create`
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub conversation: Conversation,
    /// `false` if an existing conversation was returned
    pub created: bool,
    pub first_message: Option<Message>,
}

/// Result of `mark_read`
#[derive(Debug, Clone)]
pub struct MarkReadOutcome {
    pub conversation_id: String,
    pub user_id: String,
    /// Messages newly marked as read
    pub marked: u64,
    pub read_at: DateTime<Utc>,
    /// The specific messages read, `None` for the whole conversation
    pub message_ids: Option<Vec<String>>,
    pub participant_ids: Vec<String>,
}

/// Conversation service
pub struct ConversationService {
    db: Arc<Database>,
    policy: Arc<dyn ConversationPolicy>,
    config: MessagingConfig,
}

impl ConversationService {
    pub fn new(
        db: Arc<Database>,
        policy: Arc<dyn ConversationPolicy>,
        config: MessagingConfig,
    ) -> Self {
        Self { db, policy, config }
    }

    /// Open a private conversation with another user
    ///
    /// Returns the existing live conversation for the pair when there is
    /// one (archived included); `first_message` is then ignored. Otherwise
    /// the conversation and the optional first message are persisted
    /// together.
    ///
    /// # Errors
    /// - `Conflict` when talking to oneself
    /// - `NotFound` if the other user does not exist
    /// - `Forbidden` if the initiation policy refuses
    pub async fn create(
        &self,
        identity: &Identity,
        participant_id: &str,
        first_message: Option<&str>,
    ) -> Result<CreateOutcome, AppError> {
        let participant_id = participant_id.trim();
        validate_private_pair(&identity.user_id, participant_id)?;

        if self.db.get_user(participant_id).await?.is_none() {
            return Err(AppError::NotFound);
        }

        if let Some(existing) = self
            .db
            .find_private_conversation(&identity.user_id, participant_id)
            .await?
        {
            return Ok(CreateOutcome {
                conversation: existing,
                created: false,
                first_message: None,
            });
        }

        if !self
            .policy
            .can_initiate_conversation(&identity.user_id, participant_id)
            .await?
        {
            tracing::debug!(
                initiator = %identity.user_id,
                participant = %participant_id,
                "Conversation initiation refused by policy"
            );
            return Err(AppError::Forbidden);
        }

        let content = match first_message.map(str::trim).filter(|c| !c.is_empty()) {
            Some(content) => Some(validate_content(content, &self.config)?),
            None => None,
        };

        let now = Utc::now();
        let id = EntityId::new().0;
        let mut conversation = Conversation {
            participants: [identity.user_id.as_str(), participant_id]
                .iter()
                .enumerate()
                .map(|(position, user_id)| Participant {
                    conversation_id: id.clone(),
                    user_id: user_id.to_string(),
                    position: position as i64,
                    last_seen: now,
                    unread_count: 0,
                })
                .collect(),
            id,
            conversation_type: ConversationType::Private,
            pair_key: Some(pair_key(&identity.user_id, participant_id)),
            name: None,
            avatar: None,
            last_message_id: None,
            last_message_at: now,
            is_active: true,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            created_at: now,
            updated_at: now,
        };
        check_conversation_invariants(&conversation)?;

        let message = content.map(|content| {
            Message::new(
                &conversation.id,
                &identity.user_id,
                content,
                MessageType::Text,
                Vec::new(),
                None,
            )
        });
        if let Some(message) = &message {
            conversation.last_message_id = Some(message.id.clone());
            conversation.last_message_at = message.created_at;
            for participant in &mut conversation.participants {
                if participant.user_id != identity.user_id {
                    participant.unread_count = 1;
                }
            }
        }

        if !self
            .db
            .insert_conversation(&conversation, message.as_ref())
            .await?
        {
            // Lost a creation race for the same pair; the winner's record stands.
            let existing = self
                .db
                .find_private_conversation(&identity.user_id, participant_id)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "private conversation pair conflict without a live conversation"
                    ))
                })?;
            return Ok(CreateOutcome {
                conversation: existing,
                created: false,
                first_message: None,
            });
        }

        CONVERSATIONS_CREATED_TOTAL
            .with_label_values(&["private"])
            .inc();
        if message.is_some() {
            MESSAGES_SENT_TOTAL
                .with_label_values(&[MessageType::Text.as_str()])
                .inc();
        }
        tracing::info!(
            conversation_id = %conversation.id,
            initiator = %identity.user_id,
            "Conversation created"
        );

        Ok(CreateOutcome {
            conversation,
            created: true,
            first_message: message,
        })
    }

    /// Get a conversation the caller participates in
    ///
    /// # Errors
    /// `NotFound` if missing or deleted, `Forbidden` if not a participant
    pub async fn get(&self, user_id: &str, conversation_id: &str) -> Result<Conversation, AppError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound)?;
        ensure_participant(&conversation, user_id)?;
        Ok(conversation)
    }

    /// List the caller's conversations, most recent activity first
    pub async fn list(
        &self,
        user_id: &str,
        archived: bool,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Vec<Conversation>, AppError> {
        let (_, limit, offset) = page_window(page, limit, &self.config);
        self.db
            .list_conversations_for_user(user_id, archived, i64::from(limit), offset)
            .await
    }

    pub async fn unread_total(&self, user_id: &str) -> Result<i64, AppError> {
        self.db.total_unread_for_user(user_id).await
    }

    /// Participants, plus moderators when the bypass is enabled
    fn ensure_can_manage(
        &self,
        conversation: &Conversation,
        identity: &Identity,
    ) -> Result<(), AppError> {
        if conversation.is_participant(&identity.user_id) {
            return Ok(());
        }
        if self.config.moderator_conversation_bypass && identity.role.is_moderator() {
            tracing::info!(
                conversation_id = %conversation.id,
                moderator = %identity.user_id,
                "Moderator acting on conversation"
            );
            return Ok(());
        }
        Err(AppError::Forbidden)
    }

    /// Archive a conversation (hidden until restored or a new message arrives)
    pub async fn archive(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<Conversation, AppError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound)?;
        self.ensure_can_manage(&conversation, identity)?;

        if !self.db.archive_conversation(conversation_id).await? {
            return Err(AppError::NotFound);
        }
        self.reload(conversation_id).await
    }

    /// Restore an archived conversation
    ///
    /// # Errors
    /// `InvalidState` if the conversation is not archived
    pub async fn restore(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<Conversation, AppError> {
        let conversation = self.get(&identity.user_id, conversation_id).await?;
        if conversation.is_active {
            return Err(AppError::InvalidState(
                "Conversation is not archived".to_string(),
            ));
        }

        if !self.db.restore_conversation(conversation_id).await? {
            // Deleted or restored concurrently
            return match self.db.get_conversation(conversation_id).await? {
                Some(_) => Err(AppError::InvalidState(
                    "Conversation is not archived".to_string(),
                )),
                None => Err(AppError::NotFound),
            };
        }
        self.reload(conversation_id).await
    }

    /// Delete a conversation; terminal
    pub async fn delete(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<Conversation, AppError> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound)?;
        self.ensure_can_manage(&conversation, identity)?;

        if !self
            .db
            .delete_conversation(conversation_id, &identity.user_id)
            .await?
        {
            return Err(AppError::NotFound);
        }
        tracing::info!(
            conversation_id = %conversation_id,
            deleted_by = %identity.user_id,
            "Conversation deleted"
        );

        self.db
            .get_conversation_including_deleted(conversation_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Mark messages read and reset the caller's unread counter
    ///
    /// # Arguments
    /// * `message_ids` - specific messages, or every message from others
    ///   when `None`
    pub async fn mark_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_ids: Option<&[String]>,
    ) -> Result<MarkReadOutcome, AppError> {
        let conversation = self.get(user_id, conversation_id).await?;

        let read_at = Utc::now();
        let marked = match message_ids {
            Some(ids) => {
                self.db
                    .mark_messages_read(conversation_id, user_id, ids, read_at)
                    .await?
            }
            None => {
                self.db
                    .mark_conversation_read(conversation_id, user_id, read_at)
                    .await?
            }
        };
        self.db
            .reset_unread(conversation_id, user_id, read_at)
            .await?;

        Ok(MarkReadOutcome {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            marked,
            read_at,
            message_ids: message_ids.map(<[String]>::to_vec),
            participant_ids: conversation.participant_ids(),
        })
    }

    async fn reload(&self, conversation_id: &str) -> Result<Conversation, AppError> {
        self.db
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound)
    }
}
