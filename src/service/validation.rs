//! Input and invariant checks
//!
//! Plain functions returning typed errors; nothing here touches the store.

use crate::config::MessagingConfig;
use crate::data::{Attachment, Conversation, ConversationType, Message};
use crate::error::AppError;

/// Longest accepted reaction (an emoji with modifiers is several chars)
const MAX_EMOJI_CHARS: usize = 32;

/// Trim message content and enforce the length bound
///
/// # Returns
/// The trimmed content
pub fn validate_content(content: &str, config: &MessagingConfig) -> Result<String, AppError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("Message content is required".to_string()));
    }
    if content.chars().count() > config.max_content_length {
        return Err(AppError::Validation(format!(
            "Message cannot exceed {} characters",
            config.max_content_length
        )));
    }
    Ok(content.to_string())
}

pub fn validate_attachments(
    attachments: &[Attachment],
    config: &MessagingConfig,
) -> Result<(), AppError> {
    if attachments.len() > config.max_attachments {
        return Err(AppError::Validation(format!(
            "A message can carry at most {} attachments",
            config.max_attachments
        )));
    }

    for attachment in attachments {
        let parsed = url::Url::parse(attachment.url.trim())
            .map_err(|_| AppError::Validation("Attachment url is invalid".to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(
                "Attachment url must be http or https".to_string(),
            ));
        }
        if attachment.filename.trim().is_empty() {
            return Err(AppError::Validation(
                "Attachment filename is required".to_string(),
            ));
        }
        if attachment.size < 0 || attachment.size > config.max_attachment_bytes {
            return Err(AppError::Validation(format!(
                "Attachment size must be between 0 and {} bytes",
                config.max_attachment_bytes
            )));
        }
    }

    Ok(())
}

pub fn validate_emoji(emoji: &str) -> Result<String, AppError> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(AppError::Validation("Invalid reaction".to_string()));
    }
    Ok(emoji.to_string())
}

/// Both ends of a private conversation must be distinct users
pub fn validate_private_pair(initiator: &str, participant: &str) -> Result<(), AppError> {
    if participant.trim().is_empty() {
        return Err(AppError::Validation("participantId is required".to_string()));
    }
    if initiator == participant {
        return Err(AppError::Conflict(
            "A private conversation needs two distinct participants".to_string(),
        ));
    }
    Ok(())
}

/// Structural invariants of a conversation record
pub fn check_conversation_invariants(conversation: &Conversation) -> Result<(), AppError> {
    if conversation.conversation_type == ConversationType::Private {
        let ids = conversation.participant_ids();
        if ids.len() != 2 || ids[0] == ids[1] {
            return Err(AppError::Conflict(
                "A private conversation needs exactly two distinct participants".to_string(),
            ));
        }
    }
    if conversation.is_deleted && conversation.is_active {
        return Err(AppError::Conflict(
            "A deleted conversation cannot be active".to_string(),
        ));
    }
    Ok(())
}

/// Caller must be a participant of the conversation
pub fn ensure_participant(conversation: &Conversation, user_id: &str) -> Result<(), AppError> {
    if conversation.is_participant(user_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

/// Caller must be the message's sender
pub fn ensure_sender(message: &Message, user_id: &str) -> Result<(), AppError> {
    if message.sender_id == user_id {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

/// Normalize `page`/`limit` query values
///
/// # Returns
/// `(page, limit, offset)` with page ≥ 1 and 1 ≤ limit ≤ max_page_size
pub fn page_window(
    page: Option<u32>,
    limit: Option<u32>,
    config: &MessagingConfig,
) -> (u32, u32, i64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit
        .unwrap_or(config.default_page_size)
        .clamp(1, config.max_page_size);
    let offset = i64::from(page - 1) * i64::from(limit);
    (page, limit, offset)
}
