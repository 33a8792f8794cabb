//! Conversation initiation policy
//!
//! Decides whether one user may open a conversation with another.

use axum::async_trait;
use std::sync::Arc;

use crate::config::MessagingConfig;
use crate::data::Database;
use crate::error::AppError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationPolicy: Send + Sync {
    async fn can_initiate_conversation(
        &self,
        initiator_id: &str,
        participant_id: &str,
    ) -> Result<bool, AppError>;
}

/// Anyone may message anyone
pub struct OpenPolicy;

#[async_trait]
impl ConversationPolicy for OpenPolicy {
    async fn can_initiate_conversation(&self, _: &str, _: &str) -> Result<bool, AppError> {
        Ok(true)
    }
}

/// Only users with an accepted friendship may start a conversation
pub struct FriendsOnlyPolicy {
    db: Arc<Database>,
}

impl FriendsOnlyPolicy {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationPolicy for FriendsOnlyPolicy {
    async fn can_initiate_conversation(
        &self,
        initiator_id: &str,
        participant_id: &str,
    ) -> Result<bool, AppError> {
        self.db.are_friends(initiator_id, participant_id).await
    }
}

/// Select the policy configured by `messaging.require_friendship`
pub fn policy_from_config(
    config: &MessagingConfig,
    db: Arc<Database>,
) -> Arc<dyn ConversationPolicy> {
    if config.require_friendship {
        Arc::new(FriendsOnlyPolicy::new(db))
    } else {
        Arc::new(OpenPolicy)
    }
}
