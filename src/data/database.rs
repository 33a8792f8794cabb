//! SQLite database operations
//!
//! All database access goes through this module.
//! Conversation queries exclude soft-deleted records unless the method
//! name says otherwise (`*_including_deleted`).

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// SQLite limits the number of bound parameters; batch lookups are chunked.
const IN_CLAUSE_CHUNK: usize = 100;

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Commit or roll back a transaction opened with `BEGIN IMMEDIATE`
async fn finish_transaction<T>(
    conn: &mut SqliteConnection,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::error!(%rollback_error, "Rollback failed");
            }
            Err(error)
        }
    }
}

fn is_unique_violation(error: &AppError) -> bool {
    matches!(
        error,
        AppError::Database(sqlx::Error::Database(db_error)) if db_error.is_unique_violation()
    )
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    message_id: String,
    #[sqlx(flatten)]
    attachment: Attachment,
}

#[derive(sqlx::FromRow)]
struct EditRow {
    message_id: String,
    #[sqlx(flatten)]
    edit: EditRecord,
}

#[derive(sqlx::FromRow)]
struct ReadRow {
    message_id: String,
    #[sqlx(flatten)]
    receipt: ReadReceipt,
}

#[derive(sqlx::FromRow)]
struct ReactionRow {
    message_id: String,
    #[sqlx(flatten)]
    reaction: Reaction,
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Users (identity directory)
    // =========================================================================

    /// Insert or update a user record
    ///
    /// The identity service owns users; this exists for provisioning
    /// and tests.
    pub async fn upsert_user(&self, user: &User) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, avatar, role, is_online, last_seen, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                avatar = excluded.avatar,
                role = excluded.role,
                is_online = excluded.is_online,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.avatar)
        .bind(&user.role)
        .bind(user.is_online)
        .bind(user.last_seen)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Record when a user was last connected
    pub async fn record_last_seen(
        &self,
        user_id: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
            .bind(last_seen)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get multiple users by ID (batch operation to avoid N+1)
    pub async fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<User>, AppError> {
        let mut users = Vec::new();

        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let query = format!(
                "SELECT * FROM users WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query_builder = sqlx::query_as::<_, User>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            users.extend(query_builder.fetch_all(&self.pool).await?);
        }

        Ok(users)
    }

    /// Record an accepted friendship in both directions
    pub async fn insert_friendship(&self, user_id: &str, friend_id: &str) -> Result<(), AppError> {
        let now = Utc::now();
        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            sqlx::query(
                "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(a)
            .bind(b)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn are_friends(&self, user_id: &str, friend_id: &str) -> Result<bool, AppError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM friendships WHERE user_id = ? AND friend_id = ?",
        )
        .bind(user_id)
        .bind(friend_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(found > 0)
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    async fn load_participants(
        &self,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, Vec<Participant>>, AppError> {
        let mut by_conversation: HashMap<String, Vec<Participant>> = HashMap::new();

        for chunk in conversation_ids.chunks(IN_CLAUSE_CHUNK) {
            let query = format!(
                "SELECT * FROM conversation_participants WHERE conversation_id IN ({}) ORDER BY position",
                placeholders(chunk.len())
            );
            let mut query_builder = sqlx::query_as::<_, Participant>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            for participant in query_builder.fetch_all(&self.pool).await? {
                by_conversation
                    .entry(participant.conversation_id.clone())
                    .or_default()
                    .push(participant);
            }
        }

        Ok(by_conversation)
    }

    async fn with_participants(
        &self,
        mut conversations: Vec<Conversation>,
    ) -> Result<Vec<Conversation>, AppError> {
        let ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();
        let mut participants = self.load_participants(&ids).await?;
        for conversation in &mut conversations {
            conversation.participants = participants.remove(&conversation.id).unwrap_or_default();
        }
        Ok(conversations)
    }

    async fn fetch_conversation(
        &self,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Conversation>, AppError> {
        let query = if include_deleted {
            "SELECT * FROM conversations WHERE id = ?"
        } else {
            "SELECT * FROM conversations WHERE id = ? AND is_deleted = 0"
        };
        let Some(conversation) = sqlx::query_as::<_, Conversation>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        Ok(self.with_participants(vec![conversation]).await?.pop())
    }

    /// Get a live (not deleted) conversation with its participants
    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.fetch_conversation(id, false).await
    }

    /// Get a conversation even if it was deleted
    pub async fn get_conversation_including_deleted(
        &self,
        id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        self.fetch_conversation(id, true).await
    }

    /// Find the live private conversation between two users
    pub async fn find_private_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<Option<Conversation>, AppError> {
        let Some(conversation) = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE pair_key = ? AND is_deleted = 0",
        )
        .bind(pair_key(user_a, user_b))
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        Ok(self.with_participants(vec![conversation]).await?.pop())
    }

    /// Insert a conversation, its participants and an optional first message
    /// atomically.
    ///
    /// Non-sender participants start with an unread count of 1 when a first
    /// message is given.
    ///
    /// # Returns
    /// `false` if a live private conversation for the same pair already
    /// exists (nothing was written).
    pub async fn insert_conversation(
        &self,
        conversation: &Conversation,
        first_message: Option<&Message>,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            sqlx::query(
                r#"
                INSERT INTO conversations (
                    id, conversation_type, pair_key, name, avatar, last_message_id,
                    last_message_at, is_active, is_deleted, deleted_at, deleted_by,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&conversation.id)
            .bind(conversation.conversation_type)
            .bind(&conversation.pair_key)
            .bind(&conversation.name)
            .bind(&conversation.avatar)
            .bind(&conversation.last_message_id)
            .bind(conversation.last_message_at)
            .bind(conversation.is_active)
            .bind(conversation.is_deleted)
            .bind(conversation.deleted_at)
            .bind(&conversation.deleted_by)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(&mut *conn)
            .await?;

            for participant in &conversation.participants {
                sqlx::query(
                    r#"
                    INSERT INTO conversation_participants (
                        conversation_id, user_id, position, last_seen, unread_count
                    ) VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&conversation.id)
                .bind(&participant.user_id)
                .bind(participant.position)
                .bind(participant.last_seen)
                .bind(participant.unread_count)
                .execute(&mut *conn)
                .await?;
            }

            if let Some(message) = first_message {
                insert_message_rows(&mut conn, message).await?;
            }

            Ok(())
        }
        .await;

        match finish_transaction(&mut conn, result).await {
            Ok(()) => Ok(true),
            Err(error) if is_unique_violation(&error) => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    "Concurrent creation won the private conversation pair"
                );
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// List a user's live conversations, most recent activity first
    ///
    /// # Arguments
    /// * `archived` - list archived (`is_active = 0`) instead of active ones
    pub async fn list_conversations_for_user(
        &self,
        user_id: &str,
        archived: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>, AppError> {
        let conversations = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT c.* FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = ? AND c.is_deleted = 0 AND c.is_active = ?
            ORDER BY c.last_message_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(!archived)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        self.with_participants(conversations).await
    }

    /// Sum of a user's unread counters across active conversations
    pub async fn total_unread_for_user(&self, user_id: &str) -> Result<i64, AppError> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(p.unread_count), 0)
            FROM conversation_participants p
            JOIN conversations c ON c.id = p.conversation_id
            WHERE p.user_id = ? AND c.is_deleted = 0 AND c.is_active = 1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Archive a live conversation
    ///
    /// # Returns
    /// `false` if the conversation is missing or deleted
    pub async fn archive_conversation(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversations SET is_active = 0, updated_at = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Restore an archived conversation
    ///
    /// # Returns
    /// `false` unless the conversation was archived and not deleted
    pub async fn restore_conversation(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET is_active = 1, updated_at = ?
            WHERE id = ? AND is_active = 0 AND is_deleted = 0
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Permanently delete (soft) a conversation
    pub async fn delete_conversation(&self, id: &str, deleted_by: &str) -> Result<bool, AppError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET is_deleted = 1, is_active = 0, deleted_at = ?, deleted_by = ?, updated_at = ?
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(now)
        .bind(deleted_by)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset a participant's unread counter and move their last-seen mark
    pub async fn reset_unread(
        &self,
        conversation_id: &str,
        user_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE conversation_participants SET unread_count = 0, last_seen = ?
            WHERE conversation_id = ? AND user_id = ?
            "#,
        )
        .bind(seen_at)
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Append a message to a live conversation
    ///
    /// In one transaction: inserts the message, points the conversation's
    /// last message at it, reactivates the conversation if archived and
    /// atomically increments every other participant's unread counter.
    ///
    /// # Errors
    /// `NotFound` if the conversation is missing or deleted
    pub async fn append_message(&self, message: &Message) -> Result<AppendOutcome, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<AppendOutcome, AppError> = async {
            let was_active = sqlx::query_scalar::<_, bool>(
                "SELECT is_active FROM conversations WHERE id = ? AND is_deleted = 0",
            )
            .bind(&message.conversation_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(AppError::NotFound)?;

            insert_message_rows(&mut conn, message).await?;

            sqlx::query(
                r#"
                UPDATE conversations
                SET last_message_id = ?, last_message_at = ?, is_active = 1, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&message.id)
            .bind(message.created_at)
            .bind(message.created_at)
            .bind(&message.conversation_id)
            .execute(&mut *conn)
            .await?;

            let unread = sqlx::query_as::<_, UnreadCount>(
                r#"
                UPDATE conversation_participants SET unread_count = unread_count + 1
                WHERE conversation_id = ? AND user_id != ?
                RETURNING user_id, unread_count
                "#,
            )
            .bind(&message.conversation_id)
            .bind(&message.sender_id)
            .fetch_all(&mut *conn)
            .await?;

            let participant_ids = sqlx::query_scalar::<_, String>(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY position",
            )
            .bind(&message.conversation_id)
            .fetch_all(&mut *conn)
            .await?;

            Ok(AppendOutcome {
                reactivated: !was_active,
                unread,
                participant_ids,
            })
        }
        .await;

        finish_transaction(&mut conn, result).await
    }

    async fn fetch_message(
        &self,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<Message>, AppError> {
        let query = if include_deleted {
            "SELECT * FROM messages WHERE id = ?"
        } else {
            "SELECT * FROM messages WHERE id = ? AND is_deleted = 0"
        };
        let Some(message) = sqlx::query_as::<_, Message>(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let mut messages = vec![message];
        self.hydrate_messages(&mut messages).await?;
        Ok(messages.pop())
    }

    /// Get a live (not deleted) message with attachments, history,
    /// receipts and reactions
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, AppError> {
        self.fetch_message(id, false).await
    }

    pub async fn get_message_including_deleted(
        &self,
        id: &str,
    ) -> Result<Option<Message>, AppError> {
        self.fetch_message(id, true).await
    }

    /// Get messages by ID including deleted ones, without side tables
    ///
    /// Used for reply summaries, where a deleted original still renders.
    pub async fn get_messages_by_ids(&self, ids: &[String]) -> Result<Vec<Message>, AppError> {
        let mut messages = Vec::new();

        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let query = format!(
                "SELECT * FROM messages WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query_builder = sqlx::query_as::<_, Message>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            messages.extend(query_builder.fetch_all(&self.pool).await?);
        }

        Ok(messages)
    }

    /// Page through a conversation's live messages, oldest first
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, AppError> {
        let mut messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ? AND is_deleted = 0
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_messages(&mut messages).await?;
        Ok(messages)
    }

    /// Fill attachments, edit history, read receipts and reactions
    async fn hydrate_messages(&self, messages: &mut [Message]) -> Result<(), AppError> {
        if messages.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let mut attachments: HashMap<String, Vec<Attachment>> = HashMap::new();
        let mut edits: HashMap<String, Vec<EditRecord>> = HashMap::new();
        let mut reads: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
        let mut reactions: HashMap<String, Vec<Reaction>> = HashMap::new();

        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let marks = placeholders(chunk.len());

            let query = format!(
                "SELECT message_id, attachment_type, url, filename, size, mime_type FROM message_attachments WHERE message_id IN ({marks}) ORDER BY position"
            );
            let mut query_builder = sqlx::query_as::<_, AttachmentRow>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            for row in query_builder.fetch_all(&self.pool).await? {
                attachments.entry(row.message_id).or_default().push(row.attachment);
            }

            let query = format!(
                "SELECT message_id, content, edited_at FROM message_edits WHERE message_id IN ({marks}) ORDER BY id"
            );
            let mut query_builder = sqlx::query_as::<_, EditRow>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            for row in query_builder.fetch_all(&self.pool).await? {
                edits.entry(row.message_id).or_default().push(row.edit);
            }

            let query = format!(
                "SELECT message_id, user_id, read_at FROM message_reads WHERE message_id IN ({marks}) ORDER BY read_at"
            );
            let mut query_builder = sqlx::query_as::<_, ReadRow>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            for row in query_builder.fetch_all(&self.pool).await? {
                reads.entry(row.message_id).or_default().push(row.receipt);
            }

            let query = format!(
                "SELECT message_id, user_id, emoji, created_at FROM message_reactions WHERE message_id IN ({marks}) ORDER BY created_at"
            );
            let mut query_builder = sqlx::query_as::<_, ReactionRow>(&query);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            for row in query_builder.fetch_all(&self.pool).await? {
                reactions.entry(row.message_id).or_default().push(row.reaction);
            }
        }

        for message in messages.iter_mut() {
            message.attachments = attachments.remove(&message.id).unwrap_or_default();
            message.edit_history = edits.remove(&message.id).unwrap_or_default();
            message.read_by = reads.remove(&message.id).unwrap_or_default();
            message.reactions = reactions.remove(&message.id).unwrap_or_default();
        }

        Ok(())
    }

    /// Record read receipts for specific live messages of a conversation
    ///
    /// Already-read messages are left untouched.
    ///
    /// # Returns
    /// Number of new receipts
    pub async fn mark_messages_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_ids: &[String],
        read_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut inserted = 0;

        for chunk in message_ids.chunks(IN_CLAUSE_CHUNK) {
            let query = format!(
                r#"
                INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                SELECT id, ?, ? FROM messages
                WHERE conversation_id = ? AND is_deleted = 0 AND id IN ({})
                "#,
                placeholders(chunk.len())
            );
            let mut query_builder = sqlx::query(&query)
                .bind(user_id)
                .bind(read_at)
                .bind(conversation_id);
            for id in chunk {
                query_builder = query_builder.bind(id);
            }
            inserted += query_builder.execute(&self.pool).await?.rows_affected();
        }

        Ok(inserted)
    }

    /// Record read receipts for every live message other users sent
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
            SELECT id, ?, ? FROM messages
            WHERE conversation_id = ? AND is_deleted = 0 AND sender_id != ?
            "#,
        )
        .bind(user_id)
        .bind(read_at)
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Replace a live message's content, keeping the previous content in
    /// the edit history
    ///
    /// The stored content is copied into the history inside the same write
    /// transaction, so concurrent edits each record the version they replaced.
    ///
    /// # Errors
    /// - `NotFound` if the message is missing or deleted
    /// - `InvalidState` if `edited_at` is past the message's edit window
    pub async fn edit_message(
        &self,
        message_id: &str,
        new_content: &str,
        edited_at: DateTime<Utc>,
        edit_window: chrono::Duration,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            let created_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT created_at FROM messages WHERE id = ? AND is_deleted = 0",
            )
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?;

            let Some(created_at) = created_at else {
                return Err(AppError::NotFound);
            };
            if edited_at - created_at >= edit_window {
                return Err(AppError::InvalidState(
                    "Message can no longer be edited".to_string(),
                ));
            }

            sqlx::query(
                r#"
                INSERT INTO message_edits (message_id, content, edited_at)
                SELECT id, content, ? FROM messages WHERE id = ? AND is_deleted = 0
                "#,
            )
            .bind(edited_at)
            .bind(message_id)
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                UPDATE messages SET content = ?, is_edited = 1, edited_at = ?, updated_at = ?
                WHERE id = ? AND is_deleted = 0
                "#,
            )
            .bind(new_content)
            .bind(edited_at)
            .bind(edited_at)
            .bind(message_id)
            .execute(&mut *conn)
            .await?;

            Ok(())
        }
        .await;

        finish_transaction(&mut conn, result).await
    }

    /// Soft-delete a message
    ///
    /// Replaces the content with the tombstone, clears attachments,
    /// decrements the unread counter of participants who had not seen the
    /// message yet and re-points the conversation's last message if it
    /// was this one.
    ///
    /// # Errors
    /// `NotFound` if the message is missing or already deleted
    pub async fn soft_delete_message(
        &self,
        message_id: &str,
        deleted_by: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<DeleteOutcome, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<DeleteOutcome, AppError> = async {
            let message = sqlx::query_as::<_, Message>(
                "SELECT * FROM messages WHERE id = ? AND is_deleted = 0",
            )
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(AppError::NotFound)?;

            sqlx::query(
                r#"
                UPDATE messages
                SET content = ?, is_deleted = 1, deleted_at = ?, deleted_by = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(TOMBSTONE_CONTENT)
            .bind(deleted_at)
            .bind(deleted_by)
            .bind(deleted_at)
            .bind(message_id)
            .execute(&mut *conn)
            .await?;

            sqlx::query("DELETE FROM message_attachments WHERE message_id = ?")
                .bind(message_id)
                .execute(&mut *conn)
                .await?;

            let unread = sqlx::query_as::<_, UnreadCount>(
                r#"
                UPDATE conversation_participants SET unread_count = unread_count - 1
                WHERE conversation_id = ? AND user_id != ? AND unread_count > 0 AND last_seen < ?
                RETURNING user_id, unread_count
                "#,
            )
            .bind(&message.conversation_id)
            .bind(&message.sender_id)
            .bind(message.created_at)
            .fetch_all(&mut *conn)
            .await?;

            let last_message_id = sqlx::query_scalar::<_, Option<String>>(
                "SELECT last_message_id FROM conversations WHERE id = ?",
            )
            .bind(&message.conversation_id)
            .fetch_one(&mut *conn)
            .await?;

            let last_message_repaired = last_message_id.as_deref() == Some(message_id);
            if last_message_repaired {
                repair_last_message(&mut conn, &message.conversation_id).await?;
            }

            Ok(DeleteOutcome {
                unread,
                last_message_repaired,
            })
        }
        .await;

        finish_transaction(&mut conn, result).await
    }

    /// Apply a user's reaction to a message
    ///
    /// One reaction per user: a different emoji replaces the previous one,
    /// the same emoji toggles it off.
    pub async fn toggle_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<ReactionChange, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<ReactionChange, AppError> = async {
            let now = Utc::now();
            let existing = sqlx::query_scalar::<_, String>(
                "SELECT emoji FROM message_reactions WHERE message_id = ? AND user_id = ?",
            )
            .bind(message_id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;

            let change = match existing {
                Some(current) if current == emoji => {
                    sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
                        .bind(message_id)
                        .bind(user_id)
                        .execute(&mut *conn)
                        .await?;
                    ReactionChange::Removed
                }
                Some(_) => {
                    sqlx::query(
                        "UPDATE message_reactions SET emoji = ?, created_at = ? WHERE message_id = ? AND user_id = ?",
                    )
                    .bind(emoji)
                    .bind(now)
                    .bind(message_id)
                    .bind(user_id)
                    .execute(&mut *conn)
                    .await?;
                    ReactionChange::Replaced
                }
                None => {
                    sqlx::query(
                        "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(message_id)
                    .bind(user_id)
                    .bind(emoji)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                    ReactionChange::Added
                }
            };

            Ok(change)
        }
        .await;

        finish_transaction(&mut conn, result).await
    }
}

async fn insert_message_rows(conn: &mut SqliteConnection, message: &Message) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO messages (
            id, conversation_id, sender_id, content, message_type, reply_to_id,
            is_edited, edited_at, is_deleted, deleted_at, deleted_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.sender_id)
    .bind(&message.content)
    .bind(message.message_type)
    .bind(&message.reply_to_id)
    .bind(message.is_edited)
    .bind(message.edited_at)
    .bind(message.is_deleted)
    .bind(message.deleted_at)
    .bind(&message.deleted_by)
    .bind(message.created_at)
    .bind(message.updated_at)
    .execute(&mut *conn)
    .await?;

    for (position, attachment) in message.attachments.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO message_attachments (
                id, message_id, position, attachment_type, url, filename, size, mime_type
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(&message.id)
        .bind(position as i64)
        .bind(attachment.attachment_type)
        .bind(&attachment.url)
        .bind(&attachment.filename)
        .bind(attachment.size)
        .bind(&attachment.mime_type)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn repair_last_message(
    conn: &mut SqliteConnection,
    conversation_id: &str,
) -> Result<(), AppError> {
    let latest = sqlx::query_as::<_, (String, DateTime<Utc>)>(
        r#"
        SELECT id, created_at FROM messages
        WHERE conversation_id = ? AND is_deleted = 0
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#,
    )
    .bind(conversation_id)
    .fetch_optional(&mut *conn)
    .await?;

    match latest {
        Some((id, created_at)) => {
            sqlx::query("UPDATE conversations SET last_message_id = ?, last_message_at = ? WHERE id = ?")
                .bind(id)
                .bind(created_at)
                .bind(conversation_id)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            sqlx::query(
                "UPDATE conversations SET last_message_id = NULL, last_message_at = created_at WHERE id = ?",
            )
            .bind(conversation_id)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}
