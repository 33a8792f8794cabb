//! Presence Tracker
//!
//! Process-local registry of which users have open real-time connections.
//! Only online users are held in memory; the time a user went offline is
//! written to the user directory by the caller.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::metrics::ONLINE_USERS;
use crate::realtime::ConnectionId;

#[derive(Debug, Clone)]
struct PresenceEntry {
    connection: ConnectionId,
    connected_at: DateTime<Utc>,
}

/// User presence as seen by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub is_online: bool,
    /// Most recent connect while online
    pub last_seen: Option<DateTime<Utc>>,
}

/// In-memory user → connection registry
///
/// A user may hold several connections; the user is online while any
/// of them is open.
#[derive(Default)]
pub struct PresenceTracker {
    connections: RwLock<HashMap<String, Vec<PresenceEntry>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user
    ///
    /// Registering the same connection twice is a no-op.
    ///
    /// # Returns
    /// `true` if the user was offline before
    pub async fn set_online(&self, user_id: &str, connection: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let entries = connections.entry(user_id.to_string()).or_default();
        let came_online = entries.is_empty();
        if !entries.iter().any(|e| e.connection == connection) {
            entries.push(PresenceEntry {
                connection,
                connected_at: Utc::now(),
            });
        }
        ONLINE_USERS.set(connections.len() as i64);

        if came_online {
            tracing::debug!(user_id, "User online");
        }
        came_online
    }

    /// Remove a single connection of a user
    ///
    /// # Returns
    /// `true` if it was the user's last connection
    pub async fn remove_connection(&self, user_id: &str, connection: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(entries) = connections.get_mut(user_id) else {
            return false;
        };
        entries.retain(|e| e.connection != connection);
        let went_offline = entries.is_empty();
        if went_offline {
            connections.remove(user_id);
            tracing::debug!(user_id, "User offline");
        }
        ONLINE_USERS.set(connections.len() as i64);
        went_offline
    }

    /// Drop every connection of a user
    ///
    /// # Returns
    /// `true` if the user was online
    pub async fn set_offline(&self, user_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        let was_online = connections.remove(user_id).is_some();
        ONLINE_USERS.set(connections.len() as i64);
        was_online
    }

    /// Users with at least one open connection
    pub async fn online_users(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(user_id)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Time of the user's most recent connect, while online
    pub async fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.connections
            .read()
            .await
            .get(user_id)
            .and_then(|entries| entries.iter().map(|e| e.connected_at).max())
    }

    pub async fn snapshot(&self, user_id: &str) -> PresenceSnapshot {
        let last_seen = self.last_seen(user_id).await;
        PresenceSnapshot {
            is_online: last_seen.is_some(),
            last_seen,
        }
    }

    /// Presence of several users at once
    pub async fn online_among(&self, user_ids: &[String]) -> HashMap<String, bool> {
        let connections = self.connections.read().await;
        user_ids
            .iter()
            .map(|id| (id.clone(), connections.contains_key(id)))
            .collect()
    }
}
