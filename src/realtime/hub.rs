//! Event fan-out
//!
//! Connections subscribe to topics: a conversation room or a user's
//! personal channel. Each connection owns a bounded outbound queue;
//! delivery never waits on a slow client. A connection whose queue is
//! full is evicted from every topic and told to close, so the client
//! reconnects instead of silently missing events.
//!
//! With Redis configured every envelope goes through Redis pub/sub and
//! each process delivers what it receives to its own connections, so
//! users connected to different processes see the same events.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use super::ConnectionId;
use crate::error::AppError;
use crate::metrics::{EVENTS_DROPPED_TOTAL, EVENTS_PUBLISHED_TOTAL};

const CONVERSATION_PREFIX: &str = "conversation:";
const USER_PREFIX: &str = "user:";

/// A fan-out target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Everyone who joined the conversation room
    Conversation(String),
    /// Every connection of one user
    User(String),
}

impl Topic {
    pub fn channel(&self) -> String {
        match self {
            Topic::Conversation(id) => format!("{CONVERSATION_PREFIX}{id}"),
            Topic::User(id) => format!("{USER_PREFIX}{id}"),
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        if let Some(id) = channel.strip_prefix(CONVERSATION_PREFIX) {
            return Some(Topic::Conversation(id.to_string()));
        }
        channel
            .strip_prefix(USER_PREFIX)
            .map(|id| Topic::User(id.to_string()))
    }

    fn scope(&self) -> &'static str {
        match self {
            Topic::Conversation(_) => "conversation",
            Topic::User(_) => "user",
        }
    }
}

/// A serialized frame addressed to a topic
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Topic,
    /// Connection that must not receive this frame (typing echo)
    pub exclude: Option<ConnectionId>,
    pub payload: String,
}

impl Envelope {
    pub fn new(topic: Topic, payload: String) -> Self {
        Self {
            topic,
            exclude: None,
            payload,
        }
    }

    pub fn excluding(mut self, connection: ConnectionId) -> Self {
        self.exclude = Some(connection);
        self
    }
}

/// Envelope as relayed through Redis
///
/// Connection ids are process-local, so exclusion only applies on the
/// process that published.
#[derive(Debug, Serialize, Deserialize)]
struct RelayedEnvelope {
    origin: String,
    exclude: Option<ConnectionId>,
    payload: String,
}

struct RedisRelay {
    client: redis::Client,
    publisher: ConnectionManager,
}

type Subscribers = HashMap<ConnectionId, mpsc::Sender<String>>;

/// Topic registry for this process plus optional Redis relay
pub struct Hub {
    instance_id: String,
    next_connection: AtomicU64,
    topics: RwLock<HashMap<Topic, Subscribers>>,
    evictions: Mutex<HashMap<ConnectionId, oneshot::Sender<()>>>,
    relay: Option<RedisRelay>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Hub delivering to this process only
    pub fn new() -> Self {
        Self {
            instance_id: ulid::Ulid::new().to_string(),
            next_connection: AtomicU64::new(1),
            topics: RwLock::new(HashMap::new()),
            evictions: Mutex::new(HashMap::new()),
            relay: None,
        }
    }

    /// Hub relaying through Redis
    ///
    /// # Errors
    /// Returns error if the URL is invalid or Redis is unreachable
    pub async fn with_redis(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        tracing::info!("Real-time fan-out relayed through Redis");

        Ok(Self {
            relay: Some(RedisRelay { client, publisher }),
            ..Self::new()
        })
    }

    pub fn is_relayed(&self) -> bool {
        self.relay.is_some()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a live connection
    ///
    /// The receiver resolves if the hub evicts the connection; the owner
    /// must then close it.
    pub async fn register(&self, connection: ConnectionId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.evictions.lock().await.insert(connection, tx);
        rx
    }

    pub async fn subscribe(
        &self,
        topic: Topic,
        connection: ConnectionId,
        sender: mpsc::Sender<String>,
    ) {
        self.topics
            .write()
            .await
            .entry(topic)
            .or_default()
            .insert(connection, sender);
    }

    pub async fn unsubscribe(&self, topic: &Topic, connection: ConnectionId) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&connection);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Drop a connection from every topic and forget its registration
    pub async fn unsubscribe_all(&self, connection: ConnectionId) {
        let mut topics = self.topics.write().await;
        topics.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
        drop(topics);
        self.evictions.lock().await.remove(&connection);
    }

    pub async fn is_subscribed(&self, topic: &Topic, connection: ConnectionId) -> bool {
        self.topics
            .read()
            .await
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains_key(&connection))
    }

    /// Publish an envelope to every subscriber of its topic
    ///
    /// Falls back to local delivery if Redis publishing fails.
    pub async fn publish(&self, envelope: Envelope) {
        EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[envelope.topic.scope()])
            .inc();

        let Some(relay) = &self.relay else {
            self.deliver_local(&envelope.topic, envelope.exclude, &envelope.payload)
                .await;
            return;
        };

        let relayed = RelayedEnvelope {
            origin: self.instance_id.clone(),
            exclude: envelope.exclude,
            payload: envelope.payload.clone(),
        };
        let published = match serde_json::to_string(&relayed) {
            Ok(body) => {
                let mut publisher = relay.publisher.clone();
                publisher
                    .publish::<_, _, ()>(envelope.topic.channel(), body)
                    .await
                    .map_err(AppError::from)
            }
            Err(e) => Err(AppError::Internal(e.into())),
        };

        if let Err(error) = published {
            tracing::warn!(
                %error,
                channel = %envelope.topic.channel(),
                "Redis publish failed, delivering locally"
            );
            self.deliver_local(&envelope.topic, envelope.exclude, &envelope.payload)
                .await;
        }
    }

    /// Deliver a payload to this process's subscribers of a topic
    ///
    /// Closed queues are dropped from the topic. Full queues get their
    /// connection evicted from every topic and signalled to close.
    ///
    /// # Returns
    /// Number of connections the payload was queued for
    pub async fn deliver_local(
        &self,
        topic: &Topic,
        exclude: Option<ConnectionId>,
        payload: &str,
    ) -> usize {
        let mut evicted = Vec::new();
        let mut topics = self.topics.write().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|connection, sender| {
            if Some(*connection) == exclude {
                return true;
            }
            match sender.try_send(payload.to_string()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection, "Outbound queue full, evicting connection");
                    EVENTS_DROPPED_TOTAL.with_label_values(&["full"]).inc();
                    evicted.push(*connection);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    EVENTS_DROPPED_TOTAL.with_label_values(&["closed"]).inc();
                    false
                }
            }
        });

        topics.retain(|_, subscribers| {
            for connection in &evicted {
                subscribers.remove(connection);
            }
            !subscribers.is_empty()
        });
        drop(topics);

        if !evicted.is_empty() {
            let mut evictions = self.evictions.lock().await;
            for connection in evicted {
                if let Some(signal) = evictions.remove(&connection) {
                    let _ = signal.send(());
                }
            }
        }

        delivered
    }

    /// Receive relayed envelopes and deliver them locally
    ///
    /// Runs until the Redis connection ends. Returns immediately when no
    /// relay is configured.
    pub async fn run_redis_listener(&self) -> Result<(), AppError> {
        use futures::StreamExt;

        let Some(relay) = &self.relay else {
            return Ok(());
        };

        // PubSub requires a dedicated connection, not multiplexed
        #[allow(deprecated)]
        let conn = relay.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe(format!("{CONVERSATION_PREFIX}*")).await?;
        pubsub.psubscribe(format!("{USER_PREFIX}*")).await?;
        tracing::info!("Redis fan-out listener subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel: String = msg.get_channel_name().into();
            let Some(topic) = Topic::from_channel(&channel) else {
                continue;
            };
            let body: String = match msg.get_payload() {
                Ok(body) => body,
                Err(error) => {
                    tracing::warn!(%error, %channel, "Unreadable relayed payload");
                    continue;
                }
            };
            let relayed: RelayedEnvelope = match serde_json::from_str(&body) {
                Ok(relayed) => relayed,
                Err(error) => {
                    tracing::warn!(%error, %channel, "Malformed relayed envelope");
                    continue;
                }
            };

            let exclude = relayed.exclude.filter(|_| relayed.origin == self.instance_id);
            self.deliver_local(&topic, exclude, &relayed.payload).await;
        }

        tracing::warn!("Redis fan-out listener stopped");
        Ok(())
    }
}
