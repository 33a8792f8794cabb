//! Common test utilities for E2E tests

use forumchat::auth::{Claims, Role, create_access_token};
use forumchat::data::{EntityId, User};
use forumchat::{AppState, config};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// A seeded user and their bearer token
#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: String,
    pub username: String,
    pub token: String,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_messaging(config::MessagingConfig::default()).await
    }

    pub async fn with_messaging(messaging: config::MessagingConfig) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "test.example.com".to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            auth: config::AuthConfig {
                token_secret: "test-secret-key-32-bytes-long!!!".to_string(),
                token_max_age: 3600,
            },
            messaging,
            realtime: config::RealtimeConfig::default(),
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = forumchat::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr.to_string(),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Seed a user into the directory and sign a token for them
    pub async fn create_user(&self, username: &str) -> TestUser {
        self.create_user_with_role(username, Role::User).await
    }

    pub async fn create_user_with_role(&self, username: &str, role: Role) -> TestUser {
        let user = User {
            id: EntityId::new().0,
            username: username.to_string(),
            avatar: None,
            role: serde_json::to_value(role)
                .unwrap()
                .as_str()
                .unwrap()
                .to_string(),
            is_online: false,
            last_seen: None,
            created_at: chrono::Utc::now(),
        };
        self.state.db.upsert_user(&user).await.unwrap();

        let claims = Claims::new(user.id.clone(), role, 3600);
        let token = create_access_token(&claims, &self.state.config.auth.token_secret)
            .expect("Failed to create test token");

        TestUser {
            id: user.id,
            username: user.username,
            token,
        }
    }

    /// POST /api/conversations and return the conversation id
    pub async fn create_conversation(&self, initiator: &TestUser, other: &TestUser) -> String {
        let response = self
            .client
            .post(self.url("/api/conversations"))
            .bearer_auth(&initiator.token)
            .json(&json!({ "participantId": other.id }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: Value = response.json().await.unwrap();
        body["data"]["id"].as_str().unwrap().to_string()
    }

    pub async fn send_message(&self, sender: &TestUser, conversation_id: &str, content: &str) -> Value {
        let response = self
            .client
            .post(self.url("/api/messages"))
            .bearer_auth(&sender.token)
            .json(&json!({ "conversationId": conversation_id, "content": content }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        body["data"].clone()
    }

    /// Open an authenticated WebSocket
    pub async fn connect(&self, user: &TestUser) -> Socket {
        let url = format!("ws://{}/ws?token={}", self.addr, user.token);
        let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        // The session registers itself after the handshake completes
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        socket
    }
}

/// Send one client frame
pub async fn send_frame(socket: &mut Socket, frame: Value) {
    send_raw(socket, &frame.to_string()).await;
}

pub async fn send_raw(socket: &mut Socket, text: &str) {
    socket.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next JSON text frame, failing after two seconds
pub async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(2), socket.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Skip frames until an event of the given name arrives
pub async fn next_event(socket: &mut Socket, event: &str) -> Value {
    loop {
        let frame = next_frame(socket).await;
        if frame["type"] == "event" && frame["event"] == event {
            return frame;
        }
    }
}

/// True when nothing arrives within the window
pub async fn stays_quiet(socket: &mut Socket, millis: u64) -> bool {
    tokio::time::timeout(std::time::Duration::from_millis(millis), socket.next())
        .await
        .is_err()
}
