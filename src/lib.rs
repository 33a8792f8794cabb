//! forumchat - Real-time private messaging for the recipe forum
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Gateway Layer (Axum + WebSocket)              │
//! │  - /ws real-time protocol (actions, acks, events)           │
//! │  - /api REST facade                                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Conversation lifecycle and unread accounting             │
//! │  - Messages, edits, reactions, read receipts                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Presence tracker (in memory)                             │
//! │  - Fan-out hub (local, optionally relayed through Redis)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `realtime`: WebSocket gateway, fan-out hub and notifications
//! - `service`: Business logic layer
//! - `presence`: Online tracking
//! - `data`: Database layer
//! - `auth`: Bearer token verification
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod realtime;
pub mod service;

use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
///
/// Cloned for each request and each WebSocket connection.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Connections per user (volatile)
    pub presence: Arc<presence::PresenceTracker>,

    /// Topic subscriptions and fan-out
    pub hub: Arc<realtime::Hub>,

    pub conversations: Arc<service::ConversationService>,
    pub messages: Arc<service::MessageService>,

    /// Builds client-facing views
    pub projector: Arc<service::Projector>,

    /// Turns engine outcomes into events
    pub notifier: Arc<realtime::Notifier>,

    pub started_at: Instant,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the fan-out hub (Redis relay when configured)
    /// 3. Wire the messaging services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Fan-out hub
        let hub = match config.realtime.redis_url.as_deref() {
            Some(url) => {
                let hub = realtime::Hub::with_redis(url).await?;
                tracing::info!("Fan-out relayed through Redis");
                hub
            }
            None => realtime::Hub::new(),
        };
        let hub = Arc::new(hub);

        // 3. Services
        let presence = Arc::new(presence::PresenceTracker::new());
        let policy = service::policy_from_config(&config.messaging, db.clone());
        let conversations = Arc::new(service::ConversationService::new(
            db.clone(),
            policy,
            config.messaging.clone(),
        ));
        let messages = Arc::new(service::MessageService::new(
            db.clone(),
            config.messaging.clone(),
        ));
        let projector = Arc::new(service::Projector::new(db.clone(), presence.clone()));
        let notifier = Arc::new(realtime::Notifier::new(hub.clone(), projector.clone()));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            presence,
            hub,
            conversations,
            messages,
            projector,
            notifier,
            started_at: Instant::now(),
        })
    }
}

/// Upper bound on REST request bodies; attachments are references, not uploads
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .route("/ws", axum::routing::get(realtime::ws_handler))
        .nest("/api", api::messaging_router())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state.clone())
        .merge(api::metrics_router(state))
        .route_layer(axum::middleware::from_fn(api::metrics::track_http_requests))
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
