//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub messaging: MessagingConfig,
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "forum.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://forum.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Bearer token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret shared with the identity service (32+ bytes)
    pub token_secret: String,
    /// Token max age in seconds (default: 604800 = 7 days)
    pub token_max_age: i64,
}

/// Messaging rules
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    /// How long after sending a message may still be edited
    pub edit_window_seconds: i64,
    /// Maximum message length in characters
    pub max_content_length: usize,
    /// Maximum attachments per message
    pub max_attachments: usize,
    /// Maximum size of a single attachment in bytes
    pub max_attachment_bytes: i64,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Only friends may start a conversation
    #[serde(default)]
    pub require_friendship: bool,
    /// Moderators may archive/delete conversations they are not part of
    #[serde(default)]
    pub moderator_conversation_bypass: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            edit_window_seconds: 300,
            max_content_length: 2000,
            max_attachments: 10,
            max_attachment_bytes: 10 * 1024 * 1024,
            default_page_size: 20,
            max_page_size: 100,
            require_friendship: false,
            moderator_conversation_bypass: false,
        }
    }
}

impl MessagingConfig {
    pub fn edit_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.edit_window_seconds)
    }
}

/// Real-time gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Per-connection outbound queue capacity
    pub outbound_buffer: usize,
    /// Redis URL for cross-process fan-out (e.g. "redis://127.0.0.1/")
    ///
    /// When unset, events are delivered to connections of this process only.
    pub redis_url: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            redis_url: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FORUMCHAT__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/forumchat.db")?
            .set_default("auth.token_max_age", 604800)?
            .set_default("messaging.edit_window_seconds", 300)?
            .set_default("messaging.max_content_length", 2000)?
            .set_default("messaging.max_attachments", 10)?
            .set_default("messaging.max_attachment_bytes", 10 * 1024 * 1024)?
            .set_default("messaging.default_page_size", 20)?
            .set_default("messaging.max_page_size", 100)?
            .set_default("messaging.require_friendship", false)?
            .set_default("messaging.moderator_conversation_bypass", false)?
            .set_default("realtime.outbound_buffer", 256)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FORUMCHAT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;
        const MIN_TOKEN_SECRET_BYTES: usize = 32;

        if self.auth.token_secret.as_bytes().len() < MIN_TOKEN_SECRET_BYTES {
            return Err(AppError::Config(format!(
                "auth.token_secret must be at least {} bytes",
                MIN_TOKEN_SECRET_BYTES
            )));
        }

        if self.auth.token_max_age <= 0 {
            return Err(AppError::Config(
                "auth.token_max_age must be greater than 0".to_string(),
            ));
        }

        let messaging = &self.messaging;
        if messaging.edit_window_seconds <= 0 {
            return Err(AppError::Config(
                "messaging.edit_window_seconds must be greater than 0".to_string(),
            ));
        }
        if messaging.max_content_length == 0 {
            return Err(AppError::Config(
                "messaging.max_content_length must be greater than 0".to_string(),
            ));
        }
        if messaging.default_page_size == 0 || messaging.max_page_size < messaging.default_page_size
        {
            return Err(AppError::Config(
                "messaging.max_page_size must be >= messaging.default_page_size > 0".to_string(),
            ));
        }

        if self.realtime.outbound_buffer == 0 {
            return Err(AppError::Config(
                "realtime.outbound_buffer must be greater than 0".to_string(),
            ));
        }

        if messaging.moderator_conversation_bypass {
            tracing::warn!("Moderators may archive and delete conversations they do not belong to");
        }

        Ok(())
    }
}
