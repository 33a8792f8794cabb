//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Gauge, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_http_requests_total", "Total number of HTTP requests"),
        &["endpoint", "status"]
    ).expect("metric can be created");

    // Messaging Metrics
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_messages_sent_total", "Total number of messages sent"),
        &["type"]
    ).expect("metric can be created");
    pub static ref CONVERSATIONS_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_conversations_created_total", "Total number of conversations created"),
        &["type"]
    ).expect("metric can be created");

    // Real-time Metrics
    pub static ref WS_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "forumchat_ws_connections_active",
        "Current number of open WebSocket connections"
    ).expect("metric can be created");
    pub static ref WS_ACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_ws_actions_total", "Total number of WebSocket actions handled"),
        &["action", "outcome"]
    ).expect("metric can be created");
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_events_published_total", "Total number of real-time events published"),
        &["scope"]
    ).expect("metric can be created");
    pub static ref EVENTS_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_events_dropped_total", "Real-time events dropped for slow or closed connections"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref ONLINE_USERS: IntGauge = IntGauge::new(
        "forumchat_online_users",
        "Number of users with at least one open connection"
    ).expect("metric can be created");

    // Application Metrics
    pub static ref APP_UPTIME_SECONDS: Gauge = Gauge::new(
        "forumchat_app_uptime_seconds",
        "Application uptime in seconds"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forumchat_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; already registered collectors are skipped.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(MESSAGES_SENT_TOTAL.clone()),
        Box::new(CONVERSATIONS_CREATED_TOTAL.clone()),
        Box::new(WS_CONNECTIONS_ACTIVE.clone()),
        Box::new(WS_ACTIONS_TOTAL.clone()),
        Box::new(EVENTS_PUBLISHED_TOTAL.clone()),
        Box::new(EVENTS_DROPPED_TOTAL.clone()),
        Box::new(ONLINE_USERS.clone()),
        Box::new(APP_UPTIME_SECONDS.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(error) => tracing::warn!(%error, "Failed to register metric"),
        }
    }

    tracing::info!("Metrics registry initialized");
}
