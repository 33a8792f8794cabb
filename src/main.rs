//! forumchat binary entry point

use forumchat::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize AppState
/// 4. Start the Redis listener when fan-out is relayed
/// 5. Build Axum router and start HTTP server
/// 6. On Ctrl-C, stop accepting requests and record presence
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("forumchat={},tower_http=debug", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting forumchat...");
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    forumchat::metrics::init_metrics();

    // 3. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 4. Background tasks
    if state.hub.is_relayed() {
        spawn_redis_listener(state.clone());
    }

    // 5. Build Axum router and serve
    let app = forumchat::build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    mark_connected_users_offline(&state).await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Record last seen for users still connected when the process stops
async fn mark_connected_users_offline(state: &AppState) {
    let now = chrono::Utc::now();
    for user_id in state.presence.online_users().await {
        state.presence.set_offline(&user_id).await;
        if let Err(error) = state.db.record_last_seen(&user_id, now).await {
            tracing::warn!(%error, %user_id, "Failed to record last seen");
        }
    }
}

/// Spawn the Redis pattern-subscription loop, restarting it after failures
fn spawn_redis_listener(state: AppState) {
    tokio::spawn(async move {
        let mut backoff = std::time::Duration::from_secs(1);
        loop {
            match state.hub.run_redis_listener().await {
                Ok(()) => {
                    tracing::warn!("Redis subscription stream ended; reconnecting");
                    backoff = std::time::Duration::from_secs(1);
                }
                Err(error) => {
                    tracing::error!(%error, "Redis listener failed");
                    backoff = (backoff * 2).min(std::time::Duration::from_secs(30));
                }
            }
            tokio::time::sleep(backoff).await;
        }
    });

    tracing::info!("Redis listener task spawned");
}
