//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::{MatchedPath, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::auth::require_auth;
use crate::metrics::{APP_UPTIME_SECONDS, HTTP_REQUESTS_TOTAL, REGISTRY};

/// Metrics in Prometheus text format
async fn metrics_handler(State(state): State<AppState>) -> Response {
    APP_UPTIME_SECONDS.set(state.started_at.elapsed().as_secs_f64());

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// `/metrics`, behind bearer authentication
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

/// Count every routed HTTP request by route template and response status
pub async fn track_http_requests(request: Request, next: Next) -> Response {
    let endpoint = match request.extensions().get::<MatchedPath>() {
        Some(path) => format!("{} {}", request.method(), path.as_str()),
        None => request.method().to_string(),
    };

    let response = next.run(request).await;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[endpoint.as_str(), response.status().as_str()])
        .inc();

    response
}
