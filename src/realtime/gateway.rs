//! WebSocket endpoint
//!
//! The bearer credential is checked before the upgrade; a failed check
//! answers 401 and no socket is ever opened.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::session::Session;
use crate::AppState;
use crate::auth::{Identity, authenticate_token, extract_token_from_headers};
use crate::error::AppError;
use crate::metrics::WS_CONNECTIONS_ACTIVE;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params
        .token
        .or_else(|| extract_token_from_headers(&headers))
    else {
        tracing::debug!("WebSocket connection rejected: no credential");
        return AppError::Unauthorized.into_response();
    };

    let identity = match authenticate_token(&token, &state).await {
        Ok(identity) => identity,
        Err(error) => {
            tracing::debug!(kind = error.kind(), "WebSocket connection rejected");
            return error.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(state, identity, socket))
}

async fn handle_socket(state: AppState, identity: Identity, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.config.realtime.outbound_buffer);

    let connection = state.hub.next_connection_id();
    let mut session = Session::new(state.clone(), identity, connection, tx);
    let mut evicted = session.open().await;
    WS_CONNECTIONS_ACTIVE.inc();

    // Writer: drains the outbound queue so publishers never wait on the socket
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%error, connection, "WebSocket receive failed");
                    break;
                }
            },
            _ = &mut writer => {
                tracing::debug!(connection, "WebSocket writer stopped");
                break;
            }
            _ = &mut evicted => {
                tracing::warn!(connection, "Closing connection that fell behind");
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
    WS_CONNECTIONS_ACTIVE.dec();
}
