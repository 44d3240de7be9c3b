//! WebSocket transport and HTTP publish endpoint
//!
//! Each connection gets a session from the registry. A reader loop feeds text
//! and binary frames to `Session::handle_command`; a writer task drains the
//! session's outbound queue. Either side stops as soon as the session leaves
//! `Active`.

use crate::auth::AdminKey;
use crate::server::dispatch::Dispatcher;
use crate::server::protocol::Payload;
use crate::server::registry::SubscriptionRegistry;
use crate::server::session::{CloseReason, SessionState};
use crate::topics::Topic;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on waiting for the writer to flush after the reader stops
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Dispatcher,
    pub queue_capacity: usize,
    pub admin_key: Option<AdminKey>,
}

/// Create the HTTP router
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_handler))
        .route("/v1/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let (session, mut rx) = state.registry.open_session(state.queue_capacity);
    let session_id = session.id();

    info!(session_id = %session_id, "WebSocket client connected");

    // Writer: outbound queue -> socket
    let mut writer_state = session.watch_state();
    let writer_session = session.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                _ = wait_inactive(&mut writer_state) => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let text = match msg.into_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to encode outbound message");
                    continue;
                }
            };

            if sender.send(Message::Text(text.into())).await.is_err() {
                writer_session.close(CloseReason::TransportClosed);
                break;
            }
        }

        let _ = sender.close().await;
    });

    // Reader: socket -> commands
    let mut reader_state = session.watch_state();
    loop {
        let frame = tokio::select! {
            _ = wait_inactive(&mut reader_state) => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let _ = session.handle_command(text.as_bytes()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                let _ = session.handle_command(&data).await;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // Handled automatically by axum
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.close(CloseReason::TransportClosed);

    if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    debug!(session_id = %session_id, "WebSocket client disconnected");
}

/// Resolves once the session is no longer active, or its state sender is gone
async fn wait_inactive(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s != SessionState::Active).await;
}

/// Body of `POST /v1/publish`
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub sequence: u64,
    pub matched: usize,
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn publish_handler(
    State(state): State<WsState>,
    headers: HeaderMap,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Response {
    let Some(admin_key) = &state.admin_key else {
        return error_response(StatusCode::FORBIDDEN, "Publishing over HTTP is disabled");
    };

    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| admin_key.matches_bearer(v));
    if !authorized {
        return error_response(StatusCode::UNAUTHORIZED, "Bad admin key");
    }

    let Json(request) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    let topic = match Topic::parse(&request.topic) {
        Ok(topic) => topic,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Bad Topic: {}", e)),
    };

    let payload = match Payload::from_value(&request.payload) {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let report = state.dispatcher.publish(&topic, payload);

    Json(PublishResponse {
        sequence: report.sequence,
        matched: report.matched,
        delivered: report.delivered,
    })
    .into_response()
}
