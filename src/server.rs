//! Embedded HTTP server
//!
//! One listener carries both surfaces: the `/ws/streamkit` WebSocket
//! ingestion endpoint and the admin endpoints (`/health`, `/metrics`,
//! `/status`). Admission happens before the upgrade: a missing or empty
//! `X-API-Key` header is rejected with 401.

// Axum handlers must be async even when they never await.
#![allow(clippy::unused_async)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::gate::{Gate, MessageEvent};
use crate::metrics::RelayMetrics;
use crate::transformer::Transformer;
use crate::updater::Updater;

/// Shared handles the HTTP surface reads from
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<Gate>,
    pub metrics: Arc<RelayMetrics>,
    pub transformer: Arc<Transformer>,
    pub updater: Arc<Updater>,
    pub started_at: Instant,
    pub cancel: CancellationToken,
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/ws/streamkit", get(ws_upgrade))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = router(state);

    let server = axum::Server::try_bind(&addr)
        .map_err(|err| RelayError::Bind { addr: addr.to_string(), source: Box::new(err) })?;

    info!("relay server listening on {}", addr);

    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| RelayError::Server { source: err })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let connections = state.gate.active_connections().await;
    Json(json!({
        "status": "healthy",
        "timestamp": unix_seconds(),
        "connections": connections,
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => {
            ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let active_connections = state.gate.active_connections().await;
    let sessions = state.gate.bound_sessions().await;

    Json(json!({
        "active_connections": active_connections,
        "sessions": sessions,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pipeline": {
            "active_sessions": state.transformer.active_sessions(),
            "queue_length": state.updater.queue_len(),
            "tracked_meshes": state.updater.tracked_meshes(),
        },
    }))
}

/// Admission check plus WebSocket upgrade.
///
/// Any non-empty API key is accepted here; real authentication lives behind
/// the relay.
async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if api_key.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing API key").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, api_key))
}

/// Per-connection read loop feeding the gate's fan-in queue.
async fn handle_socket(mut socket: WebSocket, state: AppState, api_key: String) {
    let connection_id = state.gate.register(&api_key).await;

    loop {
        let message = tokio::select! {
            _ = state.cancel.cancelled() => break,
            message = socket.recv() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str(&text) {
                    Ok(packet) => {
                        state.gate.record_packet(&connection_id, &packet).await;
                        state.gate.forward(MessageEvent {
                            connection_id: connection_id.clone(),
                            packet,
                            received_at: Instant::now(),
                        });
                    }
                    Err(err) => {
                        // A malformed frame is fatal for the connection.
                        info!(
                            "failed to decode frame from {}: {}",
                            connection_id,
                            RelayError::frame_decode(err.to_string())
                        );
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::ERROR,
                                reason: "malformed frame".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("websocket closed normally: {}", connection_id);
                break;
            }
            Some(Ok(_)) => {
                // Binary, ping and pong frames carry no packets.
                debug!("ignoring non-text frame from {}", connection_id);
            }
            Some(Err(err)) => {
                info!("websocket read error on {}: {}", connection_id, err);
                break;
            }
            None => break,
        }
    }

    state.gate.unregister(&connection_id).await;
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
