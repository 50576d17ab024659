//! Axum router: the `/rooms/{roomId}` sync endpoint and a `/health` liveness
//! route. Ties `RoomManager` and `SyncSession` to an actual WebSocket.
//!
//! Grounded on the teacher's axum usage throughout (`src/api.rs`, the
//! `tower-http` trace layer) and the `ws` feature the teacher's Cargo.toml
//! already pulls in.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::room::RoomManager;
use crate::session::{SessionAction, SyncSession};

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomManager>,
}

pub fn router(rooms: Arc<RoomManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms/:room_id", get(ws_upgrade))
        .with_state(AppState { rooms })
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, state.rooms))
}

/// Drive one accepted WebSocket end to end: join, send the initial
/// handshake solicitation, relay frames through `SyncSession`, and leave on
/// close.
async fn handle_socket(socket: WebSocket, room_id: String, rooms: Arc<RoomManager>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let connection_id = uuid::Uuid::new_v4().to_string();

    let Some(joined) = rooms.join(&room_id, connection_id.clone(), outbound_tx).await else {
        warn!(room = %room_id, "rejected join for unknown room (integrated mode)");
        return;
    };

    let session = SyncSession::new(joined.room.clone());
    let (mut ws_tx, mut ws_rx) = socket.split();

    for frame in session.initial_frames().await {
        if ws_tx.send(Message::Binary(frame)).await.is_err() {
            rooms.leave(&room_id, &connection_id).await;
            return;
        }
    }

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %connection_id, error = %e, "websocket receive error");
                break;
            }
        };

        match msg {
            Message::Binary(data) => match session.handle_frame(&data).await {
                Ok(SessionAction::ReplyToSender(frames)) => {
                    for frame in frames {
                        let _ = joined.room.send_to(&connection_id, frame).await;
                    }
                }
                Ok(SessionAction::None) => {}
                Ok(SessionAction::CloseConnection) | Err(_) => break,
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    rooms.leave(&room_id, &connection_id).await;
}

/// Block until SIGINT/SIGTERM, then run `shutdown`. Mirrors the teacher's
/// graceful-shutdown expectations (§6.2): stop accepting, drain, destroy the
/// room manager, exit 0.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Give in-flight sessions a moment to drain after the listener stops
/// accepting new connections, then destroy the room manager.
pub async fn graceful_shutdown(rooms: Arc<RoomManager>, drain: Duration) {
    tokio::time::sleep(drain).await;
    rooms.destroy().await;
}
