//! Viewer WebSocket endpoints.
//!
//! Each connection owns a bounded channel registered with the fan-out
//! plane; events are serialized one JSON object per text frame.  The
//! subscriber is detached when the socket closes, whichever side closes
//! first.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use crate::events::ViewerEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Events buffered per viewer before the fan-out starts dropping.
const VIEWER_BUFFER: usize = 256;

pub async fn ws_global_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_global_socket(socket, state))
}

async fn handle_global_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = mpsc::channel(VIEWER_BUFFER);
    let viewer_id = state.fanout.attach_global(tx).await;
    debug!(viewer_id, "global viewer connected");
    forward_events(socket, rx).await;
    state.fanout.detach_global(viewer_id).await;
    debug!(viewer_id, "global viewer disconnected");
}

pub async fn ws_logs_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs_socket(socket, state, node_id))
}

async fn handle_logs_socket(socket: WebSocket, state: AppState, node_id: String) {
    let (tx, rx) = mpsc::channel(VIEWER_BUFFER);
    let viewer_id = state.fanout.attach_log(&node_id, tx).await;
    debug!(viewer_id, node_id = %node_id, "log viewer connected");
    forward_events(socket, rx).await;
    state.fanout.detach_log(&node_id, viewer_id).await;
    debug!(viewer_id, node_id = %node_id, "log viewer disconnected");
}

async fn forward_events(mut socket: WebSocket, mut rx: mpsc::Receiver<ViewerEvent>) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
