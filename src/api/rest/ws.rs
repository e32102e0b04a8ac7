use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::Load;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SnapshotFrame<'a> {
    Snapshot { as_of: u64, loads: &'a [Load] },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Sends the snapshot frame, then hub messages in sequence order. The
/// socket is closed after a resync notice or when the hub stops forwarding.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let registration = match state.hub.register().await {
        Ok(registration) => registration,
        Err(err) => {
            warn!(error = %err, "failed to register websocket client");
            return;
        }
    };
    let (client_id, snapshot, mut events) = registration.into_parts();
    let (mut sender, mut receiver) = socket.split();

    info!(client_id = %client_id, "websocket client connected");

    let mut send_task = tokio::spawn(async move {
        let frame = SnapshotFrame::Snapshot {
            as_of: snapshot.as_of,
            loads: &snapshot.loads,
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize snapshot for ws");
                return;
            }
        };
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }

        while let Some(message) = events.next().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize hub message for ws");
                    break;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                return;
            }
        }

        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(client_id);
    info!(client_id = %client_id, "websocket client disconnected");
}
