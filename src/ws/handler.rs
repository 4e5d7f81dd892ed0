//! Axum upgrade entry point wiring a raw socket into [`Gateway`].
//!
//! Kept deliberately thin: everything that's unit-testable (auth, room
//! membership, the state machine) lives in [`super::gateway`] without an
//! HTTP dependency. This module is the seam where a real request becomes
//! a `connection_id` and a socket task.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use log::debug;
use uuid::Uuid;

use super::gateway::Gateway;

/// Handle one upgraded socket end to end: register it, pump inbound
/// frames into the gateway, and forward queued outbound frames back out,
/// until the peer disconnects.
pub async fn serve_connection(gateway: Arc<Gateway>, path: String, query: HashMap<String, String>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let connection_id = Uuid::new_v4().to_string();

    let registered = gateway
        .upgrade(&path, query, HashMap::new(), tx, connection_id.clone())
        .await;
    if registered.is_err() {
        let _ = sink.close().await;
        return;
    }

    let outbound = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let Ok(message) = frame else {
            break;
        };
        let result = match message {
            Message::Text(text) => gateway.handle_text_message(&connection_id, &text).await,
            Message::Binary(bytes) => gateway.handle_binary_message(&connection_id, bytes).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => Ok(()),
        };
        if let Err(e) = result {
            let _ = gateway.report_error(&connection_id, e.to_string()).await;
        }
    }

    debug!("connection {} disconnected", connection_id);
    let _ = gateway.close(&connection_id).await;
    outbound.abort();
}

/// Axum handler suitable for `Router::new().route("/ws/:path", get(upgrade_handler))`.
pub async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<HashMap<String, String>>,
    axum::extract::OriginalUri(uri): axum::extract::OriginalUri,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    ws.on_upgrade(move |socket| serve_connection(gateway, path, query, socket))
}
