//! Signaling socket handler.
//!
//! Clients connect to `GET /ws`. Each socket is registered with the hub,
//! which hands back a bounded outbound queue. The socket task forwards that
//! queue to the client, feeds inbound text frames to the router, and sends
//! a keep-alive `Ping` on a fixed interval. When the hub drops the queue
//! (idle reaper) or the client goes away, the connection is unregistered.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parlor_types::ServerFrame;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Upgrade an HTTP request to a signaling connection.
///
/// # Route
///
/// `GET /ws`
pub async fn ws_signaling(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    let hub = &state.hub;
    let (handle, mut outbound) = hub.connect().await;
    info!(handle = %handle, "signaling connection opened");

    let (mut sink, mut stream) = socket.split();

    let connected = ServerFrame::Connected {
        client_handle: handle,
        server_time: Utc::now(),
    };
    match connected.to_text() {
        Ok(text) => {
            if sink.send(Message::Text(text.into())).await.is_err() {
                hub.disconnect(handle).await;
                return;
            }
        }
        Err(e) => warn!(handle = %handle, error = %e, "failed to serialize connected frame"),
    }

    let mut keepalive = tokio::time::interval(hub.config().keepalive_interval());
    // The first tick fires immediately.
    keepalive.tick().await;

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(text) = queued else {
                    debug!(handle = %handle, "outbound queue closed");
                    break;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    debug!(handle = %handle, "send failed");
                    break;
                }
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!(handle = %handle, "keep-alive ping failed");
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => hub.receive(handle, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => hub.touch(handle).await,
                    Some(Err(e)) => {
                        debug!(handle = %handle, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(handle).await;
    if let Err(e) = sink.close().await {
        debug!(handle = %handle, error = %e, "socket close failed");
    }
    info!(handle = %handle, "signaling connection closed");
}
