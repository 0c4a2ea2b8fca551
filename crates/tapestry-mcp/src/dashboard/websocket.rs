//! WebSocket handler for real-time event streaming.
//!
//! Clients connect to `/ws` and receive every graph mutation as JSON,
//! plus heartbeats every 5 seconds with headline stats.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::events::DashboardEvent;
use super::state::AppState;

/// WebSocket upgrade handler — GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx: broadcast::Receiver<DashboardEvent> = state.subscribe();

    debug!("WebSocket client connected");

    let welcome = DashboardEvent::Connected {
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };
    if sender.send(Message::Text(welcome.to_json().into())).await.is_err() {
        return;
    }

    // Heartbeat task feeding through a channel so the main loop stays a
    // single select.
    let heartbeat_state = state.clone();
    let (heartbeat_tx, mut heartbeat_rx) = tokio::sync::mpsc::channel::<String>(16);
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let uptime = heartbeat_state.start_time.elapsed().as_secs();
            let (node_count, edge_count) = heartbeat_state
                .service
                .store()
                .stats()
                .map(|s| (s.node_count, s.active_edge_count))
                .unwrap_or((0, 0));
            let event = DashboardEvent::Heartbeat {
                uptime_secs: uptime,
                node_count,
                edge_count,
                timestamp: Utc::now(),
            };
            if heartbeat_tx.send(event.to_json()).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            // Graph event from the service bus
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if sender.send(Message::Text(event.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // Heartbeat
            Some(hb) = heartbeat_rx.recv() => {
                if sender.send(Message::Text(hb.into())).await.is_err() {
                    break;
                }
            }
            // Client messages (ping/pong, close)
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!("WebSocket received: {}", text);
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    heartbeat_handle.abort();
    debug!("WebSocket client disconnected");
}
